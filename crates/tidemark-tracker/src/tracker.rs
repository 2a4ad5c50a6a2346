//! Per-transfer completion tracking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tidemark_events::Latch;
use tidemark_transfer_core::{PieceState, Transfer};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::error::GeometryError;
use crate::index::PieceFileIndex;
use crate::stream::{self, EventStream};

const SEED_POLL_FLOOR: Duration = Duration::from_secs(1);
const SEED_POLL_SPREAD: Duration = Duration::from_secs(15);

/// Per-transfer state machine deriving file, download, and seeding
/// completion from the engine's piece-completion feed.
///
/// Every lifecycle condition is exposed as a [`Latch`]. A background worker
/// triggers them as completion is confirmed; the worker terminates through
/// the `closed` latch the moment the transfer closes, whatever stage it was
/// in, and produces nothing after that.
pub struct TransferTracker {
    transfer: Arc<dyn Transfer>,
    config: TrackerConfig,
    added: Latch,
    got_info: Latch,
    download_done: Latch,
    seeding_done: Latch,
    closed: Latch,
    signals_ready: Latch,
    piece_done: RwLock<HashMap<u32, Latch>>,
    file_done: RwLock<HashMap<String, Latch>>,
    file_pieces: RwLock<HashMap<String, Vec<u32>>>,
    failure: RwLock<Option<GeometryError>>,
}

impl TransferTracker {
    /// Start tracking `transfer`.
    ///
    /// The piece-completion feed is subscribed before this returns, so
    /// completions racing with construction are never lost. The `added`
    /// latch triggers immediately: a tracker only exists for a transfer the
    /// engine has admitted.
    #[must_use]
    pub fn new(transfer: Arc<dyn Transfer>, config: TrackerConfig) -> Arc<Self> {
        let feed = transfer.subscribe_piece_states();
        let tracker = Arc::new(Self {
            transfer,
            config,
            added: Latch::new(),
            got_info: Latch::new(),
            download_done: Latch::new(),
            seeding_done: Latch::new(),
            closed: Latch::new(),
            signals_ready: Latch::new(),
            piece_done: RwLock::new(HashMap::new()),
            file_done: RwLock::new(HashMap::new()),
            file_pieces: RwLock::new(HashMap::new()),
            failure: RwLock::new(None),
        });
        tracker.added.trigger();
        tokio::spawn(run(Arc::clone(&tracker), feed));
        tracker
    }

    /// Triggered on construction: the transfer has been admitted.
    #[must_use]
    pub fn added(&self) -> Latch {
        self.added.clone()
    }

    /// Triggered once the transfer's metadata is available.
    #[must_use]
    pub fn got_info(&self) -> Latch {
        self.got_info.clone()
    }

    /// Signal for one piece, or `None` for an unknown index.
    ///
    /// Piece signals exist only once metadata is known.
    #[must_use]
    pub fn piece_done(&self, index: u32) -> Option<Latch> {
        self.piece_done
            .read()
            .expect("piece signal map poisoned")
            .get(&index)
            .cloned()
    }

    /// Signal for one file, or `None` for an unknown path.
    ///
    /// File signals exist only once metadata is known.
    #[must_use]
    pub fn file_done(&self, path: &str) -> Option<Latch> {
        self.file_done
            .read()
            .expect("file signal map poisoned")
            .get(path)
            .cloned()
    }

    /// Triggered when every file has completed and no bytes are missing.
    #[must_use]
    pub fn download_done(&self) -> Latch {
        self.download_done.clone()
    }

    /// Triggered when the seed target is met, or immediately after the
    /// download when seed tracking is disabled.
    #[must_use]
    pub fn seeding_done(&self) -> Latch {
        self.seeding_done.clone()
    }

    /// Triggered when the transfer closes; terminal.
    #[must_use]
    pub fn closed(&self) -> Latch {
        self.closed.clone()
    }

    /// The transfer being tracked.
    #[must_use]
    pub fn transfer(&self) -> Arc<dyn Transfer> {
        Arc::clone(&self.transfer)
    }

    /// The configuration captured at construction.
    #[must_use]
    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// The geometry defect that aborted tracking, if any.
    ///
    /// A tracker whose transfer reported malformed geometry terminates
    /// through the `closed` path; the defect stays queryable here.
    #[must_use]
    pub fn failure(&self) -> Option<GeometryError> {
        self.failure.read().expect("failure slot poisoned").clone()
    }

    /// Ordered lifecycle events for one subscriber.
    ///
    /// Triggering `cancel` silently ends the stream without a synthetic
    /// `Closed` event.
    #[must_use]
    pub fn events(self: Arc<Self>, cancel: Latch) -> EventStream {
        stream::subscribe(self, cancel)
    }

    /// Triggered once the per-piece and per-file signal maps are populated.
    pub(crate) fn signals_ready(&self) -> Latch {
        self.signals_ready.clone()
    }

    /// Known piece indices, ascending. Empty before `signals_ready`.
    pub(crate) fn piece_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .piece_done
            .read()
            .expect("piece signal map poisoned")
            .keys()
            .copied()
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Full file -> overlapping-pieces adjacency. Empty before
    /// `signals_ready`.
    pub(crate) fn file_piece_map(&self) -> HashMap<String, Vec<u32>> {
        self.file_pieces
            .read()
            .expect("file adjacency map poisoned")
            .clone()
    }

    fn trigger_piece_signal(&self, index: u32) -> bool {
        match self
            .piece_done
            .read()
            .expect("piece signal map poisoned")
            .get(&index)
        {
            Some(latch) => {
                latch.trigger();
                true
            }
            None => false,
        }
    }

    fn trigger_file_signal(&self, path: &str) {
        if let Some(latch) = self
            .file_done
            .read()
            .expect("file signal map poisoned")
            .get(path)
        {
            latch.trigger();
        }
    }
}

async fn run(tracker: Arc<TransferTracker>, mut feed: mpsc::UnboundedReceiver<PieceState>) {
    let transfer = tracker.transfer();
    let transfer_id = transfer.id();
    let metadata_ready = transfer.metadata_ready();
    let transfer_closed = transfer.closed();

    // Metadata or closure, whichever lands first. A transfer closed before
    // its metadata never proceeds past this point: only `closed` triggers.
    tokio::select! {
        () = metadata_ready.wait() => tracker.got_info.trigger(),
        () = transfer_closed.wait() => {
            debug!(transfer_id = %transfer_id, "transfer closed before metadata");
            tracker.closed.trigger();
            return;
        }
    }
    info!(transfer_id = %transfer_id, "transfer metadata ready");

    let files = transfer.files();
    let pieces = transfer.pieces();
    let index = match PieceFileIndex::build(&files, &pieces) {
        Ok(index) => index,
        Err(err) => {
            error!(transfer_id = %transfer_id, error = %err, "transfer geometry rejected");
            *tracker.failure.write().expect("failure slot poisoned") = Some(err);
            tracker.closed.trigger();
            return;
        }
    };

    // One signal per piece and per file. Zero-length entries are trivially
    // complete and trigger immediately.
    {
        let mut piece_done = tracker
            .piece_done
            .write()
            .expect("piece signal map poisoned");
        for piece in &pieces {
            let latch = Latch::new();
            if piece.length == 0 {
                latch.trigger();
            }
            piece_done.insert(piece.index, latch);
        }
    }
    {
        let mut file_done = tracker.file_done.write().expect("file signal map poisoned");
        let mut file_pieces = tracker
            .file_pieces
            .write()
            .expect("file adjacency map poisoned");
        for file in &files {
            let latch = Latch::new();
            if file.length == 0 {
                latch.trigger();
            }
            file_done.insert(file.path.clone(), latch);
            file_pieces.insert(
                file.path.clone(),
                index.file_pieces.get(&file.path).cloned().unwrap_or_default(),
            );
        }
    }
    tracker.signals_ready.trigger();

    // Working sets shrink as completion is confirmed. They are owned by
    // this worker alone; the signal maps above are the shared surface.
    let mut incomplete_file_pieces: HashMap<String, HashSet<u32>> = index
        .file_pieces
        .iter()
        .map(|(path, indices)| (path.clone(), indices.iter().copied().collect()))
        .collect();
    let mut incomplete_piece_files: HashMap<u32, Vec<String>> =
        index.piece_files.into_iter().collect();

    // Retire pieces the engine already reports complete. The feed was
    // subscribed before this scan, so anything completing in between is
    // seen by both paths; signal triggering is idempotent.
    for piece in pieces.iter().filter(|piece| piece.length > 0) {
        if transfer.piece_complete(piece.index) {
            tracker.trigger_piece_signal(piece.index);
            retire_piece(
                &tracker,
                piece.index,
                &mut incomplete_file_pieces,
                &mut incomplete_piece_files,
            );
        }
    }

    if transfer.bytes_missing() == 0 {
        finish_download(
            &tracker,
            &mut incomplete_file_pieces,
            &mut incomplete_piece_files,
        );
        info!(transfer_id = %transfer_id, "download already complete");
    } else {
        loop {
            let state = tokio::select! {
                state = feed.recv() => state,
                () = transfer_closed.wait() => None,
            };
            let Some(state) = state else {
                debug!(transfer_id = %transfer_id, "piece feed ended, transfer closed");
                tracker.closed.trigger();
                return;
            };
            if !state.complete {
                continue;
            }
            if !tracker.trigger_piece_signal(state.index) {
                warn!(
                    transfer_id = %transfer_id,
                    piece = state.index,
                    "completion notification for unknown piece"
                );
                continue;
            }
            debug!(transfer_id = %transfer_id, piece = state.index, "piece complete");
            retire_piece(
                &tracker,
                state.index,
                &mut incomplete_file_pieces,
                &mut incomplete_piece_files,
            );
            if transfer.bytes_missing() == 0 {
                finish_download(
                    &tracker,
                    &mut incomplete_file_pieces,
                    &mut incomplete_piece_files,
                );
                info!(transfer_id = %transfer_id, "download complete");
                break;
            }
        }
    }

    // Seed phase. The ratio is captured from the construction-time
    // configuration; later configuration changes have no effect.
    let ratio = tracker.config.seed_ratio;
    if ratio <= 0.0 || !transfer.seeding() {
        tracker.seeding_done.trigger();
    } else {
        info!(transfer_id = %transfer_id, ratio, "entering seed phase");
        loop {
            let wait = seed_wait(transfer.as_ref(), ratio);
            tokio::select! {
                () = transfer_closed.wait() => {
                    tracker.closed.trigger();
                    return;
                }
                () = tokio::time::sleep(wait) => {
                    if seed_target_met(transfer.as_ref(), ratio) {
                        tracker.seeding_done.trigger();
                        info!(transfer_id = %transfer_id, ratio, "seed target met");
                        break;
                    }
                }
            }
        }
    }

    // Only closure remains.
    transfer_closed.wait().await;
    tracker.closed.trigger();
}

/// Confirm a piece: discard it from every overlapping file's incomplete
/// set and trigger the signal of any file whose set drains.
fn retire_piece(
    tracker: &TransferTracker,
    index: u32,
    incomplete_file_pieces: &mut HashMap<String, HashSet<u32>>,
    incomplete_piece_files: &mut HashMap<u32, Vec<String>>,
) {
    let Some(paths) = incomplete_piece_files.remove(&index) else {
        return;
    };
    for path in paths {
        let Some(remaining) = incomplete_file_pieces.get_mut(&path) else {
            continue;
        };
        remaining.remove(&index);
        if remaining.is_empty() {
            incomplete_file_pieces.remove(&path);
            tracker.trigger_file_signal(&path);
        }
    }
}

/// Trigger every outstanding piece and file signal, then `download_done`.
///
/// File signals always precede the download signal, preserving the
/// file-then-download ordering for observers.
fn finish_download(
    tracker: &TransferTracker,
    incomplete_file_pieces: &mut HashMap<String, HashSet<u32>>,
    incomplete_piece_files: &mut HashMap<u32, Vec<String>>,
) {
    for index in incomplete_piece_files.keys() {
        tracker.trigger_piece_signal(*index);
    }
    incomplete_piece_files.clear();
    for path in incomplete_file_pieces.keys() {
        tracker.trigger_file_signal(path);
    }
    incomplete_file_pieces.clear();
    tracker.download_done.trigger();
}

/// Whether the written/completed ratio has reached the target.
#[allow(clippy::cast_precision_loss)]
fn seed_target_met(transfer: &dyn Transfer, ratio: f64) -> bool {
    let completed = transfer.bytes_completed();
    if completed == 0 {
        return true;
    }
    transfer.stats().bytes_written as f64 / completed as f64 >= ratio
}

/// Poll interval proportional to the remaining distance to the target:
/// the closer the ratio, the shorter the wait, clamping to zero once met.
#[allow(clippy::cast_precision_loss)]
fn seed_wait(transfer: &dyn Transfer, ratio: f64) -> Duration {
    let target = transfer.total_bytes() as f64 * ratio;
    if target <= 0.0 {
        return Duration::ZERO;
    }
    let progress = transfer.stats().bytes_written as f64 / target;
    if progress >= 1.0 {
        return Duration::ZERO;
    }
    SEED_POLL_FLOOR + SEED_POLL_SPREAD.mul_f64(1.0 - progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_events::{TransferFile, TransferStats};
    use tidemark_transfer_core::{PieceSpan, StubTransfer};
    use tokio::time::timeout;
    use uuid::Uuid;

    async fn assert_triggers(latch: &Latch) {
        timeout(Duration::from_secs(1), latch.wait())
            .await
            .expect("signal should trigger");
    }

    async fn assert_stays_open(latch: &Latch) {
        assert!(
            timeout(Duration::from_millis(50), latch.wait())
                .await
                .is_err(),
            "signal should stay open"
        );
    }

    #[tokio::test]
    async fn added_triggers_on_construction() {
        let transfer = StubTransfer::new("pending");
        let tracker = TransferTracker::new(transfer, TrackerConfig::default());
        assert!(tracker.added().is_triggered());
        assert_stays_open(&tracker.got_info()).await;
    }

    #[tokio::test]
    async fn unknown_piece_notifications_are_ignored() {
        let transfer = StubTransfer::with_layout("unknown-piece", &[("a", 10)], 10);
        let tracker = TransferTracker::new(transfer.clone(), TrackerConfig::default());
        assert_triggers(&tracker.signals_ready()).await;

        transfer.complete_piece(99);
        assert_stays_open(&tracker.download_done()).await;

        transfer.complete_piece(0);
        assert_triggers(&tracker.download_done()).await;
    }

    /// A transfer whose files overlap; the index must reject it.
    struct MisalignedTransfer {
        id: Uuid,
        metadata_ready: Latch,
        closed: Latch,
    }

    impl MisalignedTransfer {
        fn new() -> Arc<Self> {
            let metadata_ready = Latch::new();
            metadata_ready.trigger();
            Arc::new(Self {
                id: Uuid::new_v4(),
                metadata_ready,
                closed: Latch::new(),
            })
        }
    }

    impl Transfer for MisalignedTransfer {
        fn id(&self) -> Uuid {
            self.id
        }

        fn name(&self) -> String {
            "misaligned".to_string()
        }

        fn metadata_ready(&self) -> Latch {
            self.metadata_ready.clone()
        }

        fn closed(&self) -> Latch {
            self.closed.clone()
        }

        fn files(&self) -> Vec<TransferFile> {
            vec![
                TransferFile {
                    path: "a".to_string(),
                    display_path: "a".to_string(),
                    offset: 0,
                    length: 10,
                },
                TransferFile {
                    path: "b".to_string(),
                    display_path: "b".to_string(),
                    offset: 5,
                    length: 10,
                },
            ]
        }

        fn pieces(&self) -> Vec<PieceSpan> {
            vec![PieceSpan {
                index: 0,
                offset: 0,
                length: 15,
            }]
        }

        fn piece_count(&self) -> u32 {
            1
        }

        fn piece_complete(&self, _index: u32) -> bool {
            false
        }

        fn bytes_missing(&self) -> u64 {
            15
        }

        fn bytes_completed(&self) -> u64 {
            0
        }

        fn total_bytes(&self) -> u64 {
            15
        }

        fn seeding(&self) -> bool {
            false
        }

        fn stats(&self) -> TransferStats {
            TransferStats::default()
        }

        fn subscribe_piece_states(&self) -> mpsc::UnboundedReceiver<PieceState> {
            mpsc::unbounded_channel().1
        }
    }

    #[tokio::test]
    async fn malformed_geometry_terminates_through_closed() {
        let transfer = MisalignedTransfer::new();
        let tracker = TransferTracker::new(transfer, TrackerConfig::default());
        assert_triggers(&tracker.closed()).await;
        assert_stays_open(&tracker.download_done()).await;
        assert!(!tracker.signals_ready().is_triggered());
        assert!(matches!(
            tracker.failure(),
            Some(crate::error::GeometryError::FileGap { .. })
        ));
    }

    #[test]
    fn seed_wait_shrinks_as_the_target_nears() {
        let transfer = StubTransfer::with_layout("seed-wait", &[("a", 100)], 50);
        transfer.set_seeding(true);
        let far = seed_wait(transfer.as_ref(), 1.0);

        transfer.add_bytes_written(90);
        let near = seed_wait(transfer.as_ref(), 1.0);
        assert!(near < far);
        assert!(near >= SEED_POLL_FLOOR);

        transfer.add_bytes_written(20);
        assert_eq!(seed_wait(transfer.as_ref(), 1.0), Duration::ZERO);
    }
}
