//! The transfer-engine boundary consumed by the tracking layer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tidemark_events::{Latch, TransferFile, TransferSnapshot, TransferStats};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{PieceSpan, PieceState};

/// Live transfer surface exposed by the engine.
///
/// Geometry accessors (`files`, `pieces`, byte counters) are meaningful only
/// once the `metadata_ready` latch has triggered; before that they report
/// empty or zero values. The piece feed ends (receivers yield `None`) when
/// the transfer closes.
pub trait Transfer: Send + Sync {
    /// Stable identity assigned when the transfer was admitted.
    fn id(&self) -> Uuid;

    /// Display name of the transfer.
    fn name(&self) -> String;

    /// Triggered once the file list and piece geometry are known.
    fn metadata_ready(&self) -> Latch;

    /// Triggered when the engine drops the transfer.
    fn closed(&self) -> Latch;

    /// Files contained in the transfer, sorted by offset.
    fn files(&self) -> Vec<TransferFile>;

    /// The piece grid, sorted by offset.
    fn pieces(&self) -> Vec<PieceSpan>;

    /// Number of pieces in the grid.
    fn piece_count(&self) -> u32;

    /// Whether the engine currently reports the piece complete.
    fn piece_complete(&self, index: u32) -> bool;

    /// Bytes still missing from the transfer.
    fn bytes_missing(&self) -> u64;

    /// Bytes confirmed complete.
    fn bytes_completed(&self) -> u64;

    /// Total payload size in bytes.
    fn total_bytes(&self) -> u64;

    /// Whether the engine keeps uploading once the download finishes.
    fn seeding(&self) -> bool;

    /// Throughput counters.
    fn stats(&self) -> TransferStats;

    /// Register a new piece-completion feed subscription.
    ///
    /// Each call returns an independent receiver observing every completion
    /// from the moment of subscription onward.
    fn subscribe_piece_states(&self) -> mpsc::UnboundedReceiver<PieceState>;

    /// Assemble the plain data record attached to published events.
    fn snapshot(&self) -> TransferSnapshot {
        let has_metadata = self.metadata_ready().is_triggered();
        TransferSnapshot {
            id: self.id(),
            name: self.name(),
            bytes_completed: self.bytes_completed(),
            bytes_missing: if has_metadata { self.bytes_missing() } else { 0 },
            total_bytes: if has_metadata { self.total_bytes() } else { 0 },
            piece_count: if has_metadata { self.piece_count() } else { 0 },
            seeding: self.seeding(),
            has_metadata,
            files: if has_metadata {
                self.files()
            } else {
                Vec::new()
            },
            stats: self.stats(),
            captured_at: Utc::now(),
        }
    }
}

/// Controllable in-memory [`Transfer`] used by tests across the workspace.
///
/// Tests drive the lifecycle by hand: [`set_layout`](Self::set_layout)
/// publishes metadata, [`complete_piece`](Self::complete_piece) feeds
/// completions to every subscription, [`close`](Self::close) ends the
/// transfer and every outstanding feed.
pub struct StubTransfer {
    id: Uuid,
    name: String,
    metadata_ready: Latch,
    closed: Latch,
    state: Mutex<StubState>,
}

#[derive(Default)]
struct StubState {
    files: Vec<TransferFile>,
    pieces: Vec<PieceSpan>,
    complete: Vec<bool>,
    seeding: bool,
    stats: TransferStats,
    feeds: Vec<mpsc::UnboundedSender<PieceState>>,
}

impl StubTransfer {
    /// A transfer whose metadata is not yet known.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            metadata_ready: Latch::new(),
            closed: Latch::new(),
            state: Mutex::new(StubState::default()),
        })
    }

    /// A transfer whose metadata is known from the start.
    ///
    /// `files` is a list of `(path, length)` pairs laid out contiguously
    /// from offset zero; the piece grid is derived from `piece_length`.
    #[must_use]
    pub fn with_layout(name: &str, files: &[(&str, u64)], piece_length: u64) -> Arc<Self> {
        let transfer = Self::new(name);
        transfer.set_layout(files, piece_length);
        transfer
    }

    /// Publish the transfer's metadata and trigger `metadata_ready`.
    ///
    /// # Panics
    ///
    /// Panics if `piece_length` is zero while the layout carries data.
    pub fn set_layout(&self, files: &[(&str, u64)], piece_length: u64) {
        let mut offset = 0;
        let files: Vec<TransferFile> = files
            .iter()
            .map(|(path, length)| {
                let file = TransferFile {
                    path: (*path).to_string(),
                    display_path: (*path).to_string(),
                    offset,
                    length: *length,
                };
                offset += *length;
                file
            })
            .collect();
        let total = offset;
        assert!(
            total == 0 || piece_length > 0,
            "piece length must be positive for a non-empty layout"
        );

        let mut pieces = Vec::new();
        let mut piece_offset = 0;
        while piece_offset < total {
            pieces.push(PieceSpan {
                index: u32::try_from(pieces.len()).expect("piece grid exceeds u32"),
                offset: piece_offset,
                length: piece_length.min(total - piece_offset),
            });
            piece_offset += piece_length;
        }

        {
            let mut state = self.lock();
            state.complete = vec![false; pieces.len()];
            state.files = files;
            state.pieces = pieces;
        }
        self.metadata_ready.trigger();
    }

    /// Mark a piece complete and notify every live feed subscription.
    pub fn complete_piece(&self, index: u32) {
        let mut state = self.lock();
        if let Some(slot) = state.complete.get_mut(index as usize) {
            *slot = true;
        }
        state
            .feeds
            .retain(|feed| feed.send(PieceState { index, complete: true }).is_ok());
    }

    /// Mark every piece complete, as an engine would after a full recheck.
    pub fn complete_all(&self) {
        let indices: Vec<u32> = {
            let state = self.lock();
            state.pieces.iter().map(|piece| piece.index).collect()
        };
        for index in indices {
            self.complete_piece(index);
        }
    }

    /// Close the transfer: trigger the closed latch and end every feed.
    pub fn close(&self) {
        self.lock().feeds.clear();
        self.closed.trigger();
    }

    /// Toggle the engine's seeding flag.
    pub fn set_seeding(&self, seeding: bool) {
        self.lock().seeding = seeding;
    }

    /// Account additional payload bytes written to peers.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.lock().stats.bytes_written += bytes;
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transfer for StubTransfer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn metadata_ready(&self) -> Latch {
        self.metadata_ready.clone()
    }

    fn closed(&self) -> Latch {
        self.closed.clone()
    }

    fn files(&self) -> Vec<TransferFile> {
        self.lock().files.clone()
    }

    fn pieces(&self) -> Vec<PieceSpan> {
        self.lock().pieces.clone()
    }

    fn piece_count(&self) -> u32 {
        u32::try_from(self.lock().pieces.len()).unwrap_or(u32::MAX)
    }

    fn piece_complete(&self, index: u32) -> bool {
        self.lock()
            .complete
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    fn bytes_missing(&self) -> u64 {
        self.total_bytes() - self.bytes_completed()
    }

    fn bytes_completed(&self) -> u64 {
        let state = self.lock();
        state
            .pieces
            .iter()
            .filter(|piece| state.complete[piece.index as usize])
            .map(|piece| piece.length)
            .sum()
    }

    fn total_bytes(&self) -> u64 {
        self.lock().files.iter().map(|file| file.length).sum()
    }

    fn seeding(&self) -> bool {
        self.lock().seeding
    }

    fn stats(&self) -> TransferStats {
        self.lock().stats
    }

    fn subscribe_piece_states(&self) -> mpsc::UnboundedReceiver<PieceState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !self.closed.is_triggered() {
            state.feeds.push(tx);
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_derives_a_contiguous_piece_grid() {
        let transfer = StubTransfer::with_layout("layout", &[("a", 10), ("b", 25)], 10);
        let pieces = transfer.pieces();
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[3], PieceSpan {
            index: 3,
            offset: 30,
            length: 5,
        });
        assert_eq!(transfer.total_bytes(), 35);
        assert_eq!(transfer.bytes_missing(), 35);
        assert!(transfer.metadata_ready().is_triggered());
    }

    #[test]
    fn completing_pieces_updates_byte_accounting() {
        let transfer = StubTransfer::with_layout("accounting", &[("a", 10), ("b", 10)], 10);
        transfer.complete_piece(0);
        assert_eq!(transfer.bytes_completed(), 10);
        assert_eq!(transfer.bytes_missing(), 10);
        assert!(transfer.piece_complete(0));
        assert!(!transfer.piece_complete(1));
        transfer.complete_piece(1);
        assert_eq!(transfer.bytes_missing(), 0);
    }

    #[tokio::test]
    async fn feeds_observe_completions_and_end_on_close() {
        let transfer = StubTransfer::with_layout("feeds", &[("a", 20)], 10);
        let mut feed = transfer.subscribe_piece_states();
        transfer.complete_piece(1);
        assert_eq!(
            feed.recv().await,
            Some(PieceState {
                index: 1,
                complete: true,
            })
        );
        transfer.close();
        assert_eq!(feed.recv().await, None);
    }

    #[tokio::test]
    async fn subscriptions_after_close_are_already_ended() {
        let transfer = StubTransfer::with_layout("closed", &[("a", 10)], 10);
        transfer.close();
        let mut feed = transfer.subscribe_piece_states();
        assert_eq!(feed.recv().await, None);
    }

    #[test]
    fn snapshot_reflects_metadata_availability() {
        let transfer = StubTransfer::new("pending");
        let snapshot = transfer.snapshot();
        assert!(!snapshot.has_metadata);
        assert!(snapshot.files.is_empty());
        assert_eq!(snapshot.piece_count, 0);

        transfer.set_layout(&[("a", 10)], 10);
        let snapshot = transfer.snapshot();
        assert!(snapshot.has_metadata);
        assert_eq!(snapshot.files.len(), 1);
        assert_eq!(snapshot.piece_count, 1);
        assert_eq!(snapshot.total_bytes, 10);
    }
}
