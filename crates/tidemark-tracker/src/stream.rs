//! Per-subscriber ordered projections of a tracker's lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tidemark_events::{Event, Latch, TransferFile};
use tidemark_transfer_core::Transfer;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;

use crate::tracker::TransferTracker;

/// Bounded per-subscriber buffer; a slow consumer only ever delays itself.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One subscriber's lazy, finite, ordered view of lifecycle events.
///
/// The stream is exhausted after `Closed` is yielded, or silently after the
/// subscriber's cancel latch fires; it cannot be restarted.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Adapt into a [`tokio_stream::Stream`] for combinator use.
    #[must_use]
    pub fn into_stream(self) -> ReceiverStream<Event> {
        ReceiverStream::new(self.rx)
    }
}

/// Open a stream with its own channel over one tracker.
pub(crate) fn subscribe(tracker: Arc<TransferTracker>, cancel: Latch) -> EventStream {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    spawn_driver(tracker, cancel, tx);
    EventStream::new(rx)
}

/// Drive one tracker's lifecycle into a subscriber channel.
///
/// Registry fan-out reuses this with many drivers sharing one channel.
pub(crate) fn spawn_driver(tracker: Arc<TransferTracker>, cancel: Latch, tx: mpsc::Sender<Event>) {
    tokio::spawn(drive(tracker, cancel, tx));
}

enum StageOutcome {
    Signal,
    Closed,
    Cancelled,
}

/// Wait for the stage's signal, preferring cancellation, then progress,
/// then closure when several are already decided.
async fn stage(signal: &Latch, closed: &Latch, cancel: &Latch) -> StageOutcome {
    tokio::select! {
        biased;
        () = cancel.wait() => StageOutcome::Cancelled,
        () = signal.wait() => StageOutcome::Signal,
        () = closed.wait() => StageOutcome::Closed,
    }
}

/// Hand an event to the subscriber unless cancellation or disconnection
/// intervenes. Never blocks past a cancel on a full channel.
async fn deliver(tx: &mpsc::Sender<Event>, cancel: &Latch, event: Event) -> bool {
    tokio::select! {
        biased;
        () = cancel.wait() => false,
        result = tx.send(event) => result.is_ok(),
    }
}

async fn close_out(tx: &mpsc::Sender<Event>, cancel: &Latch, transfer: &dyn Transfer) {
    let _ = deliver(
        tx,
        cancel,
        Event::Closed {
            transfer: transfer.snapshot(),
        },
    )
    .await;
}

async fn drive(tracker: Arc<TransferTracker>, cancel: Latch, tx: mpsc::Sender<Event>) {
    let transfer = tracker.transfer();
    let closed = tracker.closed();

    match stage(&tracker.added(), &closed, &cancel).await {
        StageOutcome::Signal => {
            let event = Event::Added {
                transfer: transfer.snapshot(),
            };
            if !deliver(&tx, &cancel, event).await {
                return;
            }
        }
        StageOutcome::Closed => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
            return;
        }
        StageOutcome::Cancelled => return,
    }

    match stage(&tracker.got_info(), &closed, &cancel).await {
        StageOutcome::Signal => {
            let event = Event::GotInfo {
                transfer: transfer.snapshot(),
            };
            if !deliver(&tx, &cancel, event).await {
                return;
            }
        }
        StageOutcome::Closed => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
            return;
        }
        StageOutcome::Cancelled => return,
    }

    // The per-piece and per-file signal maps exist once the tracker's
    // worker has indexed the metadata.
    match stage(&tracker.signals_ready(), &closed, &cancel).await {
        StageOutcome::Signal => {}
        StageOutcome::Closed => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
            return;
        }
        StageOutcome::Cancelled => return,
    }

    // Piece and file events interleave, but a file's event is held back
    // until every overlapping piece's event has been handed over, and
    // joining the whole set forms the barrier ahead of `DownloadDone`.
    let file_records: HashMap<String, TransferFile> = transfer
        .files()
        .into_iter()
        .map(|file| (file.path.clone(), file))
        .collect();
    let piece_indices = tracker.piece_indices();
    let handed_over: HashMap<u32, Latch> = piece_indices
        .iter()
        .map(|&index| (index, Latch::new()))
        .collect();

    let mut tasks = JoinSet::new();
    for index in piece_indices {
        let Some(signal) = tracker.piece_done(index) else {
            continue;
        };
        tasks.spawn(piece_task(
            signal,
            closed.clone(),
            cancel.clone(),
            tx.clone(),
            Arc::clone(&transfer),
            index,
            handed_over[&index].clone(),
        ));
    }
    for (path, indices) in tracker.file_piece_map() {
        let Some(signal) = tracker.file_done(&path) else {
            continue;
        };
        let Some(file) = file_records.get(&path).cloned() else {
            continue;
        };
        let piece_deliveries: Vec<Latch> = indices
            .iter()
            .filter_map(|index| handed_over.get(index).cloned())
            .collect();
        tasks.spawn(file_task(
            signal,
            piece_deliveries,
            closed.clone(),
            cancel.clone(),
            tx.clone(),
            Arc::clone(&transfer),
            file,
        ));
    }
    while tasks.join_next().await.is_some() {}

    match stage(&tracker.download_done(), &closed, &cancel).await {
        StageOutcome::Signal => {
            let event = Event::DownloadDone {
                transfer: transfer.snapshot(),
            };
            if !deliver(&tx, &cancel, event).await {
                return;
            }
        }
        StageOutcome::Closed => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
            return;
        }
        StageOutcome::Cancelled => return,
    }

    match stage(&tracker.seeding_done(), &closed, &cancel).await {
        StageOutcome::Signal => {
            let event = Event::SeedingDone {
                transfer: transfer.snapshot(),
            };
            if !deliver(&tx, &cancel, event).await {
                return;
            }
        }
        StageOutcome::Closed => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
            return;
        }
        StageOutcome::Cancelled => return,
    }

    // Only closure remains.
    tokio::select! {
        biased;
        () = cancel.wait() => {}
        () = closed.wait() => {
            close_out(&tx, &cancel, transfer.as_ref()).await;
        }
    }
}

async fn piece_task(
    signal: Latch,
    closed: Latch,
    cancel: Latch,
    tx: mpsc::Sender<Event>,
    transfer: Arc<dyn Transfer>,
    index: u32,
    handed_over: Latch,
) {
    tokio::select! {
        biased;
        () = cancel.wait() => {}
        () = signal.wait() => {
            let event = Event::PieceDone {
                transfer: transfer.snapshot(),
                piece: index,
            };
            if deliver(&tx, &cancel, event).await {
                handed_over.trigger();
            }
        }
        () = closed.wait() => {}
    }
}

async fn file_task(
    signal: Latch,
    piece_deliveries: Vec<Latch>,
    closed: Latch,
    cancel: Latch,
    tx: mpsc::Sender<Event>,
    transfer: Arc<dyn Transfer>,
    file: TransferFile,
) {
    tokio::select! {
        biased;
        () = cancel.wait() => return,
        () = signal.wait() => {}
        () = closed.wait() => return,
    }
    for delivery in &piece_deliveries {
        tokio::select! {
            biased;
            () = cancel.wait() => return,
            () = delivery.wait() => {}
            () = closed.wait() => return,
        }
    }
    let event = Event::FileDone {
        transfer: transfer.snapshot(),
        file,
    };
    let _ = deliver(&tx, &cancel, event).await;
}
