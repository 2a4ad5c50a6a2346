//! Transfer lifecycle events and the completion-signal primitive.
//!
//! Downstream consumers (HTTP/WebSocket transports, webhook dispatchers)
//! only ever see the types in this crate: a typed [`Event`] enum whose
//! variants carry a plain [`TransferSnapshot`] record, and the [`Latch`]
//! one-shot broadcast signal the tracking layer coordinates on. Events are
//! ephemeral and delivered at most once per subscriber; there is no replay.

mod latch;

pub use latch::Latch;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single file within a transfer.
///
/// `offset` and `length` locate the file inside the transfer's contiguous
/// byte range. `length` may be zero, in which case the file is trivially
/// complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFile {
    /// Path of the file relative to the transfer root.
    pub path: String,
    /// Human-friendly path shown to consumers.
    pub display_path: String,
    /// Byte offset of the file within the transfer.
    pub offset: u64,
    /// File length in bytes.
    pub length: u64,
}

/// Throughput counters reported by the engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes read from peers.
    pub bytes_read: u64,
    /// Payload bytes written to peers; drives the seed-ratio check.
    pub bytes_written: u64,
}

/// Point-in-time view of a transfer, attached to every published event.
///
/// Geometry-bearing fields (`bytes_missing`, `total_bytes`, `piece_count`,
/// `files`) are zeroed or empty until the transfer's metadata is known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSnapshot {
    /// Stable identity assigned when the transfer was admitted.
    pub id: Uuid,
    /// Display name of the transfer.
    pub name: String,
    /// Bytes confirmed complete so far.
    pub bytes_completed: u64,
    /// Bytes still missing.
    pub bytes_missing: u64,
    /// Total payload size in bytes.
    pub total_bytes: u64,
    /// Number of pieces in the transfer.
    pub piece_count: u32,
    /// Whether the engine keeps uploading after the download finishes.
    pub seeding: bool,
    /// Whether the file list and piece geometry are known yet.
    pub has_metadata: bool,
    /// Files contained in the transfer; empty before metadata.
    pub files: Vec<TransferFile>,
    /// Throughput counters at capture time.
    pub stats: TransferStats,
    /// When this snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

/// Lifecycle transitions republished to subscribers.
///
/// Per subscriber the variants arrive in a fixed partial order: `Added`,
/// `GotInfo`, then `PieceDone`/`FileDone` interleaved (each file after all
/// of its pieces), `DownloadDone`, `SeedingDone`, `Closed`. A premature
/// `Closed` cuts the sequence short at any point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The transfer was admitted into the engine.
    Added { transfer: TransferSnapshot },
    /// The transfer's metadata (files, piece geometry) became available.
    GotInfo { transfer: TransferSnapshot },
    /// A piece finished downloading and verified.
    PieceDone { transfer: TransferSnapshot, piece: u32 },
    /// Every piece overlapping the file finished.
    FileDone {
        transfer: TransferSnapshot,
        file: TransferFile,
    },
    /// The whole transfer finished downloading.
    DownloadDone { transfer: TransferSnapshot },
    /// The configured seed target was met (or seeding was not requested).
    SeedingDone { transfer: TransferSnapshot },
    /// The engine dropped the transfer; terminal.
    Closed { transfer: TransferSnapshot },
}

impl Event {
    /// Machine-friendly discriminator for transport consumers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Added { .. } => "added",
            Event::GotInfo { .. } => "got_info",
            Event::PieceDone { .. } => "piece_done",
            Event::FileDone { .. } => "file_done",
            Event::DownloadDone { .. } => "download_done",
            Event::SeedingDone { .. } => "seeding_done",
            Event::Closed { .. } => "closed",
        }
    }

    /// Snapshot of the transfer the event refers to.
    #[must_use]
    pub fn transfer(&self) -> &TransferSnapshot {
        match self {
            Event::Added { transfer }
            | Event::GotInfo { transfer }
            | Event::PieceDone { transfer, .. }
            | Event::FileDone { transfer, .. }
            | Event::DownloadDone { transfer }
            | Event::SeedingDone { transfer }
            | Event::Closed { transfer } => transfer,
        }
    }

    /// Identity of the transfer the event refers to.
    #[must_use]
    pub fn transfer_id(&self) -> Uuid {
        self.transfer().id
    }
}
