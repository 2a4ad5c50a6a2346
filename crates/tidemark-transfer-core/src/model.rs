//! Piece geometry and feed records.

use serde::{Deserialize, Serialize};

/// A contiguous byte range of the transfer covered by one piece.
///
/// Pieces have a fixed length except possibly the last one. A zero-length
/// span is only valid as an implicit trailing element overlapping no data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PieceSpan {
    /// Position of the piece in the grid.
    pub index: u32,
    /// Byte offset of the piece within the transfer.
    pub offset: u64,
    /// Piece length in bytes.
    pub length: u64,
}

/// One element of the engine's piece-completion feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PieceState {
    /// Index of the piece the notification refers to.
    pub index: u32,
    /// Whether the piece is now complete and verified.
    pub complete: bool,
}
