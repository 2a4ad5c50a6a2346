//! Error types for the tracking core.

use thiserror::Error;

/// Geometry precondition violations detected while indexing a transfer.
///
/// Geometry comes straight from the engine's metadata and is immutable, so
/// none of these are recoverable: a tracker that hits one terminates
/// through its closed path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    /// File ranges must be sorted and contiguous from offset zero.
    #[error("file `{path}` begins at offset {offset}, expected {expected}")]
    FileGap {
        /// Path of the offending file.
        path: String,
        /// Offset the file actually begins at.
        offset: u64,
        /// Offset the file was expected to begin at.
        expected: u64,
    },
    /// Piece ranges must be sorted and contiguous from offset zero.
    #[error("piece {index} begins at offset {offset}, expected {expected}")]
    PieceGap {
        /// Index of the offending piece.
        index: u32,
        /// Offset the piece actually begins at.
        offset: u64,
        /// Offset the piece was expected to begin at.
        expected: u64,
    },
    /// Piece indices must match their position in the grid.
    #[error("piece at position {position} carries index {index}")]
    PieceIndexMismatch {
        /// Position of the entry in the piece list.
        position: u32,
        /// Index the entry claims to have.
        index: u32,
    },
    /// A zero-length piece is only valid as the trailing element.
    #[error("piece {index} has zero length but is not the trailing piece")]
    ZeroLengthPiece {
        /// Index of the offending piece.
        index: u32,
    },
    /// The file list and piece grid must cover the same byte range.
    #[error("files cover {file_bytes} bytes but pieces cover {piece_bytes}")]
    LengthMismatch {
        /// Total bytes covered by the file list.
        file_bytes: u64,
        /// Total bytes covered by the piece grid.
        piece_bytes: u64,
    },
}
