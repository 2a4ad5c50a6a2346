//! Piece/file overlap derivation.

use std::collections::BTreeMap;

use tidemark_events::TransferFile;
use tidemark_transfer_core::PieceSpan;

use crate::error::GeometryError;

/// Adjacency between a transfer's piece grid and its file list.
///
/// Zero-length files and pieces carry no data and are excluded from both
/// maps; callers treat them as trivially complete.
#[derive(Debug, Default)]
pub(crate) struct PieceFileIndex {
    /// Non-empty piece -> paths of the files it overlaps.
    pub(crate) piece_files: BTreeMap<u32, Vec<String>>,
    /// Non-empty file -> indices of the pieces overlapping it, ascending.
    pub(crate) file_pieces: BTreeMap<String, Vec<u32>>,
}

impl PieceFileIndex {
    /// Derive the adjacency maps for sorted, contiguous geometry.
    ///
    /// Two half-open ranges `[a, b)` and `[c, d)` overlap iff
    /// `b > c && d > a`. Each piece is resolved as a fresh interval query;
    /// the lower bound only advances past files that end at or before the
    /// piece's start, so a piece spanning several files sees all of them.
    ///
    /// # Errors
    ///
    /// Returns a [`GeometryError`] when either list is unsorted, gapped,
    /// overlapping, or the two lists cover different byte ranges.
    pub(crate) fn build(
        files: &[TransferFile],
        pieces: &[PieceSpan],
    ) -> Result<Self, GeometryError> {
        validate(files, pieces)?;

        let mut index = Self::default();
        for file in files.iter().filter(|file| file.length > 0) {
            index.file_pieces.insert(file.path.clone(), Vec::new());
        }

        let mut lower_bound = 0;
        for piece in pieces.iter().filter(|piece| piece.length > 0) {
            let piece_end = piece.offset + piece.length;
            while lower_bound < files.len()
                && files[lower_bound].offset + files[lower_bound].length <= piece.offset
            {
                lower_bound += 1;
            }

            let mut overlapping = Vec::new();
            for file in &files[lower_bound..] {
                if file.offset >= piece_end {
                    break;
                }
                if file.length == 0 {
                    continue;
                }
                overlapping.push(file.path.clone());
                index
                    .file_pieces
                    .get_mut(&file.path)
                    .expect("every non-empty file was seeded above")
                    .push(piece.index);
            }
            if !overlapping.is_empty() {
                index.piece_files.insert(piece.index, overlapping);
            }
        }

        Ok(index)
    }
}

fn validate(files: &[TransferFile], pieces: &[PieceSpan]) -> Result<(), GeometryError> {
    let mut expected = 0u64;
    for file in files {
        if file.offset != expected {
            return Err(GeometryError::FileGap {
                path: file.path.clone(),
                offset: file.offset,
                expected,
            });
        }
        expected += file.length;
    }
    let file_bytes = expected;

    let mut expected = 0u64;
    for (position, piece) in pieces.iter().enumerate() {
        if piece.index != u32::try_from(position).unwrap_or(u32::MAX) {
            return Err(GeometryError::PieceIndexMismatch {
                position: u32::try_from(position).unwrap_or(u32::MAX),
                index: piece.index,
            });
        }
        if piece.offset != expected {
            return Err(GeometryError::PieceGap {
                index: piece.index,
                offset: piece.offset,
                expected,
            });
        }
        if piece.length == 0 && position + 1 != pieces.len() {
            return Err(GeometryError::ZeroLengthPiece { index: piece.index });
        }
        expected += piece.length;
    }
    let piece_bytes = expected;

    if file_bytes != piece_bytes {
        return Err(GeometryError::LengthMismatch {
            file_bytes,
            piece_bytes,
        });
    }
    Ok(())
}
