//! Error types for parsing and dumping configuration trees.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from the configuration tree model.
#[derive(Debug, Error)]
pub enum ConfError {
    /// A token that does not belong where it appeared.
    #[error("unexpected {text:?} in {}:{line}:{column}", path.display())]
    Unexpected {
        text: String,
        path: PathBuf,
        line: usize,
        column: usize,
    },

    /// Input ended in the middle of a directive or block.
    #[error("unexpected end of file in {}", path.display())]
    UnexpectedEof { path: PathBuf },

    /// A directive whose arguments do not match the expected shape.
    #[error("{0}")]
    BadDirective(String),

    #[error("invalid include pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
