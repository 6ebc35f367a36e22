//! Error types for the segmentation model

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("npz read error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("npz write error: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("no matching image/mask stems between {} and {}", .images.display(), .masks.display())]
    NoMatchingTiles { images: PathBuf, masks: PathBuf },

    #[error("need at least 2 tiles to split into train and validation sets, got {0}")]
    NotEnoughTiles(usize),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backward called on {0} before forward")]
    NoForward(&'static str),

    #[error("checkpoint mismatch: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, UnetError>;
