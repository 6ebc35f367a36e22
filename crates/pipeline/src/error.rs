//! Error types for the scene pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while processing scenes, DEMs, strip indexes and tiles
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("core error: {0}")]
    Core(#[from] lakemap_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{band} not found in {}", .safe.display())]
    BandNotFound { band: String, safe: PathBuf },

    #[error("raster has no CRS: {}", .0.display())]
    MissingCrs(PathBuf),

    #[error("no DEM rasters found under {}", .0.display())]
    EmptyDemSource(PathBuf),

    #[error("no overlapping strips found; increase the buffer or verify CRS/bounds")]
    NoOverlappingStrips,

    #[error("overlapping strips had zero intersection area; check bounds/CRS")]
    ZeroIntersectionArea,

    #[error("no URL column found in strip index (columns: {0})")]
    NoUrlColumn(String),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("npz read error: {0}")]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    #[error("npz write error: {0}")]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
