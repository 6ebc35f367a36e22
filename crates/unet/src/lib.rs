//! # lakemap-unet
//!
//! A small U-Net for supraglacial lake segmentation, trained on the NDWI
//! tiles written by `lakemap-pipeline`. Runs on the CPU: every layer has a
//! hand-written backward pass over `ndarray` tensors, with `rayon` across
//! the batch.
//!
//! ```ignore
//! use lakemap_unet::{train, LakeTileDataset, TrainConfig};
//!
//! let ds = LakeTileDataset::new("data/tiles/images".as_ref(), "data/tiles/masks".as_ref())?;
//! let (model, report) = train(&ds, &TrainConfig::default())?;
//! ```

pub mod dataset;
pub mod error;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optim;
pub mod train;

pub use dataset::{random_split, read_first_array, Batches, LakeTileDataset, SampleTransform};
pub use error::{Result, UnetError};
pub use layers::{Module, Param};
pub use loss::{bce_with_logits, sigmoid};
pub use model::{DoubleConv, UNetSmall, DEFAULT_WIDTH, SIZE_MULTIPLE};
pub use optim::Adam;
pub use train::{predict, predict_large, sanity_check, threshold, train, EpochLoss, SanityReport, TrainConfig, TrainReport};
