//! Training loop, one-batch sanity check and inference

use crate::dataset::{random_split, LakeTileDataset};
use crate::error::{Result, UnetError};
use crate::layers::Module;
use crate::loss::{bce_with_logits, sigmoid};
use crate::model::{UNetSmall, DEFAULT_WIDTH, SIZE_MULTIPLE};
use crate::optim::Adam;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub val_fraction: f64,
    pub seed: u64,
    /// First encoder width; the bottleneck has eight times as many channels
    pub width: usize,
    /// Where the weights are written after the last epoch
    pub checkpoint: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 8,
            learning_rate: 1e-3,
            val_fraction: 0.1,
            seed: 42,
            width: DEFAULT_WIDTH,
            checkpoint: Some(PathBuf::from("unet_lakes.npz")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochLoss {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub train_size: usize,
    pub val_size: usize,
    pub epochs: Vec<EpochLoss>,
    pub checkpoint: Option<PathBuf>,
}

/// Mean loss over `indices` without updating the model
fn evaluate(model: &mut UNetSmall, dataset: &LakeTileDataset, indices: &[usize], batch_size: usize) -> Result<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mut total = 0.0f64;
    for batch in dataset.batches(indices, batch_size, false, &mut rng) {
        let (x, y) = batch?;
        let (loss, _) = bce_with_logits(&model.forward(&x)?, &y)?;
        total += f64::from(loss) * x.dim().0 as f64;
    }
    Ok((total / indices.len().max(1) as f64) as f32)
}

/// Train a fresh [`UNetSmall`] on `dataset`.
///
/// The input channel count comes from the first tile. Training and
/// validation losses are the per-sample means over each epoch.
pub fn train(dataset: &LakeTileDataset, cfg: &TrainConfig) -> Result<(UNetSmall, TrainReport)> {
    info!("Total tiles: {}", dataset.len());
    let (train_idx, val_idx) = random_split(dataset.len(), cfg.val_fraction, cfg.seed)?;
    info!("Train tiles: {}", train_idx.len());
    info!("Val tiles:   {}", val_idx.len());

    let (sample, _) = dataset.get(0)?;
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let mut model = UNetSmall::with_width(sample.dim().0, 1, cfg.width, &mut rng);
    let mut adam = Adam::new(cfg.learning_rate);
    debug!("model has {} parameters", model.num_params());

    let mut epochs = Vec::with_capacity(cfg.epochs);
    for epoch in 1..=cfg.epochs {
        let mut running = 0.0f64;
        for batch in dataset.batches(&train_idx, cfg.batch_size, true, &mut rng) {
            let (x, y) = batch?;
            model.zero_grad();
            let logits = model.forward(&x)?;
            let (loss, grad) = bce_with_logits(&logits, &y)?;
            model.backward(&grad)?;
            adam.step(&mut model);
            running += f64::from(loss) * x.dim().0 as f64;
        }
        let train_loss = (running / train_idx.len() as f64) as f32;
        let val_loss = evaluate(&mut model, dataset, &val_idx, cfg.batch_size)?;

        info!("Epoch {epoch}/{} - train loss: {train_loss:.4} - val loss: {val_loss:.4}", cfg.epochs);
        epochs.push(EpochLoss {
            epoch,
            train_loss,
            val_loss,
        });
    }

    if let Some(path) = &cfg.checkpoint {
        model.save_checkpoint(path)?;
    }

    let report = TrainReport {
        train_size: train_idx.len(),
        val_size: val_idx.len(),
        epochs,
        checkpoint: cfg.checkpoint.clone(),
    };
    Ok((model, report))
}

#[derive(Debug, Clone, Serialize)]
pub struct SanityReport {
    pub dataset_size: usize,
    /// `(N, C, H, W)` of the image batch
    pub batch_shape: [usize; 4],
    pub logits_shape: [usize; 4],
    pub initial_loss: f32,
    /// Loss on the same batch after one optimizer step
    pub loss_after_step: f32,
}

/// Push one shuffled batch through a fresh model and take a single Adam step
pub fn sanity_check(dataset: &LakeTileDataset, batch_size: usize, seed: u64) -> Result<SanityReport> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let all: Vec<usize> = (0..dataset.len()).collect();
    let (x, y) = dataset
        .batches(&all, batch_size, true, &mut rng)
        .next()
        .ok_or(UnetError::NotEnoughTiles(0))??;
    let dims = |a: &Array4<f32>| {
        let (n, c, h, w) = a.dim();
        [n, c, h, w]
    };
    info!("Batch shapes: {:?} {:?}", dims(&x), dims(&y));

    let mut model = UNetSmall::new(x.dim().1, 1, &mut rng);
    let logits = model.forward(&x)?;
    info!("Logits shape: {:?}", dims(&logits));
    let (initial_loss, grad) = bce_with_logits(&logits, &y)?;
    info!("Initial loss: {initial_loss}");

    let mut adam = Adam::default();
    model.zero_grad();
    model.backward(&grad)?;
    adam.step(&mut model);
    let (loss_after_step, _) = bce_with_logits(&model.forward(&x)?, &y)?;
    info!("One training step completed");

    Ok(SanityReport {
        dataset_size: dataset.len(),
        batch_shape: dims(&x),
        logits_shape: dims(&logits),
        initial_loss,
        loss_after_step,
    })
}

/// Lake probability for a `(C, H, W)` image whose sides are multiples of 8
pub fn predict(model: &mut UNetSmall, image: &Array3<f32>) -> Result<Array2<f32>> {
    let logits = model.forward(&image.clone().insert_axis(Axis(0)))?;
    Ok(logits.slice(s![0, 0, .., ..]).mapv(sigmoid))
}

/// Binary mask of `probabilities > threshold`
pub fn threshold(probabilities: &Array2<f32>, threshold: f32) -> Array2<u8> {
    probabilities.mapv(|p| u8::from(p > threshold))
}

/// Window start offsets covering `len` with windows of `tile`, the last
/// one pushed back to end at the border
fn window_starts(len: usize, tile: usize) -> Vec<usize> {
    if len <= tile {
        return vec![0];
    }
    let mut starts: Vec<usize> = (0..=len - tile).step_by(tile).collect();
    if starts.last() != Some(&(len - tile)) {
        starts.push(len - tile);
    }
    starts
}

/// Tiled inference over a single-band image of any size.
///
/// NaN pixels are fed as zero. Images smaller than `tile` are zero padded.
pub fn predict_large(model: &mut UNetSmall, image: ArrayView2<f32>, tile: usize) -> Result<Array2<f32>> {
    if tile == 0 || tile % SIZE_MULTIPLE != 0 {
        return Err(UnetError::InvalidInput(format!(
            "tile size {tile} must be a positive multiple of {SIZE_MULTIPLE}"
        )));
    }
    let (h, w) = image.dim();
    let (ph, pw) = (h.max(tile), w.max(tile));
    let mut padded = Array2::<f32>::zeros((ph, pw));
    padded
        .slice_mut(s![..h, ..w])
        .assign(&image.mapv(|v| if v.is_finite() { v } else { 0.0 }));

    let mut probs = Array2::<f32>::zeros((ph, pw));
    for &r in &window_starts(ph, tile) {
        for &c in &window_starts(pw, tile) {
            let window = padded.slice(s![r..r + tile, c..c + tile]).to_owned().insert_axis(Axis(0));
            let p = predict(model, &window)?;
            probs.slice_mut(s![r..r + tile, c..c + tile]).assign(&p);
        }
    }
    Ok(probs.slice(s![..h, ..w]).to_owned())
}
