//! Paired `.npz` image/mask tiles

use crate::error::{Result, UnetError};
use ndarray::{stack, Array3, Array4, ArrayD, Axis, Ix2, Ix3, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Applied to every `(image, mask)` sample after loading
pub type SampleTransform = Box<dyn Fn(Array3<f32>, Array3<f32>) -> (Array3<f32>, Array3<f32>) + Send + Sync>;

/// First array of an `.npz` archive as `f32`, whatever its stored dtype
pub fn read_first_array(path: &Path) -> Result<ArrayD<f32>> {
    macro_rules! attempt {
        ($t:ty, $conv:expr) => {
            let mut npz = NpzReader::new(File::open(path)?)?;
            if let Ok(a) = npz.by_index::<OwnedRepr<$t>, IxDyn>(0) {
                return Ok(a.mapv($conv));
            }
        };
    }
    attempt!(f32, |v| v);
    attempt!(u8, f32::from);
    attempt!(f64, |v| v as f32);
    attempt!(bool, |v| if v { 1.0 } else { 0.0 });
    let mut npz = NpzReader::new(File::open(path)?)?;
    let a: ArrayD<i64> = npz.by_index(0)?;
    Ok(a.mapv(|v| v as f32))
}

fn as_chw(arr: ArrayD<f32>, path: &Path) -> Result<Array3<f32>> {
    match arr.ndim() {
        2 => Ok(arr.into_dimensionality::<Ix2>()?.insert_axis(Axis(0))),
        3 => Ok(arr.into_dimensionality::<Ix3>()?),
        n => Err(UnetError::InvalidInput(format!(
            "{}: expected a 2-D or 3-D array, found {n}-D",
            path.display()
        ))),
    }
}

fn npz_stems(dir: &Path) -> Result<BTreeSet<String>> {
    let pattern = format!("{}/*.npz", glob::Pattern::escape(&dir.to_string_lossy()));
    Ok(glob::glob(&pattern)?
        .filter_map(|e| e.ok())
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect())
}

/// Image/mask tiles sharing a file stem across two directories.
///
/// Images load as `(C, H, W)`; 2-D masks gain a leading channel axis.
pub struct LakeTileDataset {
    images_dir: PathBuf,
    masks_dir: PathBuf,
    stems: Vec<String>,
    transform: Option<SampleTransform>,
}

impl LakeTileDataset {
    pub fn new(images_dir: &Path, masks_dir: &Path) -> Result<Self> {
        let images = npz_stems(images_dir)?;
        let masks = npz_stems(masks_dir)?;
        let stems: Vec<String> = images.intersection(&masks).cloned().collect();
        if stems.is_empty() {
            return Err(UnetError::NoMatchingTiles {
                images: images_dir.to_path_buf(),
                masks: masks_dir.to_path_buf(),
            });
        }
        Ok(Self {
            images_dir: images_dir.to_path_buf(),
            masks_dir: masks_dir.to_path_buf(),
            stems,
            transform: None,
        })
    }

    pub fn with_transform(mut self, transform: SampleTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.stems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stems.is_empty()
    }

    pub fn stems(&self) -> &[String] {
        &self.stems
    }

    pub fn get(&self, index: usize) -> Result<(Array3<f32>, Array3<f32>)> {
        let stem = self
            .stems
            .get(index)
            .ok_or_else(|| UnetError::InvalidInput(format!("tile index {index} out of range ({})", self.len())))?;
        let image_path = self.images_dir.join(format!("{stem}.npz"));
        let mask_path = self.masks_dir.join(format!("{stem}.npz"));
        let image = as_chw(read_first_array(&image_path)?, &image_path)?;
        let mask = as_chw(read_first_array(&mask_path)?, &mask_path)?;

        Ok(match &self.transform {
            Some(t) => t(image, mask),
            None => (image, mask),
        })
    }

    /// Stack samples into `(N, C, H, W)` image and mask batches
    pub fn load_batch(&self, indices: &[usize]) -> Result<(Array4<f32>, Array4<f32>)> {
        let samples = indices.iter().map(|&i| self.get(i)).collect::<Result<Vec<_>>>()?;
        let images: Vec<_> = samples.iter().map(|(x, _)| x.view()).collect();
        let masks: Vec<_> = samples.iter().map(|(_, y)| y.view()).collect();
        Ok((stack(Axis(0), &images)?, stack(Axis(0), &masks)?))
    }

    /// Iterate over `indices` in batches of `batch_size`, the last one
    /// possibly shorter. Order is shuffled with `rng` when `shuffle` is set.
    pub fn batches<R: Rng>(&self, indices: &[usize], batch_size: usize, shuffle: bool, rng: &mut R) -> Batches<'_> {
        let mut order = indices.to_vec();
        if shuffle {
            order.shuffle(rng);
        }
        Batches {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a LakeTileDataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<(Array4<f32>, Array4<f32>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.dataset.load_batch(&self.order[self.pos..end]);
        self.pos = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (n, Some(n))
    }
}

/// Shuffle `0..n` with a fixed seed and split off a validation set of
/// `max(1, floor(n * val_fraction))` indices. Returns `(train, val)`.
pub fn random_split(n: usize, val_fraction: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    if n < 2 {
        return Err(UnetError::NotEnoughTiles(n));
    }
    let val_len = ((n as f64 * val_fraction) as usize).clamp(1, n - 1);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    let train = indices.split_off(val_len);
    Ok((train, indices))
}
