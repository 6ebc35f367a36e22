//! Training on a toy tile set: a bright square is the lake

use lakemap_unet::{
    predict, sanity_check, threshold, train, LakeTileDataset, Module, TrainConfig, UNetSmall, UnetError,
};
use ndarray::{Array2, Array3, Array4};
use ndarray_npy::NpzWriter;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs::File;
use std::path::Path;
use tempfile::TempDir;

fn write_npz<A: ndarray_npy::WritableElement, D: ndarray::Dimension>(
    path: &Path,
    name: &str,
    arr: &ndarray::Array<A, D>,
) {
    let mut npz = NpzWriter::new_compressed(File::create(path).unwrap());
    npz.add_array(name, arr).unwrap();
    npz.finish().unwrap();
}

/// Tiles of 16x16 where water (NDWI 0.8) fills a square at a varying offset
fn toy_tiles(n: usize) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let images = tmp.path().join("images");
    let masks = tmp.path().join("masks");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&masks).unwrap();

    for i in 0..n {
        let off = i % 8;
        let lake = |r: usize, c: usize| (off..off + 6).contains(&r) && (off..off + 6).contains(&c);
        let ndwi = Array3::from_shape_fn((1, 16, 16), |(_, r, c)| if lake(r, c) { 0.8f32 } else { -0.4 });
        let mask = Array2::from_shape_fn((16, 16), |(r, c)| u8::from(lake(r, c)));
        let stem = format!("scene_y{}_x0", i * 16);
        write_npz(&images.join(format!("{stem}.npz")), "ndwi", &ndwi);
        write_npz(&masks.join(format!("{stem}.npz")), "mask", &mask);
    }
    tmp
}

fn dataset(tmp: &TempDir) -> LakeTileDataset {
    LakeTileDataset::new(&tmp.path().join("images"), &tmp.path().join("masks")).unwrap()
}

#[test]
fn training_reduces_loss_and_saves_weights() {
    let tmp = toy_tiles(10);
    let ds = dataset(&tmp);
    let ckpt = tmp.path().join("models/unet_lakes.npz");
    let cfg = TrainConfig {
        epochs: 8,
        batch_size: 3,
        learning_rate: 1e-2,
        width: 4,
        checkpoint: Some(ckpt.clone()),
        ..Default::default()
    };

    let (mut model, report) = train(&ds, &cfg).unwrap();
    assert_eq!(report.train_size, 9);
    assert_eq!(report.val_size, 1);
    assert_eq!(report.epochs.len(), 8);
    let first = report.epochs[0].train_loss;
    let last = report.epochs[7].train_loss;
    assert!(last < first, "train loss went from {first} to {last}");
    assert!(ckpt.is_file());

    // reloading the checkpoint reproduces the trained model's output
    let (img, _) = ds.get(0).unwrap();
    let expected = predict(&mut model, &img).unwrap();
    let mut fresh = UNetSmall::with_width(1, 1, 4, &mut ChaCha8Rng::seed_from_u64(99));
    fresh.load_checkpoint(&ckpt).unwrap();
    let got = predict(&mut fresh, &img).unwrap();
    for (a, b) in expected.iter().zip(got.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    assert_eq!(threshold(&got, 0.5).dim(), (16, 16));
}

#[test]
fn checkpoint_shape_mismatch_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("w.npz");
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    UNetSmall::with_width(1, 1, 2, &mut rng).save_checkpoint(&path).unwrap();

    let mut wider = UNetSmall::with_width(1, 1, 4, &mut rng);
    assert!(matches!(wider.load_checkpoint(&path), Err(UnetError::Checkpoint(_))));
}

#[test]
fn sanity_step_runs_on_one_batch() {
    let tmp = toy_tiles(4);
    let report = sanity_check(&dataset(&tmp), 2, 7).unwrap();
    assert_eq!(report.dataset_size, 4);
    assert_eq!(report.batch_shape, [2, 1, 16, 16]);
    assert_eq!(report.logits_shape, [2, 1, 16, 16]);
    assert!(report.initial_loss.is_finite());
    assert!(report.loss_after_step.is_finite());
}

#[test]
fn single_tile_cannot_be_split() {
    let tmp = toy_tiles(1);
    let cfg = TrainConfig {
        checkpoint: None,
        width: 2,
        ..Default::default()
    };
    assert!(matches!(train(&dataset(&tmp), &cfg), Err(UnetError::NotEnoughTiles(1))));

    let mut model = UNetSmall::with_width(1, 1, 2, &mut ChaCha8Rng::seed_from_u64(0));
    assert!(model.forward(&Array4::zeros((1, 1, 16, 16))).is_ok());
}
