//! Three-level U-Net for binary lake segmentation

use crate::error::{Result, UnetError};
use crate::layers::{concat_channels, nest, split_channels, Conv2d, ConvTranspose2d, MaxPool2d, Module, Param, Relu};
use ndarray::{Array4, ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::Rng;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use tracing::info;

/// Spatial dimensions must be a multiple of this (three 2x2 poolings)
pub const SIZE_MULTIPLE: usize = 8;

/// Default channel width of the first encoder level
pub const DEFAULT_WIDTH: usize = 32;

/// Conv3x3 -> ReLU -> Conv3x3 -> ReLU
pub struct DoubleConv {
    conv1: Conv2d,
    relu1: Relu,
    conv2: Conv2d,
    relu2: Relu,
}

impl DoubleConv {
    pub fn new<R: Rng>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self {
            conv1: Conv2d::new(in_channels, out_channels, 3, 1, rng),
            relu1: Relu::new(),
            conv2: Conv2d::new(out_channels, out_channels, 3, 1, rng),
            relu2: Relu::new(),
        }
    }
}

impl Module for DoubleConv {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let x = self.conv1.forward(x)?;
        let x = self.relu1.forward(&x)?;
        let x = self.conv2.forward(&x)?;
        self.relu2.forward(&x)
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let g = self.relu2.backward(grad)?;
        let g = self.conv2.backward(&g)?;
        let g = self.relu1.backward(&g)?;
        self.conv1.backward(&g)
    }

    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        // indices follow the sequential block layout: conv, relu, conv, relu
        nest(vec![
            ("block.0", self.conv1.params_mut()),
            ("block.2", self.conv2.params_mut()),
        ])
    }
}

/// Encoder/decoder with skip connections at three resolutions.
///
/// Channel widths are `w, 2w, 4w` with an `8w` bottleneck; the
/// default `w` is 32.
pub struct UNetSmall {
    in_channels: usize,
    out_channels: usize,
    width: usize,
    down1: DoubleConv,
    pool1: MaxPool2d,
    down2: DoubleConv,
    pool2: MaxPool2d,
    down3: DoubleConv,
    pool3: MaxPool2d,
    bottleneck: DoubleConv,
    up3: ConvTranspose2d,
    dec3: DoubleConv,
    up2: ConvTranspose2d,
    dec2: DoubleConv,
    up1: ConvTranspose2d,
    dec1: DoubleConv,
    final_conv: Conv2d,
}

impl UNetSmall {
    pub fn new<R: Rng>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        Self::with_width(in_channels, out_channels, DEFAULT_WIDTH, rng)
    }

    pub fn with_width<R: Rng>(in_channels: usize, out_channels: usize, width: usize, rng: &mut R) -> Self {
        let (b1, b2, b3, b4) = (width, width * 2, width * 4, width * 8);
        Self {
            in_channels,
            out_channels,
            width,
            down1: DoubleConv::new(in_channels, b1, rng),
            pool1: MaxPool2d::new(),
            down2: DoubleConv::new(b1, b2, rng),
            pool2: MaxPool2d::new(),
            down3: DoubleConv::new(b2, b3, rng),
            pool3: MaxPool2d::new(),
            bottleneck: DoubleConv::new(b3, b4, rng),
            up3: ConvTranspose2d::new(b4, b3, rng),
            dec3: DoubleConv::new(b4, b3, rng),
            up2: ConvTranspose2d::new(b3, b2, rng),
            dec2: DoubleConv::new(b3, b2, rng),
            up1: ConvTranspose2d::new(b2, b1, rng),
            dec1: DoubleConv::new(b2, b1, rng),
            final_conv: Conv2d::new(b1, out_channels, 1, 0, rng),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_params(&mut self) -> usize {
        self.params_mut().iter().map(|(_, p)| p.len()).sum()
    }

    pub fn zero_grad(&mut self) {
        for (_, p) in self.params_mut() {
            p.zero_grad();
        }
    }

    /// Write all parameters to an `.npz` archive keyed by parameter name
    pub fn save_checkpoint(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut npz = NpzWriter::new_compressed(File::create(path)?);
        for (name, p) in self.params_mut() {
            npz.add_array(name, &p.value)?;
        }
        npz.finish()?;
        info!("Saved model to {}", path.display());
        Ok(())
    }

    /// Load parameters written by [`save_checkpoint`](Self::save_checkpoint).
    ///
    /// Every parameter must be present with a matching shape.
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let mut npz = NpzReader::new(File::open(path)?)?;
        let mut stored: BTreeMap<String, ArrayD<f32>> = BTreeMap::new();
        for name in npz.names()? {
            let arr = npz.by_name::<OwnedRepr<f32>, IxDyn>(&name)?;
            stored.insert(name.trim_end_matches(".npy").to_string(), arr);
        }

        for (name, p) in self.params_mut() {
            let arr = stored
                .remove(&name)
                .ok_or_else(|| UnetError::Checkpoint(format!("missing parameter {name}")))?;
            if arr.shape() != p.value.shape() {
                return Err(UnetError::Checkpoint(format!(
                    "{name}: expected shape {:?}, found {:?}",
                    p.value.shape(),
                    arr.shape()
                )));
            }
            p.value = arr;
        }
        if let Some(extra) = stored.keys().next() {
            return Err(UnetError::Checkpoint(format!("unexpected parameter {extra}")));
        }
        Ok(())
    }
}

impl Module for UNetSmall {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, _, h, w) = x.dim();
        if h % SIZE_MULTIPLE != 0 || w % SIZE_MULTIPLE != 0 {
            return Err(UnetError::InvalidInput(format!(
                "input is {h}x{w}; height and width must be multiples of {SIZE_MULTIPLE}"
            )));
        }

        let x1 = self.down1.forward(x)?;
        let x2 = self.down2.forward(&self.pool1.forward(&x1)?)?;
        let x3 = self.down3.forward(&self.pool2.forward(&x2)?)?;
        let xb = self.bottleneck.forward(&self.pool3.forward(&x3)?)?;

        let d3 = self.dec3.forward(&concat_channels(&self.up3.forward(&xb)?, &x3)?)?;
        let d2 = self.dec2.forward(&concat_channels(&self.up2.forward(&d3)?, &x2)?)?;
        let d1 = self.dec1.forward(&concat_channels(&self.up1.forward(&d2)?, &x1)?)?;
        self.final_conv.forward(&d1)
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let (b1, b2, b3) = (self.width, self.width * 2, self.width * 4);

        let g = self.final_conv.backward(grad)?;
        let (g_up1, g_x1) = split_channels(&self.dec1.backward(&g)?, b1);
        let g = self.up1.backward(&g_up1)?;
        let (g_up2, g_x2) = split_channels(&self.dec2.backward(&g)?, b2);
        let g = self.up2.backward(&g_up2)?;
        let (g_up3, g_x3) = split_channels(&self.dec3.backward(&g)?, b3);
        let g = self.up3.backward(&g_up3)?;

        let g = self.pool3.backward(&self.bottleneck.backward(&g)?)? + &g_x3;
        let g = self.pool2.backward(&self.down3.backward(&g)?)? + &g_x2;
        let g = self.pool1.backward(&self.down2.backward(&g)?)? + &g_x1;
        self.down1.backward(&g)
    }

    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        nest(vec![
            ("down1", self.down1.params_mut()),
            ("down2", self.down2.params_mut()),
            ("down3", self.down3.params_mut()),
            ("bottleneck", self.bottleneck.params_mut()),
            ("up3", self.up3.params_mut()),
            ("dec3", self.dec3.params_mut()),
            ("up2", self.up2.params_mut()),
            ("dec2", self.dec2.params_mut()),
            ("up1", self.up1.params_mut()),
            ("dec1", self.dec1.params_mut()),
            ("final_conv", self.final_conv.params_mut()),
        ])
    }
}
