//! Layers with hand-written backward passes
//!
//! Tensors are `(batch, channels, height, width)` arrays. Every layer keeps
//! what its backward pass needs from the most recent forward call, and
//! parameter gradients accumulate into [`Param::grad`] until cleared.

use crate::error::{Result, UnetError};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView3, Axis, Ix1, IxDyn, Zip};
use rand::Rng;
use rayon::prelude::*;

/// A trainable tensor and its accumulated gradient
#[derive(Debug, Clone)]
pub struct Param {
    pub value: ArrayD<f32>,
    pub grad: ArrayD<f32>,
}

impl Param {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            value: ArrayD::zeros(IxDyn(shape)),
            grad: ArrayD::zeros(IxDyn(shape)),
        }
    }

    /// Values drawn from U(-bound, bound)
    pub fn uniform<R: Rng>(shape: &[usize], bound: f32, rng: &mut R) -> Self {
        Self {
            value: ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-bound..bound)),
            grad: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    fn accumulate(&mut self, delta: ArrayD<f32>) -> Result<()> {
        let delta = delta.into_shape_with_order(self.value.shape())?;
        self.grad += &delta;
        Ok(())
    }
}

/// A differentiable block
pub trait Module {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>>;

    /// Gradient of the loss with respect to the last forward input, given
    /// the gradient with respect to its output
    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>>;

    /// Trainable tensors by dotted name, e.g. `block.0.weight`
    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        Vec::new()
    }
}

fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a mut Param)>) -> Vec<(String, &'a mut Param)> {
    params.into_iter().map(|(n, p)| (format!("{prefix}.{n}"), p)).collect()
}

pub(crate) fn nest<'a>(parts: Vec<(&str, Vec<(String, &'a mut Param)>)>) -> Vec<(String, &'a mut Param)> {
    parts.into_iter().flat_map(|(prefix, params)| prefixed(prefix, params)).collect()
}

fn expect_channels(layer: &'static str, x: &Array4<f32>, channels: usize) -> Result<()> {
    if x.dim().1 != channels {
        return Err(UnetError::InvalidInput(format!(
            "{layer} expects {channels} input channels, got {}",
            x.dim().1
        )));
    }
    Ok(())
}

/// Unfold `k x k` patches (zero padded) into columns: `(c*k*k, oh*ow)`
fn im2col(x: ArrayView3<f32>, k: usize, pad: usize) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let oh = h + 2 * pad + 1 - k;
    let ow = w + 2 * pad + 1 - k;
    let mut cols = Array2::zeros((c * k * k, oh * ow));

    for ci in 0..c {
        for ki in 0..k {
            for kj in 0..k {
                let mut dst = cols.row_mut((ci * k + ki) * k + kj);
                for oy in 0..oh {
                    let Some(iy) = (oy + ki).checked_sub(pad).filter(|&iy| iy < h) else {
                        continue;
                    };
                    for ox in 0..ow {
                        if let Some(ix) = (ox + kj).checked_sub(pad).filter(|&ix| ix < w) {
                            dst[oy * ow + ox] = x[[ci, iy, ix]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Inverse of [`im2col`], summing overlapping contributions
fn col2im(cols: ArrayView2<f32>, c: usize, h: usize, w: usize, k: usize, pad: usize) -> Array3<f32> {
    let oh = h + 2 * pad + 1 - k;
    let ow = w + 2 * pad + 1 - k;
    let mut x = Array3::zeros((c, h, w));

    for ci in 0..c {
        for ki in 0..k {
            for kj in 0..k {
                let src = cols.row((ci * k + ki) * k + kj);
                for oy in 0..oh {
                    let Some(iy) = (oy + ki).checked_sub(pad).filter(|&iy| iy < h) else {
                        continue;
                    };
                    for ox in 0..ow {
                        if let Some(ix) = (ox + kj).checked_sub(pad).filter(|&ix| ix < w) {
                            x[[ci, iy, ix]] += src[oy * ow + ox];
                        }
                    }
                }
            }
        }
    }
    x
}

struct ConvCache {
    cols: Vec<Array2<f32>>,
    input: (usize, usize, usize, usize),
}

/// 2-D convolution, stride 1, zero padding
pub struct Conv2d {
    /// `(out, in, k, k)`
    pub weight: Param,
    /// `(out)`
    pub bias: Param,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    cache: Option<ConvCache>,
}

impl Conv2d {
    pub fn new<R: Rng>(in_channels: usize, out_channels: usize, kernel: usize, padding: usize, rng: &mut R) -> Self {
        let bound = 1.0 / ((in_channels * kernel * kernel) as f32).sqrt();
        Self {
            weight: Param::uniform(&[out_channels, in_channels, kernel, kernel], bound, rng),
            bias: Param::uniform(&[out_channels], bound, rng),
            in_channels,
            out_channels,
            kernel,
            padding,
            cache: None,
        }
    }

    fn weight_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        let patch = self.in_channels * self.kernel * self.kernel;
        Ok(self.weight.value.view().into_shape_with_order((self.out_channels, patch))?)
    }
}

impl Module for Conv2d {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        expect_channels("Conv2d", x, self.in_channels)?;
        let (b, c, h, w) = x.dim();
        if h + 2 * self.padding < self.kernel || w + 2 * self.padding < self.kernel {
            return Err(UnetError::InvalidInput(format!("{h}x{w} input is smaller than the kernel")));
        }
        let (k, pad, o) = (self.kernel, self.padding, self.out_channels);
        let oh = h + 2 * pad + 1 - k;
        let ow = w + 2 * pad + 1 - k;

        let wm = self.weight_matrix()?;
        let bias = self.bias.value.view().into_dimensionality::<Ix1>()?;
        let bias = bias.insert_axis(Axis(1));

        let per_sample: Vec<(Array2<f32>, Array2<f32>)> = (0..b)
            .into_par_iter()
            .map(|i| {
                let cols = im2col(x.index_axis(Axis(0), i), k, pad);
                let y = wm.dot(&cols) + &bias;
                (cols, y)
            })
            .collect();

        let mut out = Array4::zeros((b, o, oh, ow));
        let mut cols = Vec::with_capacity(b);
        for (i, (c_i, y)) in per_sample.into_iter().enumerate() {
            out.index_axis_mut(Axis(0), i).assign(&y.into_shape_with_order((o, oh, ow))?);
            cols.push(c_i);
        }
        self.cache = Some(ConvCache {
            cols,
            input: (b, c, h, w),
        });
        Ok(out)
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let cache = self.cache.as_ref().ok_or(UnetError::NoForward("Conv2d"))?;
        let (b, c, h, w) = cache.input;
        let (_, o, oh, ow) = grad.dim();
        let grad = grad.as_standard_layout();
        let wm = self.weight_matrix()?;
        let (k, pad) = (self.kernel, self.padding);

        let per_sample: Vec<(Array2<f32>, Array1<f32>, Array3<f32>)> = (0..b)
            .into_par_iter()
            .map(|i| -> Result<(Array2<f32>, Array1<f32>, Array3<f32>)> {
                let g = grad.index_axis(Axis(0), i).into_shape_with_order((o, oh * ow))?;
                let dw = g.dot(&cache.cols[i].t());
                let db = g.sum_axis(Axis(1));
                let dcols = wm.t().dot(&g);
                Ok((dw, db, col2im(dcols.view(), c, h, w, k, pad)))
            })
            .collect::<Result<_>>()?;

        let mut dx = Array4::zeros((b, c, h, w));
        let mut dw_total = Array2::<f32>::zeros((o, c * k * k));
        let mut db_total = Array1::<f32>::zeros(o);
        for (i, (dw, db, dxi)) in per_sample.into_iter().enumerate() {
            dw_total += &dw;
            db_total += &db;
            dx.index_axis_mut(Axis(0), i).assign(&dxi);
        }
        self.weight.accumulate(dw_total.into_dyn())?;
        self.bias.accumulate(db_total.into_dyn())?;
        Ok(dx)
    }

    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        vec![("weight".into(), &mut self.weight), ("bias".into(), &mut self.bias)]
    }
}

/// Transposed convolution with kernel 2 and stride 2: doubles H and W
pub struct ConvTranspose2d {
    /// `(in, out, 2, 2)`
    pub weight: Param,
    /// `(out)`
    pub bias: Param,
    in_channels: usize,
    out_channels: usize,
    input: Option<Array4<f32>>,
}

impl ConvTranspose2d {
    pub fn new<R: Rng>(in_channels: usize, out_channels: usize, rng: &mut R) -> Self {
        // torch derives fan_in from dim 1 of the weight, i.e. out * k * k
        let bound = 1.0 / ((out_channels * 4) as f32).sqrt();
        Self {
            weight: Param::uniform(&[in_channels, out_channels, 2, 2], bound, rng),
            bias: Param::uniform(&[out_channels], bound, rng),
            in_channels,
            out_channels,
            input: None,
        }
    }

    fn weight_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        Ok(self.weight.value.view().into_shape_with_order((self.in_channels, self.out_channels * 4))?)
    }
}

impl Module for ConvTranspose2d {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        expect_channels("ConvTranspose2d", x, self.in_channels)?;
        let (b, c, h, w) = x.dim();
        let o = self.out_channels;
        let wm = self.weight_matrix()?;
        let bias = self.bias.value.view().into_dimensionality::<Ix1>()?;

        let mut out = Array4::zeros((b, o, 2 * h, 2 * w));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .try_for_each(|(i, mut out_i)| -> Result<()> {
                let xi = x.index_axis(Axis(0), i).as_standard_layout().into_owned();
                let xm = xi.into_shape_with_order((c, h * w))?;
                // rows are (o, di, dj)
                let y = wm.t().dot(&xm);
                for oc in 0..o {
                    for di in 0..2 {
                        for dj in 0..2 {
                            let row = y.row((oc * 2 + di) * 2 + dj);
                            let mut dst = out_i.slice_mut(s![oc, di..;2, dj..;2]);
                            for (idx, v) in dst.iter_mut().enumerate() {
                                *v = row[idx] + bias[oc];
                            }
                        }
                    }
                }
                Ok(())
            })?;

        self.input = Some(x.clone());
        Ok(out)
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let x = self.input.as_ref().ok_or(UnetError::NoForward("ConvTranspose2d"))?;
        let (b, c, h, w) = x.dim();
        let o = self.out_channels;
        let wm = self.weight_matrix()?;

        let per_sample: Vec<(Array2<f32>, Array2<f32>)> = (0..b)
            .into_par_iter()
            .map(|i| -> Result<(Array2<f32>, Array2<f32>)> {
                let gi = grad.index_axis(Axis(0), i);
                let mut g = Array2::<f32>::zeros((o * 4, h * w));
                for oc in 0..o {
                    for di in 0..2 {
                        for dj in 0..2 {
                            let src = gi.slice(s![oc, di..;2, dj..;2]);
                            let mut row = g.row_mut((oc * 2 + di) * 2 + dj);
                            for (dst, v) in row.iter_mut().zip(src.iter()) {
                                *dst = *v;
                            }
                        }
                    }
                }
                let xm = x.index_axis(Axis(0), i).as_standard_layout().into_owned().into_shape_with_order((c, h * w))?;
                let dw = xm.dot(&g.t());
                let dx = wm.dot(&g);
                Ok((dw, dx))
            })
            .collect::<Result<_>>()?;

        let mut dx = Array4::zeros((b, c, h, w));
        let mut dw_total = Array2::<f32>::zeros((c, o * 4));
        for (i, (dw, dxi)) in per_sample.into_iter().enumerate() {
            dw_total += &dw;
            dx.index_axis_mut(Axis(0), i).assign(&dxi.into_shape_with_order((c, h, w))?);
        }
        let db = grad.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0));
        self.weight.accumulate(dw_total.into_dyn())?;
        self.bias.accumulate(db.into_dyn())?;
        Ok(dx)
    }

    fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
        vec![("weight".into(), &mut self.weight), ("bias".into(), &mut self.bias)]
    }
}

/// 2x2 max pooling, stride 2. H and W must be even.
#[derive(Default)]
pub struct MaxPool2d {
    /// Position of the maximum inside each window, `di * 2 + dj`
    argmax: Option<Array4<u8>>,
}

impl MaxPool2d {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for MaxPool2d {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let (b, c, h, w) = x.dim();
        if h % 2 != 0 || w % 2 != 0 {
            return Err(UnetError::InvalidInput(format!("MaxPool2d needs even H and W, got {h}x{w}")));
        }
        let mut out = Array4::zeros((b, c, h / 2, w / 2));
        let mut argmax = Array4::<u8>::zeros((b, c, h / 2, w / 2));

        Zip::indexed(&mut out).and(&mut argmax).par_for_each(|(bi, ci, y, xx), o, a| {
            let mut best = f32::NEG_INFINITY;
            let mut at = 0u8;
            for d in 0..4u8 {
                let v = x[[bi, ci, 2 * y + (d / 2) as usize, 2 * xx + (d % 2) as usize]];
                if v > best || (d == 0 && v.is_nan()) {
                    best = v;
                    at = d;
                }
            }
            *o = best;
            *a = at;
        });

        self.argmax = Some(argmax);
        Ok(out)
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let argmax = self.argmax.as_ref().ok_or(UnetError::NoForward("MaxPool2d"))?;
        let (b, c, h, w) = argmax.dim();
        let mut dx = Array4::zeros((b, c, 2 * h, 2 * w));
        for ((bi, ci, y, xx), &a) in argmax.indexed_iter() {
            let (di, dj) = ((a / 2) as usize, (a % 2) as usize);
            dx[[bi, ci, 2 * y + di, 2 * xx + dj]] = grad[[bi, ci, y, xx]];
        }
        Ok(dx)
    }
}

#[derive(Default)]
pub struct Relu {
    active: Option<Array4<bool>>,
}

impl Relu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for Relu {
    fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
        self.active = Some(x.mapv(|v| v > 0.0));
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
        let active = self.active.as_ref().ok_or(UnetError::NoForward("Relu"))?;
        let mut dx = grad.clone();
        Zip::from(&mut dx).and(active).for_each(|g, &on| {
            if !on {
                *g = 0.0;
            }
        });
        Ok(dx)
    }
}

/// Join two tensors along the channel axis
pub fn concat_channels(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
    Ok(ndarray::concatenate(Axis(1), &[a.view(), b.view()])?)
}

/// Split a channel-concatenated gradient back into its two parts
pub fn split_channels(grad: &Array4<f32>, first: usize) -> (Array4<f32>, Array4<f32>) {
    (
        grad.slice(s![.., ..first, .., ..]).to_owned(),
        grad.slice(s![.., first.., .., ..]).to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    fn random(shape: (usize, usize, usize, usize), rng: &mut ChaCha8Rng) -> Array4<f32> {
        Array4::from_shape_simple_fn(shape, || rng.gen_range(-1.0..1.0))
    }

    /// Loss = sum(out * probe); checks d loss / d input against finite differences
    fn check_input_grad<M: Module>(m: &mut M, x: &Array4<f32>, probe_seed: u64) {
        let out = m.forward(x).unwrap();
        let mut r = ChaCha8Rng::seed_from_u64(probe_seed);
        let probe = random(out.dim(), &mut r);
        let analytic = m.backward(&probe).unwrap();

        let eps = 1e-2f32;
        for idx in [[0, 0, 0, 0], [0, 0, 1, 1], [x.dim().0 - 1, x.dim().1 - 1, x.dim().2 - 1, x.dim().3 - 1]] {
            let mut xp = x.clone();
            xp[idx] += eps;
            let mut xm = x.clone();
            xm[idx] -= eps;
            let lp = (m.forward(&xp).unwrap() * &probe).sum();
            let lm = (m.forward(&xm).unwrap() * &probe).sum();
            let numeric = (lp - lm) / (2.0 * eps);
            assert_relative_eq!(analytic[idx], numeric, epsilon = 2e-2, max_relative = 2e-2);
        }
    }

    #[test]
    fn conv_identity_kernel() {
        let mut r = rng();
        let mut conv = Conv2d::new(1, 1, 3, 1, &mut r);
        conv.weight.value.fill(0.0);
        conv.weight.value[[0, 0, 1, 1]] = 1.0;
        conv.bias.value.fill(0.5);

        let x = random((2, 1, 5, 4), &mut r);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dim(), (2, 1, 5, 4));
        assert_relative_eq!(y[[1, 0, 3, 2]], x[[1, 0, 3, 2]] + 0.5);
    }

    #[test]
    fn conv_gradients() {
        let mut r = rng();
        let mut conv = Conv2d::new(2, 3, 3, 1, &mut r);
        let x = random((2, 2, 4, 5), &mut r);
        check_input_grad(&mut conv, &x, 1);

        // bias gradient equals the summed upstream gradient
        conv.weight.zero_grad();
        conv.bias.zero_grad();
        let out = conv.forward(&x).unwrap();
        conv.backward(&Array4::ones(out.dim())).unwrap();
        assert_relative_eq!(conv.bias.grad[[0]], (2 * 4 * 5) as f32);
    }

    #[test]
    fn transpose_conv_doubles_and_differentiates() {
        let mut r = rng();
        let mut up = ConvTranspose2d::new(3, 2, &mut r);
        let x = random((1, 3, 3, 2), &mut r);
        let y = up.forward(&x).unwrap();
        assert_eq!(y.dim(), (1, 2, 6, 4));

        let expected: f32 = (0..3).map(|c| x[[0, c, 1, 1]] * up.weight.value[[c, 1, 0, 1]]).sum::<f32>() + up.bias.value[[1]];
        assert_relative_eq!(y[[0, 1, 2, 3]], expected, epsilon = 1e-6);

        check_input_grad(&mut up, &x, 2);
    }

    #[test]
    fn maxpool_routes_gradient_to_max() {
        let x = Array4::from_shape_vec((1, 1, 2, 4), vec![1.0, 5.0, 0.0, -1.0, 2.0, 3.0, -2.0, -3.0]).unwrap();
        let mut pool = MaxPool2d::new();
        let y = pool.forward(&x).unwrap();
        assert_eq!(y.into_raw_vec_and_offset().0, vec![5.0, 0.0]);

        let dx = pool.backward(&Array4::from_elem((1, 1, 1, 2), 1.0)).unwrap();
        assert_eq!(dx.into_raw_vec_and_offset().0, vec![0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!(MaxPool2d::new().forward(&Array4::zeros((1, 1, 3, 4))).is_err());
    }

    #[test]
    fn relu_masks_gradient() {
        let x = Array4::from_shape_vec((1, 1, 1, 3), vec![-1.0, 0.0, 2.0]).unwrap();
        let mut relu = Relu::new();
        let y = relu.forward(&x).unwrap();
        assert_eq!(y.into_raw_vec_and_offset().0, vec![0.0, 0.0, 2.0]);
        let dx = relu.backward(&Array4::ones((1, 1, 1, 3))).unwrap();
        assert_eq!(dx.into_raw_vec_and_offset().0, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn concat_and_split() {
        let a = Array4::from_elem((2, 3, 2, 2), 1.0);
        let b = Array4::from_elem((2, 1, 2, 2), 2.0);
        let c = concat_channels(&a, &b).unwrap();
        assert_eq!(c.dim(), (2, 4, 2, 2));
        let (ga, gb) = split_channels(&c, 3);
        assert_eq!(ga, a);
        assert_eq!(gb, b);
    }

    #[test]
    fn channel_mismatch_is_an_error() {
        let mut conv = Conv2d::new(2, 4, 3, 1, &mut rng());
        assert!(matches!(conv.forward(&Array4::zeros((1, 1, 4, 4))), Err(UnetError::InvalidInput(_))));
        assert!(matches!(conv.backward(&Array4::zeros((1, 4, 4, 4))), Err(UnetError::NoForward(_))));
    }
}
