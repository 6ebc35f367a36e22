//! Binary cross-entropy on logits

use crate::error::{Result, UnetError};
use ndarray::{Array4, Zip};

pub fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Mean binary cross-entropy of `sigmoid(logits)` against `targets` in [0, 1].
///
/// Returns the loss and its gradient with respect to the logits.
pub fn bce_with_logits(logits: &Array4<f32>, targets: &Array4<f32>) -> Result<(f32, Array4<f32>)> {
    if logits.dim() != targets.dim() {
        return Err(UnetError::InvalidInput(format!(
            "logits {:?} and targets {:?} differ in shape",
            logits.dim(),
            targets.dim()
        )));
    }
    let n = logits.len().max(1) as f32;

    let mut total = 0.0f64;
    let mut grad = Array4::zeros(logits.dim());
    Zip::from(&mut grad).and(logits).and(targets).for_each(|g, &z, &y| {
        // max(z, 0) - z*y + ln(1 + e^-|z|)
        total += f64::from(z.max(0.0) - z * y + (-z.abs()).exp().ln_1p());
        *g = (sigmoid(z) - y) / n;
    });
    Ok(((total / f64::from(n)) as f32, grad))
}
