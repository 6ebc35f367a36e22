//! Adam optimizer

use crate::layers::Module;
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: i32,
    /// First and second moment estimates by parameter name
    moments: HashMap<String, (ArrayD<f32>, ArrayD<f32>)>,
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            moments: HashMap::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Apply one update from the gradients accumulated in `model`
    pub fn step<M: Module>(&mut self, model: &mut M) {
        self.t += 1;
        let (b1, b2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);
        let bias1 = 1.0 - b1.powi(self.t);
        let bias2 = 1.0 - b2.powi(self.t);

        for (name, p) in model.params_mut() {
            let (m, v) = self
                .moments
                .entry(name)
                .or_insert_with(|| (ArrayD::zeros(p.value.raw_dim()), ArrayD::zeros(p.value.raw_dim())));
            Zip::from(&mut p.value)
                .and(&p.grad)
                .and(m)
                .and(v)
                .for_each(|w, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::layers::Param;
    use approx::assert_relative_eq;
    use ndarray::{Array4, IxDyn};

    struct Scalar(Param);

    impl Module for Scalar {
        fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
            Ok(x.clone())
        }
        fn backward(&mut self, grad: &Array4<f32>) -> Result<Array4<f32>> {
            Ok(grad.clone())
        }
        fn params_mut(&mut self) -> Vec<(String, &mut Param)> {
            vec![("w".into(), &mut self.0)]
        }
    }

    #[test]
    fn first_step_moves_by_lr() {
        let mut s = Scalar(Param::zeros(&[1]));
        s.0.value[IxDyn(&[0])] = 1.0;
        s.0.grad[IxDyn(&[0])] = 0.3;
        let mut adam = Adam::new(0.1);
        adam.step(&mut s);
        // bias-corrected first step is lr * sign(g)
        assert_relative_eq!(s.0.value[IxDyn(&[0])], 0.9, epsilon = 1e-5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimizes_quadratic() {
        let mut s = Scalar(Param::zeros(&[1]));
        s.0.value[IxDyn(&[0])] = 3.0;
        let mut adam = Adam::new(0.05);
        for _ in 0..500 {
            let w = s.0.value[IxDyn(&[0])];
            s.0.grad[IxDyn(&[0])] = 2.0 * (w - 1.0);
            adam.step(&mut s);
        }
        assert_relative_eq!(s.0.value[IxDyn(&[0])], 1.0, epsilon = 0.05);
    }
}
