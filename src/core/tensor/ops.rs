use super::Tensor;
use crate::error::{Error, Result};
use rayon::prelude::*;

/// Below this many output rows a product runs on the calling thread.
const PAR_MIN_ROWS: usize = 64;

pub trait TensorOps {
    /// `out[r] = dot(row r, x) + bias[r]`.
    fn matvec(&self, x: &[f32], bias: Option<&Tensor>, out: &mut [f32]) -> Result<()>;
    fn row(&self, index: usize) -> Option<&[f32]>;
}

impl TensorOps for Tensor {
    fn matvec(&self, x: &[f32], bias: Option<&Tensor>, out: &mut [f32]) -> Result<()> {
        let n_in = self.row_len();
        let n_out = self.rows();

        if x.len() != n_in || out.len() != n_out {
            return Err(Error::format(format!(
                "matvec: weight [{}, {}] against input {} / output {}",
                n_in, n_out, x.len(), out.len()
            )));
        }
        if let Some(b) = bias {
            if b.numel() != n_out {
                return Err(Error::format(format!(
                    "matvec: bias of {} for {} rows", b.numel(), n_out
                )));
            }
        }

        let weights = self.data();
        let row_value = |r: usize| {
            let row = &weights[r * n_in..(r + 1) * n_in];
            dot(row, x) + bias.map(|b| b.data()[r]).unwrap_or(0.0)
        };

        // Each row is reduced sequentially, so the result does not depend on
        // how rows are spread across threads.
        if n_out >= PAR_MIN_ROWS {
            out.par_iter_mut()
                .enumerate()
                .for_each(|(r, o)| *o = row_value(r));
        } else {
            for (r, o) in out.iter_mut().enumerate() {
                *o = row_value(r);
            }
        }

        Ok(())
    }

    fn row(&self, index: usize) -> Option<&[f32]> {
        let n = self.row_len();
        if index >= self.rows() {
            return None;
        }
        self.data().get(index * n..(index + 1) * n)
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

pub fn layer_norm(x: &[f32], weight: &Tensor, bias: &Tensor, eps: f32, out: &mut [f32]) {
    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|&v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = (var + eps).sqrt();

    for (((o, &v), &w), &b) in out.iter_mut()
        .zip(x)
        .zip(weight.data())
        .zip(bias.data())
    {
        *o = (v - mean) / std * w + b;
    }
}

pub fn gelu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        let t = *v;
        *v = 0.5 * t * (1.0 + (0.797_884_6 * (t + 0.044_715 * t * t * t)).tanh());
    }
}

pub fn softmax_inplace(x: &mut [f32]) {
    let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

pub fn add_inplace(acc: &mut [f32], other: &[f32]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a += b;
    }
}
