use candle_core::{DType, Device, Result, Tensor, D};

const ROTARY_BASE: f32 = 10_000.0;

/// Precomputed cos/sin tables keyed by token age (in days) rather than token position.
#[derive(Debug, Clone)]
pub(crate) struct RotaryTables {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryTables {
    /// Tables of shape `[rows, len, dim / 2]`.
    pub(crate) fn new(
        ages: &[f32],
        rows: usize,
        len: usize,
        dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let half = dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / ROTARY_BASE.powf(2.0 * i as f32 / dim as f32))
            .collect();
        let mut cos = Vec::with_capacity(ages.len() * half);
        let mut sin = Vec::with_capacity(ages.len() * half);
        for &age in ages {
            for &freq in &inv_freq {
                let angle = age * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        Ok(Self {
            cos: Tensor::from_vec(cos, (rows, len, half), device)?.to_dtype(dtype)?,
            sin: Tensor::from_vec(sin, (rows, len, half), device)?.to_dtype(dtype)?,
        })
    }

    /// Rotates `[rows, len, dim]`.
    pub(crate) fn apply(&self, x: &Tensor) -> Result<Tensor> {
        rotate(x, &self.cos, &self.sin)
    }

    /// Rotates `[rows, heads, len, head_dim]`, sharing the table across heads.
    pub(crate) fn apply_heads(&self, x: &Tensor) -> Result<Tensor> {
        rotate(x, &self.cos.unsqueeze(1)?, &self.sin.unsqueeze(1)?)
    }
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated_1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
    let rotated_2 = (x1.broadcast_mul(sin)? + x2.broadcast_mul(cos)?)?;
    Tensor::cat(&[&rotated_1, &rotated_2], D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_age_is_identity() {
        let device = Device::Cpu;
        let tables = RotaryTables::new(&[0.0, 0.0], 1, 2, 4, DType::F32, &device).unwrap();
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], (1, 2, 4), &device)
            .unwrap();
        let rotated = tables.apply(&x).unwrap();
        assert_eq!(
            rotated.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn rotation_preserves_norm() {
        let device = Device::Cpu;
        let tables = RotaryTables::new(&[3.5], 1, 1, 2, DType::F32, &device).unwrap();
        let x = Tensor::from_vec(vec![0.6f32, 0.8], (1, 1, 2), &device).unwrap();
        let rotated = tables.apply(&x).unwrap();
        let norm: f32 = rotated
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0()
            .unwrap();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
