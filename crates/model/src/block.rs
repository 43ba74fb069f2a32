use candle_core::{DType, Result, Tensor, D};
use rand::Rng;

use crate::{
    config::{RotaryMode, TransformerConfig},
    model::Phase,
    params::ParameterSet,
    rotary::RotaryTables,
};

const NORM_EPS: f64 = 1e-6;

/// Affine projection `x @ w + b` with `w` stored as `[in, out]`.
pub(crate) fn linear(x: &Tensor, params: &ParameterSet, module: &str) -> Result<Tensor> {
    let w = params.require(module, "w")?;
    let b = params.require(module, "b")?;
    x.broadcast_matmul(w)?.broadcast_add(b)
}

/// RMS normalization computed in f32 and cast back to the input dtype.
pub(crate) fn rms_norm(x: &Tensor, params: &ParameterSet, module: &str) -> Result<Tensor> {
    let scale = params.require(module, "scale")?;
    let dtype = x.dtype();
    let x32 = x.to_dtype(DType::F32)?;
    let rms = x32
        .sqr()?
        .mean_keepdim(D::Minus1)?
        .affine(1.0, NORM_EPS)?
        .sqrt()?;
    x32.broadcast_div(&rms)?.to_dtype(dtype)?.broadcast_mul(scale)
}

/// Inverted dropout driven by the caller's RNG. A no-op outside training.
pub(crate) fn dropout(x: &Tensor, p: f32, phase: &mut Phase<'_>) -> Result<Tensor> {
    let Phase::Train(rng) = phase else {
        return Ok(x.clone());
    };
    if p <= 0.0 {
        return Ok(x.clone());
    }
    let keep = 1.0 - p;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| {
            if rng.gen::<f32>() < keep {
                1.0 / keep
            } else {
                0.0
            }
        })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    x.mul(&mask)
}

pub(crate) struct LayerInputs<'a> {
    /// Additive attention mask `[rows, 1, len, len]` in f32.
    pub mask: &'a Tensor,
    pub rotary: Option<&'a RotaryTables>,
}

/// One pre-norm transformer layer: local causal self-attention followed by a GELU feed-forward.
pub(crate) fn transformer_layer(
    index: usize,
    x: &Tensor,
    params: &ParameterSet,
    config: &TransformerConfig,
    inputs: &LayerInputs<'_>,
    phase: &mut Phase<'_>,
) -> Result<Tensor> {
    let prefix = format!("transformer/layer_{index}");
    let (rows, len, hidden) = x.dims3()?;
    let heads = config.n_heads;
    let head_dim = config.head_dim();
    let p = config.internal_dropout;

    let normed = rms_norm(x, params, &format!("{prefix}/attn_norm"))?;
    let qkv = linear(&normed, params, &format!("{prefix}/qkv"))?;
    let mut q = qkv.narrow(D::Minus1, 0, hidden)?;
    let mut k = qkv.narrow(D::Minus1, hidden, hidden)?;
    let v = qkv.narrow(D::Minus1, 2 * hidden, hidden)?;

    if let (RotaryMode::Global, Some(rotary)) = (config.rotary, inputs.rotary) {
        q = rotary.apply(&q)?;
        k = rotary.apply(&k)?;
    }

    let split = |t: &Tensor| -> Result<Tensor> {
        t.reshape((rows, len, heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()
    };
    let mut q = split(&q)?;
    let mut k = split(&k)?;
    let v = split(&v)?;

    if let (RotaryMode::PerHead, Some(rotary)) = (config.rotary, inputs.rotary) {
        q = rotary.apply_heads(&q)?;
        k = rotary.apply_heads(&k)?;
    }

    let dtype = q.dtype();
    let scores = q
        .matmul(&k.t()?.contiguous()?)?
        .affine(1.0 / (head_dim as f64).sqrt(), 0.0)?
        .to_dtype(DType::F32)?
        .broadcast_add(inputs.mask)?;
    let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
    let probs = dropout(&probs, p, phase)?;
    let attended = probs
        .matmul(&v)?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((rows, len, hidden))?;
    let attended = linear(&attended, params, &format!("{prefix}/attn_out"))?;
    let x = (x + dropout(&attended, p, phase)?)?;

    let normed = rms_norm(&x, params, &format!("{prefix}/ffn_norm"))?;
    let expanded = linear(&normed, params, &format!("{prefix}/ffn_in"))?.gelu()?;
    let contracted = linear(&expanded, params, &format!("{prefix}/ffn_out"))?;
    x + dropout(&contracted, p, phase)?
}
