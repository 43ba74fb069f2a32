use candle_core::{DType, Device, Error, Result, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::{
    batch::Batch,
    block::{self, dropout, rms_norm, LayerInputs},
    config::{LabelerKind, RotaryMode, TaskDescriptor, TransformerConfig},
    heads::{self, TaskOutput},
    params::{ParamPath, ParameterSet},
    rotary::RotaryTables,
};

pub const EMBEDDING_MODULE: &str = "transformer/embed";
pub const FINAL_NORM_MODULE: &str = "transformer/final_norm";

const INIT_STD: f64 = 0.02;
const MASKED_SCORE: f32 = -1e9;

/// Whether a forward pass is training (dropout active, driven by the given RNG) or evaluating.
pub enum Phase<'a> {
    Train(&'a mut StdRng),
    Eval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    Normal,
    Zeros,
    Ones,
}

/// Shape and initializer of one parameter produced by [`EhrTransformer::init`].
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub path: ParamPath,
    pub shape: Vec<usize>,
    pub init: Init,
}

/// Contextual representations gathered at every label slot.
#[derive(Debug, Clone)]
pub struct Representations {
    /// `[slots, hidden]`
    pub features: Tensor,
    /// True for slots below `num_indices` that point at a valid token.
    pub mask: Vec<bool>,
}

/// Hierarchical patient-timeline transformer evaluated functionally over a [`ParameterSet`].
#[derive(Debug, Clone)]
pub struct EhrTransformer {
    config: TransformerConfig,
    task: TaskDescriptor,
}

impl EhrTransformer {
    pub fn new(config: TransformerConfig, task: TaskDescriptor) -> Result<Self> {
        config.validate()?;
        task.validate()?;
        Ok(Self { config, task })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn task(&self) -> &TaskDescriptor {
        &self.task
    }

    /// Every parameter the model reads, transformer body first, then the task head.
    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        let hidden = self.config.hidden_size;
        let inner = self.config.intermediate_size;
        let mut specs = vec![spec(
            EMBEDDING_MODULE,
            "embeddings",
            vec![self.config.vocab_size, hidden],
            Init::Normal,
        )];
        for layer in 0..self.config.n_layers {
            let prefix = format!("transformer/layer_{layer}");
            specs.push(spec(&format!("{prefix}/attn_norm"), "scale", vec![hidden], Init::Ones));
            push_linear(&mut specs, &format!("{prefix}/qkv"), hidden, 3 * hidden);
            push_linear(&mut specs, &format!("{prefix}/attn_out"), hidden, hidden);
            specs.push(spec(&format!("{prefix}/ffn_norm"), "scale", vec![hidden], Init::Ones));
            push_linear(&mut specs, &format!("{prefix}/ffn_in"), hidden, inner);
            push_linear(&mut specs, &format!("{prefix}/ffn_out"), inner, hidden);
        }
        specs.push(spec(FINAL_NORM_MODULE, "scale", vec![hidden], Init::Ones));

        match &self.task {
            TaskDescriptor::Clmbr { vocab_size } => {
                push_linear(&mut specs, heads::CLMBR_HEAD, hidden, *vocab_size);
            }
            TaskDescriptor::SurvivalClmbr {
                time_bins,
                num_codes,
                dim,
            } => {
                push_linear(
                    &mut specs,
                    heads::SURVIVAL_CLMBR_HEAD,
                    hidden,
                    time_bins.len() * dim,
                );
                push_code_weights(&mut specs, heads::SURVIVAL_CLMBR_CODES, *num_codes, *dim);
            }
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Boolean,
            } => {
                push_linear(&mut specs, heads::BOOLEAN_HEAD, hidden, 1);
            }
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Survival { time_bins, dim },
            } => {
                push_linear(&mut specs, heads::SURVIVAL_HEAD, hidden, time_bins.len() * dim);
                push_code_weights(&mut specs, heads::SURVIVAL_CODES, 1, *dim);
            }
        }
        specs
    }

    /// Deterministic f32 initialization: the same seed always yields the same parameters.
    pub fn init(&self, seed: u64, device: &Device) -> Result<ParameterSet> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, INIT_STD)
            .map_err(|err| Error::Msg(format!("invalid init distribution: {err}")))?;
        let mut params = ParameterSet::new();
        for spec in self.parameter_specs() {
            let count: usize = spec.shape.iter().product();
            let tensor = match spec.init {
                Init::Normal => {
                    let values: Vec<f32> =
                        (0..count).map(|_| normal.sample(&mut rng) as f32).collect();
                    Tensor::from_vec(values, spec.shape.as_slice(), device)?
                }
                Init::Zeros => Tensor::zeros(spec.shape.as_slice(), DType::F32, device)?,
                Init::Ones => Tensor::ones(spec.shape.as_slice(), DType::F32, device)?,
            };
            params.insert(spec.path, tensor);
        }
        Ok(params)
    }

    /// Runs the transformer body and gathers the hidden state at each label slot.
    pub fn represent(
        &self,
        params: &ParameterSet,
        batch: &Batch,
        phase: &mut Phase<'_>,
    ) -> Result<Representations> {
        batch.validate(self.config.is_hierarchical)?;
        let slots = batch.slots();
        if slots == 0 {
            return Err(Error::Msg("batch has no label slots".into()));
        }
        let rows = batch.rows();
        let len = batch.transformer.length;
        let hidden = self.config.hidden_size;

        let embeddings = params.require(EMBEDDING_MODULE, "embeddings")?;
        let device = embeddings.device().clone();
        let dtype = embeddings.dtype();

        let mut x = self.embed(embeddings, batch)?.reshape((rows, len, hidden))?;
        x = dropout(&x, self.config.internal_dropout, phase)?;

        let mask = attention_mask(batch, self.config.attention_width, &device)?;
        let rotary = match self.config.rotary {
            RotaryMode::None => None,
            RotaryMode::Global => Some(RotaryTables::new(
                &batch.transformer.ages,
                rows,
                len,
                hidden,
                dtype,
                &device,
            )?),
            RotaryMode::PerHead => Some(RotaryTables::new(
                &batch.transformer.ages,
                rows,
                len,
                self.config.head_dim(),
                dtype,
                &device,
            )?),
        };
        let inputs = LayerInputs {
            mask: &mask,
            rotary: rotary.as_ref(),
        };

        for layer in 0..self.config.n_layers {
            x = block::transformer_layer(layer, &x, params, &self.config, &inputs, phase)?;
        }
        let x = rms_norm(&x, params, FINAL_NORM_MODULE)?;

        let indices = Tensor::from_slice(&batch.transformer.label_indices, slots, &device)?;
        let features = x.reshape((rows * len, hidden))?.index_select(&indices, 0)?;
        let mask = batch
            .transformer
            .label_indices
            .iter()
            .enumerate()
            .map(|(slot, &index)| {
                slot < batch.num_indices && batch.transformer.valid_tokens[index as usize]
            })
            .collect();

        Ok(Representations { features, mask })
    }

    /// Full forward pass through the task head.
    pub fn forward(
        &self,
        params: &ParameterSet,
        batch: &Batch,
        phase: &mut Phase<'_>,
    ) -> Result<TaskOutput> {
        let representations = self.represent(params, batch, phase)?;
        heads::apply_head(&self.task, &representations.features, params)
    }

    fn embed(&self, embeddings: &Tensor, batch: &Batch) -> Result<Tensor> {
        let device = embeddings.device();
        let t = &batch.transformer;
        if !self.config.is_hierarchical {
            let ids = Tensor::from_slice(&t.tokens, t.tokens.len(), device)?;
            return embeddings.index_select(&ids, 0);
        }

        // Weighted bag of code embeddings per token.
        let nnz = t.hierarchical_tokens.len();
        let mut targets = Vec::with_capacity(nnz);
        for (token, window) in t.token_offsets.windows(2).enumerate() {
            targets.extend(std::iter::repeat(token as u32).take((window[1] - window[0]) as usize));
        }
        let hidden = self.config.hidden_size;
        let total = Tensor::zeros((t.tokens.len(), hidden), embeddings.dtype(), device)?;
        if nnz == 0 {
            return Ok(total);
        }
        let codes = Tensor::from_slice(&t.hierarchical_tokens, nnz, device)?;
        let weights = Tensor::from_slice(&t.hierarchical_weights, (nnz, 1), device)?
            .to_dtype(embeddings.dtype())?;
        let targets = Tensor::from_vec(targets, nnz, device)?;
        let weighted = embeddings.index_select(&codes, 0)?.broadcast_mul(&weights)?;
        total.index_add(&targets, &weighted, 0)
    }
}

fn spec(module: &str, weight: &str, shape: Vec<usize>, init: Init) -> ParameterSpec {
    ParameterSpec {
        path: ParamPath::new(module, weight),
        shape,
        init,
    }
}

fn push_linear(specs: &mut Vec<ParameterSpec>, module: &str, input: usize, output: usize) {
    specs.push(spec(module, "w", vec![input, output], Init::Normal));
    specs.push(spec(module, "b", vec![output], Init::Zeros));
}

fn push_code_weights(specs: &mut Vec<ParameterSpec>, module: &str, codes: usize, dim: usize) {
    specs.push(spec(module, "code_weight", vec![codes, dim], Init::Normal));
    specs.push(spec(module, "code_weight_bias", vec![codes], Init::Zeros));
}

/// Local causal mask: position `i` sees `j` when `i - width < j <= i` and `j` is a real token.
/// A position always sees itself so no row is fully masked.
fn attention_mask(batch: &Batch, width: usize, device: &Device) -> Result<Tensor> {
    let rows = batch.rows();
    let len = batch.transformer.length;
    let valid = &batch.transformer.valid_tokens;
    let mut mask = vec![MASKED_SCORE; rows * len * len];
    for row in 0..rows {
        for i in 0..len {
            let start = (i + 1).saturating_sub(width);
            for j in start..=i {
                if j == i || valid[row * len + j] {
                    mask[(row * len + i) * len + j] = 0.0;
                }
            }
        }
    }
    Tensor::from_vec(mask, (rows, 1, len, len), device)
}
