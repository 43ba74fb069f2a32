use anyhow::Result;
use candle_core::{DType, Device, Var};
use clmbr_model::{
    heads, Batch, EhrTransformer, LabelerKind, ParamPath, ParameterSet, Phase, RotaryMode,
    TaskDescriptor, TaskLabels, TaskOutput, TransformerBatch, TransformerConfig,
};
use rand::{rngs::StdRng, SeedableRng};

fn build_config(rotary: RotaryMode, is_hierarchical: bool) -> TransformerConfig {
    TransformerConfig {
        vocab_size: 12,
        hidden_size: 8,
        intermediate_size: 16,
        n_heads: 2,
        n_layers: 2,
        attention_width: 3,
        rotary,
        is_hierarchical,
        internal_dropout: 0.0,
    }
}

fn toy_batch(tokens: Vec<u32>) -> Batch {
    Batch {
        num_indices: 2,
        patient_ids: vec![11, 12],
        offsets: vec![0, 4],
        transformer: TransformerBatch {
            length: 4,
            tokens,
            ages: vec![0.0, 1.0, 5.0, 9.0, 0.0, 2.0, 2.0, 0.0],
            integer_ages: vec![0, 1440, 7200, 12960, 0, 2880, 2880, 0],
            valid_tokens: vec![true, true, true, true, true, true, true, false],
            label_indices: vec![1, 6, 0],
            hierarchical_tokens: vec![],
            hierarchical_weights: vec![],
            token_offsets: vec![],
        },
        task: TaskLabels::Clmbr {
            labels: vec![3, 4, 0],
        },
    }
}

#[test]
fn init_is_deterministic_and_covers_the_head() -> Result<()> {
    let model = EhrTransformer::new(
        build_config(RotaryMode::PerHead, false),
        TaskDescriptor::Clmbr { vocab_size: 12 },
    )?;
    let first = model.init(7, &Device::Cpu)?;
    let second = model.init(7, &Device::Cpu)?;

    assert_eq!(first.len(), model.parameter_specs().len());
    assert!(first.has_module(heads::CLMBR_HEAD));
    for (path, tensor) in first.iter() {
        let other = second.get(path).expect("same paths");
        assert_eq!(
            tensor.flatten_all()?.to_vec1::<f32>()?,
            other.flatten_all()?.to_vec1::<f32>()?,
            "{path} differs between identical seeds"
        );
    }
    Ok(())
}

#[test]
fn forward_produces_slot_logits() -> Result<()> {
    let model = EhrTransformer::new(
        build_config(RotaryMode::Global, false),
        TaskDescriptor::Clmbr { vocab_size: 12 },
    )?;
    let params = model.init(1, &Device::Cpu)?;
    let batch = toy_batch(vec![1, 2, 3, 4, 5, 6, 7, 0]);

    let TaskOutput::Clmbr { logits } = model.forward(&params, &batch, &mut Phase::Eval)? else {
        panic!("clmbr task must produce clmbr logits");
    };
    assert_eq!(logits.dims(), &[3, 12]);
    Ok(())
}

#[test]
fn representations_ignore_future_tokens() -> Result<()> {
    let model = EhrTransformer::new(
        build_config(RotaryMode::PerHead, false),
        TaskDescriptor::Clmbr { vocab_size: 12 },
    )?;
    let params = model.init(3, &Device::Cpu)?;

    let base = model.represent(&params, &toy_batch(vec![1, 2, 3, 4, 5, 6, 7, 0]), &mut Phase::Eval)?;
    // Slot 0 reads token 1 of row 0; tokens 2 and 3 of that row lie in its future.
    let changed =
        model.represent(&params, &toy_batch(vec![1, 2, 9, 10, 5, 6, 7, 0]), &mut Phase::Eval)?;

    let before = base.features.get(0)?.to_vec1::<f32>()?;
    let after = changed.features.get(0)?.to_vec1::<f32>()?;
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    assert_eq!(base.mask, vec![true, true, false]);
    Ok(())
}

#[test]
fn hierarchical_embedding_bag_runs() -> Result<()> {
    let model = EhrTransformer::new(
        build_config(RotaryMode::None, true),
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        },
    )?;
    let params = model.init(5, &Device::Cpu)?;
    let mut batch = toy_batch(vec![0; 8]);
    batch.transformer.hierarchical_tokens = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
    batch.transformer.hierarchical_weights = vec![1.0, 0.5, 1.0, 1.0, 1.0, 0.25, 1.0, 1.0, 1.0];
    batch.transformer.token_offsets = vec![0, 2, 3, 4, 5, 7, 8, 9, 9];
    batch.task = TaskLabels::Boolean {
        labels: vec![true, false, false],
        label_ages: vec![1440, 2880, 0],
    };

    let TaskOutput::Boolean { logits } = model.forward(&params, &batch, &mut Phase::Eval)? else {
        panic!("boolean labeler must produce boolean logits");
    };
    assert_eq!(logits.dims(), &[3]);
    Ok(())
}

#[test]
fn survival_heads_have_bin_shapes() -> Result<()> {
    let time_bins = vec![0.0, 7.0, 30.0];
    let model = EhrTransformer::new(
        build_config(RotaryMode::PerHead, false),
        TaskDescriptor::SurvivalClmbr {
            time_bins: time_bins.clone(),
            num_codes: 5,
            dim: 4,
        },
    )?;
    let params = model.init(9, &Device::Cpu)?;
    let batch = toy_batch(vec![1, 2, 3, 4, 5, 6, 7, 0]);
    let TaskOutput::SurvivalClmbr { log_hazards } =
        model.forward(&params, &batch, &mut Phase::Eval)?
    else {
        panic!("expected survival clmbr output");
    };
    assert_eq!(log_hazards.dims(), &[3, 3, 5]);

    let labeled = EhrTransformer::new(
        build_config(RotaryMode::PerHead, false),
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Survival { time_bins, dim: 4 },
        },
    )?;
    let params = labeled.init(9, &Device::Cpu)?;
    let TaskOutput::Survival { log_hazards } = labeled.forward(&params, &batch, &mut Phase::Eval)?
    else {
        panic!("expected survival output");
    };
    assert_eq!(log_hazards.dims(), &[3, 3]);
    Ok(())
}

#[test]
fn gradients_reach_attention_projection() -> Result<()> {
    let mut config = build_config(RotaryMode::PerHead, false);
    config.internal_dropout = 0.1;
    let model = EhrTransformer::new(config, TaskDescriptor::Clmbr { vocab_size: 12 })?;
    let initial = model.init(2, &Device::Cpu)?;

    let mut vars = Vec::new();
    let mut params = ParameterSet::new();
    for (path, tensor) in initial.iter() {
        let var = Var::from_tensor(tensor)?;
        params.insert(path.clone(), var.as_tensor().clone());
        vars.push((path.clone(), var));
    }

    let mut rng = StdRng::seed_from_u64(0);
    let output = model.forward(
        &params,
        &toy_batch(vec![1, 2, 3, 4, 5, 6, 7, 0]),
        &mut Phase::Train(&mut rng),
    )?;
    let TaskOutput::Clmbr { logits } = output else {
        panic!("expected clmbr output");
    };
    let grads = logits.sqr()?.sum_all()?.backward()?;

    let qkv = ParamPath::new("transformer/layer_0/qkv", "w");
    let (_, var) = vars.iter().find(|(path, _)| *path == qkv).expect("qkv exists");
    assert!(grads.get(var.as_tensor()).is_some());
    Ok(())
}

#[test]
fn reduced_precision_forward_matches_shape() -> Result<()> {
    let model = EhrTransformer::new(
        build_config(RotaryMode::PerHead, false),
        TaskDescriptor::Clmbr { vocab_size: 12 },
    )?;
    let params = model.init(4, &Device::Cpu)?.cast(DType::F16)?;
    let output = model.forward(&params, &toy_batch(vec![1, 2, 3, 4, 5, 6, 7, 0]), &mut Phase::Eval)?;
    let TaskOutput::Clmbr { logits } = output else {
        panic!("expected clmbr output");
    };
    assert_eq!(logits.dtype(), DType::F16);
    let values = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}
