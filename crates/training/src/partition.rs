use std::collections::BTreeSet;

use candle_core::{DType, Tensor, Var};
use clmbr_model::{ParamPath, ParameterSet};

use crate::TrainingError;

/// Split of the model parameters into an f32 trainable set and a frozen set.
///
/// Frozen parameters are kept twice: cast to the compute dtype for the forward pass, and in
/// their original precision for checkpointing and for rejoining the trainable set.
pub struct ParameterPartition {
    trainable: Vec<(ParamPath, Var)>,
    frozen: ParameterSet,
    frozen_master: ParameterSet,
    compute_dtype: DType,
}

impl ParameterPartition {
    pub fn new(
        trainable: ParameterSet,
        frozen: ParameterSet,
        compute_dtype: DType,
    ) -> Result<Self, TrainingError> {
        if let Some(path) = frozen.paths().intersection(&trainable.paths()).next() {
            return Err(TrainingError::initialization(format!(
                "parameter {path} is both trainable and frozen"
            )));
        }
        let trainable = to_vars(trainable)?;
        let frozen_master = frozen;
        let frozen = frozen_master.cast(compute_dtype).map_err(to_runtime_error)?;
        Ok(Self {
            trainable,
            frozen,
            frozen_master,
            compute_dtype,
        })
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn has_frozen(&self) -> bool {
        !self.frozen.is_empty()
    }

    pub fn trainable_paths(&self) -> BTreeSet<ParamPath> {
        self.trainable.iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn frozen_paths(&self) -> BTreeSet<ParamPath> {
        self.frozen.paths()
    }

    pub fn trainable_element_count(&self) -> usize {
        self.trainable
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    pub fn trainable_vars(&self) -> Vec<(ParamPath, Var)> {
        self.trainable.clone()
    }

    /// Full parameter set in the compute dtype. Trainable entries stay attached to their
    /// variables so gradients flow back to the f32 masters.
    pub fn compute_params(&self) -> Result<ParameterSet, TrainingError> {
        let mut params = ParameterSet::new();
        for (path, var) in &self.trainable {
            let tensor = var
                .as_tensor()
                .to_dtype(self.compute_dtype)
                .map_err(to_runtime_error)?;
            params.insert(path.clone(), tensor);
        }
        for (path, tensor) in self.frozen.iter() {
            params.insert(path.clone(), tensor.clone());
        }
        Ok(params)
    }

    /// Trainable masters merged with the original-precision frozen parameters.
    pub fn master_params(&self) -> Result<ParameterSet, TrainingError> {
        let mut params: ParameterSet = self
            .trainable
            .iter()
            .map(|(path, var)| (path.clone(), var.as_tensor().clone()))
            .collect();
        params
            .merge(self.frozen_master.clone())
            .map_err(to_runtime_error)?;
        Ok(params)
    }

    /// Moves every frozen parameter into the trainable set. Returns how many moved.
    pub fn unfreeze(&mut self) -> Result<usize, TrainingError> {
        let released = std::mem::take(&mut self.frozen_master);
        self.frozen = ParameterSet::new();
        let count = released.len();
        self.trainable.extend(to_vars(released)?);
        self.trainable.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(count)
    }

    /// Overwrites one trainable or frozen weight, keeping its shape and storage precision.
    pub fn replace(&mut self, path: &ParamPath, value: &Tensor) -> Result<(), TrainingError> {
        if let Some((_, var)) = self.trainable.iter().find(|(candidate, _)| candidate == path) {
            let current = var.as_tensor();
            let value = conform(path, value, current)?;
            return var.set(&value).map_err(to_runtime_error);
        }
        let Some(current) = self.frozen_master.get(path) else {
            return Err(TrainingError::initialization(format!(
                "no parameter {path} to replace"
            )));
        };
        let value = conform(path, value, current)?;
        let cast = value
            .to_dtype(self.compute_dtype)
            .map_err(to_runtime_error)?;
        self.frozen_master.insert(path.clone(), value);
        self.frozen.insert(path.clone(), cast);
        Ok(())
    }
}

fn conform(path: &ParamPath, value: &Tensor, current: &Tensor) -> Result<Tensor, TrainingError> {
    if value.elem_count() != current.elem_count() {
        return Err(TrainingError::initialization(format!(
            "replacement for {path} has {} elements, slot has shape {:?}",
            value.elem_count(),
            current.dims()
        )));
    }
    value
        .reshape(current.dims())
        .and_then(|value| value.to_dtype(current.dtype()))
        .and_then(|value| value.to_device(current.device()))
        .map_err(to_runtime_error)
}

fn to_vars(params: ParameterSet) -> Result<Vec<(ParamPath, Var)>, TrainingError> {
    params
        .into_iter()
        .map(|(path, tensor)| {
            let master = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let var = Var::from_tensor(&master).map_err(to_runtime_error)?;
            Ok((path, var))
        })
        .collect()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
