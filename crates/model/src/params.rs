use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::Path,
};

use candle_core::{DType, Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Structured identifier of a single weight: the owning module path plus the weight name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamPath {
    pub module: String,
    pub weight: String,
}

impl ParamPath {
    pub fn new(module: impl Into<String>, weight: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            weight: weight.into(),
        }
    }

    /// Parses the `module:weight` form used as safetensors keys.
    pub fn parse(key: &str) -> Result<Self> {
        match key.rsplit_once(':') {
            Some((module, weight)) if !module.is_empty() && !weight.is_empty() => {
                Ok(Self::new(module, weight))
            }
            _ => Err(Error::Msg(format!(
                "parameter key '{key}' is not of the form module:weight"
            ))),
        }
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.weight)
    }
}

/// Flat, ordered mapping from [`ParamPath`] to tensor.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    tensors: BTreeMap<ParamPath, Tensor>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: ParamPath, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(path, tensor)
    }

    pub fn get(&self, path: &ParamPath) -> Option<&Tensor> {
        self.tensors.get(path)
    }

    pub fn remove(&mut self, path: &ParamPath) -> Option<Tensor> {
        self.tensors.remove(path)
    }

    pub fn contains(&self, path: &ParamPath) -> bool {
        self.tensors.contains_key(path)
    }

    /// Looks up `module:weight`, failing with the missing key in the message.
    pub fn require(&self, module: &str, weight: &str) -> Result<&Tensor> {
        self.tensors
            .get(&ParamPath::new(module, weight))
            .ok_or_else(|| Error::Msg(format!("missing parameter {module}:{weight}")))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamPath, &Tensor)> {
        self.tensors.iter()
    }

    pub fn paths(&self) -> BTreeSet<ParamPath> {
        self.tensors.keys().cloned().collect()
    }

    pub fn modules(&self) -> BTreeSet<String> {
        self.tensors.keys().map(|path| path.module.clone()).collect()
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.tensors.keys().any(|path| path.module == module)
    }

    /// Weights registered under `module`, in weight-name order.
    pub fn module(&self, module: &str) -> Vec<(&ParamPath, &Tensor)> {
        self.tensors
            .iter()
            .filter(|(path, _)| path.module == module)
            .collect()
    }

    /// Removes every weight of `module` and returns them as their own set.
    pub fn take_module(&mut self, module: &str) -> ParameterSet {
        let paths: Vec<ParamPath> = self
            .tensors
            .keys()
            .filter(|path| path.module == module)
            .cloned()
            .collect();
        let mut taken = ParameterSet::new();
        for path in paths {
            if let Some(tensor) = self.tensors.remove(&path) {
                taken.insert(path, tensor);
            }
        }
        taken
    }

    /// Moves all entries of `other` into `self`. Overlapping paths are rejected.
    pub fn merge(&mut self, other: ParameterSet) -> Result<()> {
        if let Some(path) = other.tensors.keys().find(|path| self.contains(path)) {
            return Err(Error::Msg(format!(
                "parameter {path} present in both sets being merged"
            )));
        }
        self.tensors.extend(other.tensors);
        Ok(())
    }

    pub fn cast(&self, dtype: DType) -> Result<ParameterSet> {
        let mut tensors = BTreeMap::new();
        for (path, tensor) in &self.tensors {
            tensors.insert(path.clone(), tensor.to_dtype(dtype)?);
        }
        Ok(ParameterSet { tensors })
    }

    pub fn element_count(&self) -> usize {
        self.tensors.values().map(|tensor| tensor.elem_count()).sum()
    }

    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.tensors.is_empty() {
            return Err(Error::Msg("refusing to save an empty parameter set".into()));
        }
        let named: HashMap<String, Tensor> = self
            .tensors
            .iter()
            .map(|(path, tensor)| (path.to_string(), tensor.clone()))
            .collect();
        candle_core::safetensors::save(&named, path)
    }

    pub fn load_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let loaded = candle_core::safetensors::load(path, device)?;
        let mut tensors = BTreeMap::new();
        for (key, tensor) in loaded {
            tensors.insert(ParamPath::parse(&key)?, tensor);
        }
        Ok(Self { tensors })
    }
}

impl FromIterator<(ParamPath, Tensor)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (ParamPath, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ParameterSet {
    type Item = (ParamPath, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<ParamPath, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}
