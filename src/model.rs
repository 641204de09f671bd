//! Model representation.
//!
//! A [`ParameterSet`] is the complete trainable state of a model: an ordered sequence of named
//! tensors. Every parameter set exchanged during one run has the same tensor names and shapes,
//! which is checked with [`ParameterSet::check_compatible()`] wherever sets meet.

use std::{collections::HashSet, slice::Iter};

use ndarray::{ArrayD, IxDyn, ShapeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A named tensor of model parameters.
pub struct Tensor {
    name: String,
    data: ArrayD<f64>,
}

impl Tensor {
    /// Creates a tensor from an existing array.
    pub fn new(name: impl Into<String>, data: ArrayD<f64>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Creates a tensor of the given shape from its values in row-major order.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn from_shape_vec(
        name: impl Into<String>,
        shape: &[usize],
        values: Vec<f64>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        match ArrayD::from_shape_vec(IxDyn(shape), values) {
            Ok(data) => Ok(Self { name, data }),
            Err(source) => Err(ModelError::InvalidShape { name, source }),
        }
    }

    /// Creates a tensor of the given shape filled with zeros.
    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Self {
        Self::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<f64> {
        self.data
    }
}

#[derive(Debug, Error)]
/// Errors related to building a [`ParameterSet`].
pub enum ModelError {
    #[error("tensor `{0}` appears more than once")]
    DuplicateTensor(String),
    #[error("tensor `{name}`: {source}")]
    InvalidShape { name: String, source: ShapeError },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Two parameter sets don't describe the same model.
pub enum ShapeMismatch {
    #[error("expected {expected} tensors, found {found}")]
    TensorCount { expected: usize, found: usize },
    #[error("tensor #{index}: expected `{expected}`, found `{found}`")]
    TensorName {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("tensor `{name}`: expected shape {expected:?}, found {found:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The trainable state of a model, as an ordered sequence of named tensors.
pub struct ParameterSet(Vec<Tensor>);

#[allow(clippy::len_without_is_empty)]
impl ParameterSet {
    /// Creates a parameter set.
    ///
    /// # Errors
    /// Fails if two tensors share a name.
    pub fn new(tensors: Vec<Tensor>) -> Result<Self, ModelError> {
        {
            let mut names = HashSet::with_capacity(tensors.len());
            for tensor in tensors.iter() {
                if !names.insert(tensor.name()) {
                    return Err(ModelError::DuplicateTensor(tensor.name().to_string()));
                }
            }
        }
        Ok(Self(tensors))
    }

    /// Creates a parameter set with the same names and shapes as this one, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|tensor| Tensor::zeros(tensor.name(), tensor.shape()))
                .collect(),
        )
    }

    /// Gets the number of tensors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Gets the total number of scalar parameters over all tensors.
    pub fn num_parameters(&self) -> usize {
        self.0.iter().map(|tensor| tensor.data().len()).sum()
    }

    /// Creates an iterator over the tensors, in order.
    pub fn iter(&self) -> Iter<Tensor> {
        self.0.iter()
    }

    /// Gets the tensor with the given name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.iter().find(|tensor| tensor.name() == name)
    }

    /// Checks that `other` has the same tensor names and shapes, in the same order.
    pub fn check_compatible(&self, other: &ParameterSet) -> Result<(), ShapeMismatch> {
        if self.len() != other.len() {
            return Err(ShapeMismatch::TensorCount {
                expected: self.len(),
                found: other.len(),
            });
        }
        for (index, (ours, theirs)) in self.iter().zip(other.iter()).enumerate() {
            if ours.name() != theirs.name() {
                return Err(ShapeMismatch::TensorName {
                    index,
                    expected: ours.name().to_string(),
                    found: theirs.name().to_string(),
                });
            }
            if ours.shape() != theirs.shape() {
                return Err(ShapeMismatch::TensorShape {
                    name: ours.name().to_string(),
                    expected: ours.shape().to_vec(),
                    found: theirs.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Adds `weight * other` to this parameter set, tensor-wise.
    ///
    /// Nothing is modified if the sets are not compatible.
    pub fn scaled_add(&mut self, weight: f64, other: &ParameterSet) -> Result<(), ShapeMismatch> {
        self.check_compatible(other)?;
        for (ours, theirs) in self.0.iter_mut().zip(other.iter()) {
            ours.data_mut().scaled_add(weight, theirs.data());
        }
        Ok(())
    }

    /// Gets the name of the first tensor that holds a NaN or infinite value, if any.
    pub fn first_non_finite(&self) -> Option<&str> {
        self.iter()
            .find(|tensor| tensor.data().iter().any(|value| !value.is_finite()))
            .map(Tensor::name)
    }
}

impl IntoIterator for ParameterSet {
    type Item = Tensor;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a Tensor;
    type IntoIter = Iter<'a, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
