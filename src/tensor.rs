//! Plain parameter arrays used to move values in and out of a model

use std::{collections::BTreeMap, fmt};

use thiserror::Error;

/// Errors for tensor construction
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements but {got} values were given")]
    DataLengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
}

/// A dense row-major array of `f32` with a fixed shape. Not part of the autograd graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Parameter identifier to value, ordered by identifier
pub type StateDict = BTreeMap<String, Tensor>;

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = numel(&shape);
        if data.len() != expected {
            return Err(TensorError::DataLengthMismatch {
                shape,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let data = vec![0.0; numel(&shape)];
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Exact equality on the raw bits, so NaN payloads and signed zeros count
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={:?})", self.shape)
    }
}

/// Number of elements held by `shape`; a scalar (empty shape) holds one
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
