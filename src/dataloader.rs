//! Data loader

use std::collections::HashSet;

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::values::Value;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Labels must have the same length as the data ({label_len} labels, {data_len} inputs)")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<Value>>,
    // class index per input
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

/// One mini batch: borrowed inputs and their class labels
pub type Batch<'a> = (Vec<&'a [Value]>, Vec<usize>);

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        let data = data
            .iter()
            .map(|d| d.iter().map(|v| Value::new(*v)).collect())
            .collect();
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Dimension of every input, `None` when there is no data
    pub fn input_dim(&self) -> Option<usize> {
        self.data.first().map(Vec::len)
    }

    /// Iterates using the thread RNG for shuffling
    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }

    /// Iterates using `rng` for shuffling, so a seeded RNG gives a reproducible order
    pub fn iter_with(&self, rng: &mut impl Rng) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            data: &self.data,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset.
/// The last batch is short when the batch size does not divide the dataset.
pub struct DataLoaderIterator<'a> {
    data: &'a [Vec<Value>],
    labels: &'a [usize],
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<'a> Iterator for DataLoaderIterator<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch = &self.indices[self.curr_iter..end];
        let batch_data = batch
            .iter()
            .map(|&i| self.data[i].as_slice())
            .collect::<Vec<_>>();
        let batch_labels = batch.iter().map(|&i| self.labels[i]).collect::<Vec<_>>();
        self.curr_iter = end;
        Some((batch_data, batch_labels))
    }
}
