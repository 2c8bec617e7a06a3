//! A small library for training fully connected classifiers with a PyTorch-like API and
//! saving them to, and restoring them from, shape checked checkpoints.

pub mod backprop_fns;
pub mod checkpoint;
pub mod dataloader;
pub mod datasets;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
pub mod values;
