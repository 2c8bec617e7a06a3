//! Loss function(s)

use thiserror::Error;

use crate::values::Value;

/// Errors for loss functions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LossError {
    #[error("Target class {target} is out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
}

/// Negative log likelihood of the target class, expects log-probabilities as input
/// (e.g. the output of [`crate::nn::LogSoftmax`])
/// <https://pytorch.org/docs/stable/generated/torch.nn.NLLLoss.html>
pub struct NLLLoss;

impl NLLLoss {
    pub fn call<T>(log_probs: &[T], target: usize) -> Result<Value, LossError>
    where
        T: AsRef<Value>,
    {
        let log_prob = log_probs
            .get(target)
            .ok_or(LossError::TargetOutOfRange {
                target,
                n_classes: log_probs.len(),
            })?;
        Ok(-log_prob.as_ref())
    }

    /// Mean loss over a batch of predictions
    pub fn batch<T>(log_probs: &[Vec<T>], targets: &[usize]) -> Result<Value, LossError>
    where
        T: AsRef<Value>,
    {
        let losses = log_probs
            .iter()
            .zip(targets.iter())
            .map(|(p, &t)| Self::call(p, t))
            .collect::<Result<Vec<_>, _>>()?;
        let n = losses.len().max(1) as f32;
        Ok(losses.into_iter().sum::<Value>() / Value::new(n))
    }
}
