//! Training and validation loops for a [`Network`]

use std::cmp::Ordering;

use rand::Rng;
use thiserror::Error;

use crate::{
    dataloader::DataLoader,
    loss::{LossError, NLLLoss},
    nn::{Module, NNError, Network},
    optim::Optim,
    values::Value,
};

/// Errors raised while training or evaluating
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Network(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
}

/// Mean loss and accuracy over a dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub accuracy: f32,
}

/// Losses recorded by [`fit`], one entry per epoch
#[derive(Debug, Clone, Default)]
pub struct History {
    pub train_loss: Vec<f32>,
    /// Only filled on the epochs where validation ran
    pub validation: Vec<(usize, Evaluation)>,
}

/// Index of the largest log-probability
pub fn predict(log_probs: &[Value]) -> Option<usize> {
    log_probs
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.data().partial_cmp(&b.data()).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
}

/// Runs one pass over `loader`, stepping `optim` after every mini batch, and returns the
/// mean per-sample loss
pub fn train_epoch(
    model: &Network,
    optim: &mut dyn Optim,
    loader: &DataLoader,
    rng: &mut impl Rng,
) -> Result<f32, TrainError> {
    model.train();
    let mut total_loss = 0.0;
    let mut n_samples = 0usize;
    for (batch_data, batch_labels) in loader.iter_with(rng) {
        let batch_size = batch_data.len() as f32;
        for (inputs, &label) in batch_data.into_iter().zip(batch_labels.iter()) {
            // note that after log_probs is freed, all the intermediate children (that are not
            // model parameters) are also freed because their reference count drops to 0
            let log_probs = model.forward(inputs)?;
            let loss = NLLLoss::call(&log_probs, label)?;
            total_loss += loss.data();
            // scale so a step follows the batch mean rather than the sum
            (&loss / &Value::new(batch_size)).backward();
            n_samples += 1;
        }
        // take steps in minibatches
        optim.step();
        optim.zero_grad();
        log::debug!("dead neurons in last batch: {}", model.n_dead_neurons());
    }
    Ok(total_loss / n_samples.max(1) as f32)
}

/// Mean loss and accuracy on `loader` with dropout disabled. The model's previous mode is
/// restored afterwards.
pub fn validation(model: &Network, loader: &DataLoader) -> Result<Evaluation, TrainError> {
    let was_training = model.is_training();
    model.eval();
    let result = evaluate(model, loader);
    if was_training {
        model.train();
    }
    result
}

fn evaluate(model: &Network, loader: &DataLoader) -> Result<Evaluation, TrainError> {
    let mut total_loss = 0.0;
    let mut n_correct = 0;
    let mut n_samples = 0usize;
    for (batch_data, batch_labels) in loader.iter() {
        for (inputs, &label) in batch_data.into_iter().zip(batch_labels.iter()) {
            let log_probs = model.forward(inputs)?;
            total_loss += NLLLoss::call(&log_probs, label)?.data();
            if predict(&log_probs) == Some(label) {
                n_correct += 1;
            }
            n_samples += 1;
        }
    }
    let n = n_samples.max(1) as f32;
    Ok(Evaluation {
        loss: total_loss / n,
        accuracy: n_correct as f32 / n,
    })
}

/// Trains for `epochs`, running validation every `print_every` epochs and on the last one
pub fn fit(
    model: &Network,
    optim: &mut dyn Optim,
    train_loader: &DataLoader,
    valid_loader: &DataLoader,
    epochs: usize,
    print_every: usize,
    rng: &mut impl Rng,
) -> Result<History, TrainError> {
    let mut history = History::default();
    let print_every = print_every.max(1);
    for epoch in 0..epochs {
        let train_loss = train_epoch(model, optim, train_loader, rng)?;
        history.train_loss.push(train_loss);
        if epoch % print_every == 0 || epoch + 1 == epochs {
            let eval = validation(model, valid_loader)?;
            log::info!(
                "epoch: {}/{}, training loss: {:.4}, validation loss: {:.4}, validation accuracy: {:.3}",
                epoch + 1,
                epochs,
                train_loss,
                eval.loss,
                eval.accuracy
            );
            history.validation.push((epoch, eval));
        }
    }
    Ok(history)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{
        datasets::{Dataset, N_CLASSES, N_FEATURES, load_dataset},
        optim::{Adam, SGD},
    };

    fn loaders(seed: u64) -> (DataLoader, DataLoader) {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let (data, labels) = load_dataset(Dataset::Line, 60, &mut rng);
        let train = DataLoader::new(data, labels, 10, true).unwrap();
        let (data, labels) = load_dataset(Dataset::Line, 30, &mut rng);
        let valid = DataLoader::new(data, labels, 10, false).unwrap();
        (train, valid)
    }

    #[test]
    fn test_predict() {
        let log_probs = vec![Value::new(-2.0), Value::new(-0.1), Value::new(-3.0)];
        assert_eq!(predict(&log_probs), Some(1));
        assert_eq!(predict(&[]), None);
    }

    #[test]
    fn test_training_reduces_loss() {
        let (train, valid) = loaders(0);
        let model = Network::with_seed(N_FEATURES, N_CLASSES, &[8], 0.0, 0).unwrap();
        let mut optim = Adam::new(model.parameters(), 0.02);
        let mut rng = Pcg64Mcg::seed_from_u64(1);

        let before = validation(&model, &valid).unwrap();
        let history = fit(&model, &mut optim, &train, &valid, 30, 5, &mut rng).unwrap();
        let after = validation(&model, &valid).unwrap();

        assert_eq!(history.train_loss.len(), 30);
        let epochs = history.validation.iter().map(|(e, _)| *e).collect::<Vec<_>>();
        assert_eq!(epochs, vec![0, 5, 10, 15, 20, 25, 29]);
        assert!(after.loss < before.loss, "{before:?} -> {after:?}");
        assert!(after.accuracy >= 0.8, "{after:?}");
    }

    #[test]
    fn test_sgd_epoch_changes_parameters() {
        let (train, _) = loaders(2);
        let model = Network::with_seed(N_FEATURES, N_CLASSES, &[4], 0.5, 3).unwrap();
        let before = model.state_dict();
        let mut optim = SGD::new(model.parameters(), 0.05, 0.9);
        let loss = train_epoch(&model, &mut optim, &train, &mut Pcg64Mcg::seed_from_u64(4))
            .unwrap();
        assert!(loss.is_finite());
        assert_ne!(model.state_dict(), before);
    }

    #[test]
    fn test_validation_restores_mode() {
        let (_, valid) = loaders(5);
        let model = Network::with_seed(N_FEATURES, N_CLASSES, &[4], 0.5, 6).unwrap();
        assert!(model.is_training());
        let eval = validation(&model, &valid).unwrap();
        assert!(model.is_training());
        assert!((0.0..=1.0).contains(&eval.accuracy));

        // dropout is off during validation, so repeated runs agree
        assert_eq!(validation(&model, &valid).unwrap(), eval);
    }
}
