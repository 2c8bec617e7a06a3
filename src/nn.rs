//! Components to build a neural network

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    sync::atomic::{self, AtomicUsize},
};

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{
    checkpoint::{CheckpointError, check_state},
    tensor::{StateDict, Tensor},
    values::Value,
};

/// Errors for the neural network
#[derive(Debug, Error, PartialEq)]
pub enum NNError {
    #[error("Input size mismatch: expected {expected}, got {got}")]
    InputSizeMismatch { expected: usize, got: usize },
    #[error("{what} must be positive")]
    InvalidWidth { what: String },
    #[error("Dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f32),
}

/// Represents the torch.nn.Module. NNs should implement this trait.
/// <https://github.com/pytorch/pytorch/blob/v2.6.0/torch/nn/modules/module.py#L402>
pub trait Module {
    fn zero_grad(&mut self) {
        for p in self.parameters().iter_mut() {
            p.zero_grad();
        }
    }

    fn parameters(&self) -> Vec<Value>;
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError>;

    /// Snapshot of every learnable tensor keyed by parameter identifier
    fn state_dict(&self) -> StateDict;

    /// Copies `state` into the module's parameters. Either every slot is written or,
    /// on error, none is.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), CheckpointError>;
}

/// A single neuron in a layer of a NN, i.e. one row of the layer's weight matrix
#[derive(Debug)]
pub struct Neuron {
    /// weights of the neuron
    pub weights: Vec<Value>,
    /// bias of the neuron
    pub bias: Value,
}

impl Neuron {
    fn new(n_inputs: usize, normal: &Normal<f32>, rng: &mut impl Rng) -> Self {
        let weights = (0..n_inputs)
            .map(|_| Value::new(normal.sample(rng)))
            .collect();
        Self {
            weights,
            bias: Value::new(normal.sample(rng)),
        }
    }

    // Testing utility for a deterministic and simple neuron
    #[cfg(test)]
    fn new_ones(n_inputs: usize) -> Self {
        Self {
            weights: (0..n_inputs).map(|_| Value::new(1.0)).collect(),
            bias: Value::new(1.0),
        }
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.weights
            .iter()
            .chain(std::iter::once(&self.bias))
            .cloned()
            .collect()
    }

    pub fn forward(&self, inputs: &[Value]) -> Result<Value, NNError> {
        if inputs.len() != self.weights.len() {
            return Err(NNError::InputSizeMismatch {
                expected: self.weights.len(),
                got: inputs.len(),
            });
        }
        let output = self
            .weights
            .iter()
            .zip(inputs.iter())
            .map(|(w, i)| w * i)
            .sum::<Value>();
        Ok(&output + &self.bias)
    }
}

/// A fully connected layer, `y = W x + b` with `W` of shape `(n_outputs, n_inputs)`
#[derive(Debug)]
pub struct Linear {
    neurons: Vec<Neuron>,
    n_inputs: usize,
    n_output_nans: AtomicUsize,
}

impl Linear {
    /// Creates a new layer with the given number of inputs and outputs
    pub fn new(n_inputs: usize, n_outputs: usize, rng: &mut impl Rng) -> Result<Self, NNError> {
        let invalid = || NNError::InvalidWidth {
            what: "n_inputs".to_string(),
        };
        if n_inputs == 0 {
            return Err(invalid());
        }
        // He initialization to ensure the variance of the output is the same as the input
        // and keep weights relatively small to avoid exploding or vanishing gradients
        let std = (2.0 / n_inputs as f32).sqrt();
        let normal = Normal::new(0.0, std).map_err(|_| invalid())?;
        let neurons = (0..n_outputs)
            .map(|_| Neuron::new(n_inputs, &normal, rng))
            .collect();
        Ok(Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        })
    }

    #[cfg(test)]
    fn new_ones(n_inputs: usize, n_outputs: usize) -> Self {
        let neurons = (0..n_outputs).map(|_| Neuron::new_ones(n_inputs)).collect();
        Self {
            neurons,
            n_inputs,
            n_output_nans: AtomicUsize::new(0),
        }
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.neurons.len()
    }

    /// Returns all the parameters in the layer
    pub fn parameters(&self) -> Vec<Value> {
        self.neurons.iter().flat_map(|n| n.parameters()).collect()
    }

    /// Weight matrix as a `(n_outputs, n_inputs)` tensor
    pub fn weight(&self) -> Tensor {
        let data = self
            .neurons
            .iter()
            .flat_map(|n| n.weights.iter().map(Value::data))
            .collect();
        Tensor::new(self.weight_shape(), data).expect("neuron rows all have n_inputs weights")
    }

    /// Bias vector as a `(n_outputs,)` tensor
    pub fn bias(&self) -> Tensor {
        let data = self.neurons.iter().map(|n| n.bias.data()).collect();
        Tensor::new(self.bias_shape(), data).expect("one bias per neuron")
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        vec![self.n_outputs(), self.n_inputs]
    }

    pub fn bias_shape(&self) -> Vec<usize> {
        vec![self.n_outputs()]
    }

    /// Overwrites the weights; the caller has checked `weight` against [`Self::weight_shape`]
    fn assign_weight(&mut self, weight: &Tensor) {
        debug_assert_eq!(weight.shape(), self.weight_shape().as_slice());
        let rows = weight.data().chunks_exact(self.n_inputs.max(1));
        for (neuron, row) in self.neurons.iter_mut().zip(rows) {
            for (w, &v) in neuron.weights.iter_mut().zip(row) {
                w.set_data(v);
            }
        }
    }

    /// Overwrites the biases; the caller has checked `bias` against [`Self::bias_shape`]
    fn assign_bias(&mut self, bias: &Tensor) {
        debug_assert_eq!(bias.shape(), self.bias_shape().as_slice());
        for (neuron, &v) in self.neurons.iter_mut().zip(bias.data()) {
            neuron.bias.set_data(v);
        }
    }

    /// Computes forward pass for a layer
    pub fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let outputs = self
            .neurons
            .iter()
            .map(|n| n.forward(inputs))
            .collect::<Result<Vec<_>, _>>()?;
        let n_output_nans = outputs.iter().filter(|v| v.data().is_nan()).count();
        self.n_output_nans
            .store(n_output_nans, atomic::Ordering::Relaxed);
        log::debug!(
            "linear {}x{}: n_output_nans: {}",
            self.n_outputs(),
            self.n_inputs,
            n_output_nans
        );
        Ok(outputs)
    }
}

/// Applies ReLU to a set of values, works for arbitrary number of inputs
#[derive(Debug, Default)]
pub struct ReLU {
    n_dead_neurons: AtomicUsize,
}

impl ReLU {
    pub fn new() -> Self {
        Self {
            n_dead_neurons: AtomicUsize::new(0),
        }
    }

    /// Takes the element-wise ReLU of the input values
    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        let n_dead_neurons = inputs.iter().filter(|v| v.data() <= 0.0).count();
        self.n_dead_neurons
            .store(n_dead_neurons, atomic::Ordering::Relaxed);
        inputs.iter().map(|v| v.relu()).collect()
    }

    /// Returns the number of dead neurons in the last call (used for debugging)
    pub fn n_dead_neurons(&self) -> usize {
        self.n_dead_neurons.load(atomic::Ordering::Relaxed)
    }
}

/// Inverted dropout: zeroes each input with probability `p` and scales the survivors
/// by `1 / (1 - p)`, so nothing needs rescaling at evaluation time
#[derive(Debug)]
pub struct Dropout {
    p: f32,
    rng: RefCell<Pcg64Mcg>,
}

impl Dropout {
    pub fn new(p: f32, seed: u64) -> Result<Self, NNError> {
        if !(0.0..1.0).contains(&p) {
            return Err(NNError::InvalidDropout(p));
        }
        Ok(Self {
            p,
            rng: RefCell::new(Pcg64Mcg::seed_from_u64(seed)),
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward(&self, inputs: &[Value], training: bool) -> Vec<Value> {
        if !training || self.p == 0.0 {
            return inputs.to_vec();
        }
        let mut rng = self.rng.borrow_mut();
        let keep = Value::new(1.0 / (1.0 - self.p));
        let drop = Value::new(0.0);
        inputs
            .iter()
            .map(|v| {
                if rng.random::<f32>() < self.p {
                    v * &drop
                } else {
                    v * &keep
                }
            })
            .collect()
    }
}

/// Log of the softmax, `x_i - ln(sum_j exp(x_j))`
#[derive(Debug, Default)]
pub struct LogSoftmax {}

impl LogSoftmax {
    pub fn new() -> Self {
        Self {}
    }

    pub fn forward(&self, inputs: &[Value]) -> Vec<Value> {
        // Shifting by the max keeps exp() from overflowing; the result is shift invariant so
        // the shift can be a constant outside the graph
        let max = inputs
            .iter()
            .map(Value::data)
            .fold(f32::NEG_INFINITY, f32::max);
        let max = Value::new(if max.is_finite() { max } else { 0.0 });
        let shifted = inputs.iter().map(|v| v - &max).collect::<Vec<_>>();
        let log_sum_exp = shifted.iter().map(|v| v.exp()).sum::<Value>().ln();
        shifted.iter().map(|v| v - &log_sum_exp).collect()
    }
}

/// A fully connected classifier with an arbitrary list of hidden layers.
///
/// Each hidden layer is `Linear -> ReLU -> Dropout`, followed by an output `Linear` and
/// `LogSoftmax`, so the forward pass yields log-probabilities per class.
#[derive(Debug)]
pub struct Network {
    input_size: usize,
    output_size: usize,
    hidden_sizes: Vec<usize>,
    hidden_layers: Vec<Linear>,
    output: Linear,
    relu: ReLU,
    dropout: Dropout,
    log_softmax: LogSoftmax,
    training: Cell<bool>,
}

impl Network {
    /// Builds a freshly initialized network seeded from the thread RNG
    pub fn new(
        input_size: usize,
        output_size: usize,
        hidden_layers: &[usize],
        drop_p: f32,
    ) -> Result<Self, NNError> {
        Self::with_seed(input_size, output_size, hidden_layers, drop_p, rand::random())
    }

    /// Builds a network whose initial weights and dropout masks are determined by `seed`
    pub fn with_seed(
        input_size: usize,
        output_size: usize,
        hidden_layers: &[usize],
        drop_p: f32,
        seed: u64,
    ) -> Result<Self, NNError> {
        if input_size == 0 {
            return Err(NNError::InvalidWidth {
                what: "input_size".to_string(),
            });
        }
        if output_size == 0 {
            return Err(NNError::InvalidWidth {
                what: "output_size".to_string(),
            });
        }
        if let Some(i) = hidden_layers.iter().position(|&w| w == 0) {
            return Err(NNError::InvalidWidth {
                what: format!("hidden_layers[{i}]"),
            });
        }
        let dropout = Dropout::new(drop_p, seed.wrapping_add(1))?;

        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let mut prev = input_size;
        let mut layers = Vec::with_capacity(hidden_layers.len());
        for &width in hidden_layers {
            layers.push(Linear::new(prev, width, &mut rng)?);
            prev = width;
        }
        let output = Linear::new(prev, output_size, &mut rng)?;
        log::debug!(
            "built network {} -> {:?} -> {} (drop_p={})",
            input_size,
            hidden_layers,
            output_size,
            drop_p
        );

        Ok(Self {
            input_size,
            output_size,
            hidden_sizes: hidden_layers.to_vec(),
            hidden_layers: layers,
            output,
            relu: ReLU::new(),
            dropout,
            log_softmax: LogSoftmax::new(),
            training: Cell::new(true),
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Output width of each hidden layer
    pub fn hidden_layers(&self) -> &[usize] {
        &self.hidden_sizes
    }

    pub fn drop_p(&self) -> f32 {
        self.dropout.p()
    }

    /// Enables dropout
    pub fn train(&self) {
        self.training.set(true);
    }

    /// Disables dropout
    pub fn eval(&self) {
        self.training.set(false);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Number of dead ReLU units in the last hidden layer of the last forward pass
    pub fn n_dead_neurons(&self) -> usize {
        self.relu.n_dead_neurons()
    }

    fn named_layers(&self) -> impl Iterator<Item = (String, &Linear)> {
        self.hidden_layers
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("hidden_layers.{i}"), l))
            .chain(std::iter::once(("output".to_string(), &self.output)))
    }

    /// Shape of every parameter slot keyed by identifier
    pub fn parameter_shapes(&self) -> BTreeMap<String, Vec<usize>> {
        parameter_shapes(self.input_size, self.output_size, &self.hidden_sizes)
    }
}

/// Parameter identifiers and shapes of a [`Network`] with the given widths, without
/// building it
pub fn parameter_shapes(
    input_size: usize,
    output_size: usize,
    hidden_layers: &[usize],
) -> BTreeMap<String, Vec<usize>> {
    let mut shapes = BTreeMap::new();
    let mut prev = input_size;
    let layers = hidden_layers
        .iter()
        .enumerate()
        .map(|(i, &w)| (format!("hidden_layers.{i}"), w))
        .chain(std::iter::once(("output".to_string(), output_size)));
    for (prefix, width) in layers {
        shapes.insert(format!("{prefix}.weight"), vec![width, prev]);
        shapes.insert(format!("{prefix}.bias"), vec![width]);
        prev = width;
    }
    shapes
}

impl Module for Network {
    fn forward(&self, inputs: &[Value]) -> Result<Vec<Value>, NNError> {
        let training = self.is_training();
        let mut x = inputs.to_vec();
        for layer in self.hidden_layers.iter() {
            let out = layer.forward(&x)?;
            let out = self.relu.forward(&out);
            x = self.dropout.forward(&out, training);
        }
        let out = self.output.forward(&x)?;
        Ok(self.log_softmax.forward(&out))
    }

    fn parameters(&self) -> Vec<Value> {
        self.hidden_layers
            .iter()
            .chain(std::iter::once(&self.output))
            .flat_map(|l| l.parameters())
            .collect()
    }

    fn state_dict(&self) -> StateDict {
        self.named_layers()
            .flat_map(|(prefix, layer)| {
                [
                    (format!("{prefix}.weight"), layer.weight()),
                    (format!("{prefix}.bias"), layer.bias()),
                ]
            })
            .collect()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), CheckpointError> {
        check_state(&self.parameter_shapes(), state)
            .inspect_err(|e| log::warn!("refusing to load state: {e}"))?;

        // every slot has been checked, nothing below can fail
        for (i, layer) in self.hidden_layers.iter_mut().enumerate() {
            layer.assign_weight(&state[&format!("hidden_layers.{i}.weight")]);
            layer.assign_bias(&state[&format!("hidden_layers.{i}.bias")]);
        }
        self.output.assign_weight(&state["output.weight"]);
        self.output.assign_bias(&state["output.bias"]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::assert_eq_float;

    use super::*;

    #[test]
    fn test_layer_forward() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let outputs = layer.forward(&inputs).unwrap();
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.data() == 4.0));
        assert_eq!(layer.weight().shape(), &[3, 2]);
        assert_eq!(layer.bias().data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_dim_mismatch() {
        let layer = Linear::new_ones(2, 3);
        let inputs = vec![Value::new(1.0)];
        let outputs = layer.forward(&inputs).unwrap_err();
        assert_eq!(
            outputs,
            NNError::InputSizeMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_weight_is_row_major() {
        let mut layer = Linear::new_ones(3, 2);
        let w = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        layer.assign_weight(&w);
        let out = layer
            .forward(&[Value::new(1.0), Value::new(0.0), Value::new(0.0)])
            .unwrap();
        // first column of W plus the unit bias
        assert_eq!(out[0].data(), 2.0);
        assert_eq!(out[1].data(), 5.0);
        assert_eq!(layer.weight(), w);
    }

    #[test]
    fn test_log_softmax() {
        let log_softmax = LogSoftmax::new();
        let inputs = vec![Value::new(1.0), Value::new(2.0)];
        let outputs = log_softmax.forward(&inputs);
        assert_eq_float!(outputs[0].data(), 0.2689414f32.ln());
        assert_eq_float!(outputs[1].data(), 0.7310585f32.ln());

        // d log(s1) / dx1 = 1 - s1, d log(s1) / dx2 = -s2
        outputs[0].backward();
        assert_eq_float!(inputs[0].grad(), 1.0 - 0.2689414);
        assert_eq_float!(inputs[1].grad(), -0.7310585);
    }

    #[test]
    fn test_log_softmax_large_inputs() {
        let outputs = LogSoftmax::new().forward(&[Value::new(1000.0), Value::new(1000.0)]);
        assert_eq_float!(outputs[0].data(), 0.5f32.ln());
        assert_eq_float!(outputs[1].data(), 0.5f32.ln());
    }

    #[test]
    fn test_dropout() {
        let dropout = Dropout::new(0.5, 7).unwrap();
        let inputs = (0..200).map(|_| Value::new(1.0)).collect::<Vec<_>>();

        let eval = dropout.forward(&inputs, false);
        assert!(eval.iter().all(|v| v.data() == 1.0));

        let train = dropout.forward(&inputs, true);
        assert!(train.iter().all(|v| v.data() == 0.0 || v.data() == 2.0));
        let n_dropped = train.iter().filter(|v| v.data() == 0.0).count();
        assert!(n_dropped > 50 && n_dropped < 150);

        assert_eq!(Dropout::new(1.0, 0).err(), Some(NNError::InvalidDropout(1.0)));
    }

    #[test]
    fn test_network_shapes() {
        let net = Network::with_seed(4, 3, &[8, 5], 0.2, 0).unwrap();
        let shapes = net.parameter_shapes();
        assert_eq!(shapes["hidden_layers.0.weight"], vec![8, 4]);
        assert_eq!(shapes["hidden_layers.0.bias"], vec![8]);
        assert_eq!(shapes["hidden_layers.1.weight"], vec![5, 8]);
        assert_eq!(shapes["hidden_layers.1.bias"], vec![5]);
        assert_eq!(shapes["output.weight"], vec![3, 5]);
        assert_eq!(shapes["output.bias"], vec![3]);
        assert_eq!(shapes.len(), 6);
        assert_eq!(net.parameters().len(), 8 * 4 + 8 + 5 * 8 + 5 + 3 * 5 + 3);
    }

    #[test]
    fn test_parameter_shapes_match_built_network() {
        let net = Network::with_seed(6, 2, &[3, 3, 5], 0.0, 4).unwrap();
        let built = net
            .state_dict()
            .into_iter()
            .map(|(k, t)| (k, t.shape().to_vec()))
            .collect::<BTreeMap<_, _>>();
        assert_eq!(parameter_shapes(6, 2, &[3, 3, 5]), built);
    }

    #[test]
    fn test_network_without_hidden_layers() {
        let net = Network::with_seed(4, 3, &[], 0.0, 0).unwrap();
        assert_eq!(net.parameter_shapes()["output.weight"], vec![3, 4]);
    }

    #[test]
    fn test_network_rejects_zero_widths() {
        assert!(matches!(
            Network::new(0, 3, &[4], 0.5),
            Err(NNError::InvalidWidth { .. })
        ));
        assert_eq!(
            Network::new(2, 3, &[4, 0], 0.5).err(),
            Some(NNError::InvalidWidth {
                what: "hidden_layers[1]".to_string()
            })
        );
    }

    #[test]
    fn test_network_forward_is_log_probabilities() {
        let net = Network::with_seed(2, 3, &[4], 0.5, 1).unwrap();
        net.eval();
        let out = net.forward(&[Value::new(0.3), Value::new(-1.2)]).unwrap();
        assert_eq!(out.len(), 3);
        let total: f32 = out.iter().map(|v| v.data().exp()).sum();
        assert_eq_float!(total, 1.0);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = Network::with_seed(3, 2, &[4], 0.5, 9).unwrap();
        let b = Network::with_seed(3, 2, &[4], 0.5, 9).unwrap();
        assert_eq!(a.state_dict(), b.state_dict());
    }

    #[test]
    fn test_load_state_dict() {
        let src = Network::with_seed(3, 2, &[4], 0.5, 1).unwrap();
        let mut dst = Network::with_seed(3, 2, &[4], 0.5, 2).unwrap();
        assert_ne!(src.state_dict(), dst.state_dict());

        dst.load_state_dict(&src.state_dict()).unwrap();
        assert_eq!(src.state_dict(), dst.state_dict());
    }

    #[test]
    fn test_load_state_dict_missing_and_unexpected() {
        let src = Network::with_seed(3, 2, &[4], 0.5, 1).unwrap();
        let mut dst = Network::with_seed(3, 2, &[4], 0.5, 2).unwrap();
        let before = dst.state_dict();

        let mut state = src.state_dict();
        state.remove("output.bias");
        let err = dst.load_state_dict(&state).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ShapeMismatch { ref mismatches, ref missing, ref unexpected }
                if mismatches.is_empty() && missing == &["output.bias"] && unexpected.is_empty()
        ));

        let mut state = src.state_dict();
        state.insert("extra.weight".to_string(), Tensor::zeros(vec![1]));
        let err = dst.load_state_dict(&state).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ShapeMismatch { ref unexpected, .. } if unexpected == &["extra.weight"]
        ));

        assert_eq!(dst.state_dict(), before);
    }

    #[test]
    fn test_linear_rejects_zero_inputs() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        assert_eq!(
            Linear::new(0, 3, &mut rng).err(),
            Some(NNError::InvalidWidth {
                what: "n_inputs".to_string()
            })
        );
        let layer = Linear::new(2, 3, &mut rng).unwrap();
        assert_eq!(layer.weight_shape(), vec![3, 2]);
    }
}
