//! Fixed-topology feed-forward networks evolved by mutation only.

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Standard deviation of the Gaussian noise added by [`Network::mutate`].
pub const MUT_STD_DEV: f64 = 0.1;

/// Logistic activation.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Fully connected layer with sigmoid activation.
///
/// `weights` has one row per input node and one column per output node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl Layer {
    fn random<R: Rng + ?Sized>(n_inputs: usize, n_nodes: usize, rng: &mut R) -> Self {
        let weights = (0..n_inputs)
            .map(|_| (0..n_nodes).map(|_| rng.random::<f64>()).collect())
            .collect();
        let bias = (0..n_nodes).map(|_| rng.random::<f64>()).collect();
        Self { weights, bias }
    }

    pub fn n_inputs(&self) -> usize {
        self.weights.len()
    }

    #[cfg(test)]
    fn n_nodes(&self) -> usize {
        self.bias.len()
    }

    fn feed_forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        let exp_len = self.n_inputs();
        let len = input.len();
        if len != exp_len {
            bail!("input length must be {exp_len}, but is {len}");
        }

        let mut output = self.bias.clone();
        for (&x, row) in input.iter().zip(&self.weights) {
            for (out, &w) in output.iter_mut().zip(row) {
                *out += x * w;
            }
        }
        output.iter_mut().for_each(|out| *out = sigmoid(*out));

        Ok(output)
    }

    fn mutate<R: Rng + ?Sized>(&mut self, noise: &Normal<f64>, rng: &mut R) {
        for w in self.weights.iter_mut().flatten() {
            *w += noise.sample(rng);
        }
        for b in &mut self.bias {
            *b += noise.sample(rng);
        }
    }
}

/// Multilayer perceptron built from a list of layer widths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Create a network with weights and biases drawn uniformly from `[0, 1)`.
    ///
    /// `topology` lists the width of every layer, input first.
    ///
    /// # Errors
    /// Returns an error if there are fewer than two layers or a layer is empty.
    pub fn new<R: Rng + ?Sized>(topology: &[usize], rng: &mut R) -> Result<Self> {
        if topology.len() < 2 {
            bail!(
                "topology must have an input and an output layer, but has {} layers",
                topology.len()
            );
        }
        if topology.contains(&0) {
            bail!("every layer must have at least one node, but topology is {topology:?}");
        }

        let layers = topology
            .windows(2)
            .map(|pair| Layer::random(pair[0], pair[1], rng))
            .collect();

        Ok(Self { layers })
    }

    #[cfg(test)]
    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Number of inputs the network expects.
    #[cfg(test)]
    pub(crate) fn n_inputs(&self) -> usize {
        self.layers.first().map_or(0, Layer::n_inputs)
    }

    /// Propagate `input` through every layer and return the output layer activations.
    pub fn feed_forward(&self, input: &[f64]) -> Result<Vec<f64>> {
        let mut activations = input.to_vec();
        for (i_layer, layer) in self.layers.iter().enumerate() {
            activations = layer
                .feed_forward(&activations)
                .with_context(|| format!("failed to feed layer {i_layer}"))?;
        }
        Ok(activations)
    }

    /// Add independent Gaussian noise to every weight and bias.
    pub fn mutate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let noise = Normal::new(0.0, MUT_STD_DEV)?;
        for layer in &mut self.layers {
            layer.mutate(&noise, rng);
        }
        Ok(())
    }

    /// Network whose weights and biases all equal `value`.
    #[cfg(test)]
    pub(crate) fn constant(topology: &[usize], value: f64) -> Self {
        let layers = topology
            .windows(2)
            .map(|pair| Layer {
                weights: vec![vec![value; pair[1]]; pair[0]],
                bias: vec![value; pair[1]],
            })
            .collect();
        Self { layers }
    }
}
