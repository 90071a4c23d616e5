use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::common::*;
use crate::data::{IMAGE_DIM, IMAGE_SIDE, LABELS};

const KERNEL: usize = 5;
const CONV1_OUT: usize = 20;
const CONV2_OUT: usize = 50;
const HIDDEN: usize = 500;

const CONV1_SIDE: usize = IMAGE_SIDE - KERNEL + 1; // 24
const POOL1_SIDE: usize = CONV1_SIDE / 2; // 12
const CONV2_SIDE: usize = POOL1_SIDE - KERNEL + 1; // 8
const POOL2_SIDE: usize = CONV2_SIDE / 2; // 4
const FLAT: usize = POOL2_SIDE * POOL2_SIDE * CONV2_OUT; // 800

/// An affine map `x W^T + b`. Convolutions use it over im2col windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Array2<f32>, // [out, in]
    pub bias: Array1<f32>,   // [out]
}

impl Dense {
    /// Uniform in `±1/sqrt(fan_in)` for both weight and bias.
    fn init<R: Rng>(out: usize, fan_in: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (fan_in as f32).sqrt();
        Self {
            weight: Array2::from_shape_fn((out, fan_in), |_| rng.gen_range(-bound..bound)),
            bias: Array1::from_shape_fn(out, |_| rng.gen_range(-bound..bound)),
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            weight: Array2::zeros(self.weight.raw_dim()),
            bias: Array1::zeros(self.bias.raw_dim()),
        }
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    fn param_grads(&self, x: &Array2<f32>, grad_out: &Array2<f32>) -> Dense {
        Dense {
            weight: grad_out.t().dot(x),
            bias: grad_out.sum_axis(Axis(0)),
        }
    }

    fn input_grad(&self, grad_out: &Array2<f32>) -> Array2<f32> {
        grad_out.dot(&self.weight)
    }

    fn len(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Intermediate values of a forward pass kept for backpropagation.
struct Trace {
    patches1: Array2<f32>,
    pre1: Array2<f32>,
    arg1: Array2<usize>,
    patches2: Array2<f32>,
    pre2: Array2<f32>,
    arg2: Array2<usize>,
    flat: Array2<f32>,
    pre3: Array2<f32>,
    hidden: Array2<f32>,
    log_probs: Array2<f32>,
}

/// The MNIST classifier:
/// conv(1→20, 5x5) → relu → pool, conv(20→50, 5x5) → relu → pool,
/// fc(800→500) → relu, fc(500→10) → log-softmax.
///
/// Gradients are returned in the same shape, so an optimizer can walk
/// parameters and gradients layer by layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Net {
    pub conv1: Dense,
    pub conv2: Dense,
    pub fc1: Dense,
    pub fc2: Dense,
}

impl Net {
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        Self {
            conv1: Dense::init(CONV1_OUT, KERNEL * KERNEL, rng),
            conv2: Dense::init(CONV2_OUT, KERNEL * KERNEL * CONV1_OUT, rng),
            fc1: Dense::init(HIDDEN, FLAT, rng),
            fc2: Dense::init(LABELS, HIDDEN, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            conv1: self.conv1.zeros_like(),
            conv2: self.conv2.zeros_like(),
            fc1: self.fc1.zeros_like(),
            fc2: self.fc2.zeros_like(),
        }
    }

    pub fn layers(&self) -> [&Dense; 4] {
        [&self.conv1, &self.conv2, &self.fc1, &self.fc2]
    }

    pub fn layers_mut(&mut self) -> [&mut Dense; 4] {
        [&mut self.conv1, &mut self.conv2, &mut self.fc1, &mut self.fc2]
    }

    pub fn parameter_count(&self) -> usize {
        self.layers().iter().map(|l| l.len()).sum()
    }

    /// True when every layer has the same shapes as in `other`.
    pub fn same_shape(&self, other: &Net) -> bool {
        self.layers().iter().zip(other.layers().iter()).all(|(a, b)| {
            a.weight.shape() == b.weight.shape() && a.bias.shape() == b.bias.shape()
        })
    }

    fn has_expected_shape(&self) -> bool {
        let expected = [
            (CONV1_OUT, KERNEL * KERNEL),
            (CONV2_OUT, KERNEL * KERNEL * CONV1_OUT),
            (HIDDEN, FLAT),
            (LABELS, HIDDEN),
        ];
        self.layers()
            .iter()
            .zip(expected)
            .all(|(layer, (out, fan_in))| layer.weight.dim() == (out, fan_in) && layer.bias.len() == out)
    }

    /// Log-probabilities, shape `[batch, 10]`.
    pub fn forward(&self, xs: &Array2<f32>) -> Result<Array2<f32>> {
        Ok(self.trace(xs)?.log_probs)
    }

    /// Mean negative log-likelihood of `ys` and its gradient for every parameter.
    pub fn forward_backward(&self, xs: &Array2<f32>, ys: &Array1<usize>) -> Result<(f32, Net)> {
        if xs.nrows() != ys.len() {
            bail!("batch has {} images but {} labels", xs.nrows(), ys.len());
        }
        if let Some(bad) = ys.iter().find(|&&y| y >= LABELS) {
            bail!("label {} out of range", bad);
        }
        let batch = xs.nrows();
        let t = self.trace(xs)?;
        let loss = nll_loss_sum(&t.log_probs, ys) / batch as f32;

        let d_logits = log_softmax_nll_gradient(&t.log_probs, ys);
        let fc2 = self.fc2.param_grads(&t.hidden, &d_logits);
        let d_pre3 = relu_backward(self.fc2.input_grad(&d_logits), &t.pre3);

        let fc1 = self.fc1.param_grads(&t.flat, &d_pre3);
        let d_pool2 = self
            .fc1
            .input_grad(&d_pre3)
            .into_shape((batch * POOL2_SIDE * POOL2_SIDE, CONV2_OUT))?;
        let d_act2 = max_pool2_backward(&d_pool2, &t.arg2, batch * CONV2_SIDE * CONV2_SIDE);
        let d_pre2 = relu_backward(d_act2, &t.pre2);

        let conv2 = self.conv2.param_grads(&t.patches2, &d_pre2);
        let d_pool1 = col2im(
            &self.conv2.input_grad(&d_pre2),
            batch,
            POOL1_SIDE,
            POOL1_SIDE,
            KERNEL,
            CONV1_OUT,
        );
        let d_act1 = max_pool2_backward(&d_pool1, &t.arg1, batch * CONV1_SIDE * CONV1_SIDE);
        let d_pre1 = relu_backward(d_act1, &t.pre1);
        let conv1 = self.conv1.param_grads(&t.patches1, &d_pre1);

        Ok((loss, Net { conv1, conv2, fc1, fc2 }))
    }

    fn trace(&self, xs: &Array2<f32>) -> Result<Trace> {
        if xs.ncols() != IMAGE_DIM {
            bail!("expected {} pixels per image, got {}", IMAGE_DIM, xs.ncols());
        }
        let batch = xs.nrows();
        let input = xs
            .as_standard_layout()
            .into_owned()
            .into_shape((batch * IMAGE_DIM, 1))?;

        let patches1 = im2col(&input, batch, IMAGE_SIDE, IMAGE_SIDE, KERNEL);
        let pre1 = self.conv1.forward(&patches1);
        let (pool1, arg1) = max_pool2(&relu(&pre1), batch, CONV1_SIDE, CONV1_SIDE);

        let patches2 = im2col(&pool1, batch, POOL1_SIDE, POOL1_SIDE, KERNEL);
        let pre2 = self.conv2.forward(&patches2);
        let (pool2, arg2) = max_pool2(&relu(&pre2), batch, CONV2_SIDE, CONV2_SIDE);

        let flat = pool2.into_shape((batch, FLAT))?;
        let pre3 = self.fc1.forward(&flat);
        let hidden = relu(&pre3);
        let log_probs = log_softmax(&self.fc2.forward(&hidden));

        Ok(Trace {
            patches1,
            pre1,
            arg1,
            patches2,
            pre2,
            arg2,
            flat,
            pre3,
            hidden,
            log_probs,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        bincode::serialize_into(BufWriter::new(file), self)
            .with_context(|| format!("writing model to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let net: Net = bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("reading model from {}", path.display()))?;
        if !net.has_expected_shape() {
            bail!("{} does not hold weights for this architecture", path.display());
        }
        Ok(net)
    }
}
