//! Recurrent sequence regressor.
//!
//! A single-layer tanh recurrent network over fixed-length feature
//! sequences, with a linear head on the final hidden state. Trained by
//! backpropagation through time with Adam on the mean-squared error in
//! standardized space. All weights live in plain ndarray tensors so the
//! whole model serializes as one JSON blob.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};

const GRAD_CLIP_NORM: f64 = 5.0;
const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentRegressor {
    pub input_size:  usize,
    pub hidden_size: usize,
    pub w_in:        Array2<f64>, // hidden × input
    pub w_rec:       Array2<f64>, // hidden × hidden
    pub b_h:         Array1<f64>,
    pub w_out:       Array1<f64>,
    pub b_out:       f64,
}

impl RecurrentRegressor {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut Pcg64Mcg) -> Self {
        let scale_in = 1.0 / (input_size as f64).sqrt();
        let scale_rec = 1.0 / (hidden_size as f64).sqrt();
        Self {
            input_size,
            hidden_size,
            w_in:  random_matrix(hidden_size, input_size, scale_in, rng),
            w_rec: random_matrix(hidden_size, hidden_size, scale_rec, rng),
            b_h:   Array1::zeros(hidden_size),
            w_out: random_vector(hidden_size, scale_rec, rng),
            b_out: 0.0,
        }
    }

    fn hidden_states(&self, steps: &Array2<f64>) -> Vec<Array1<f64>> {
        let mut h = Array1::zeros(self.hidden_size);
        let mut states = Vec::with_capacity(steps.nrows());
        for t in 0..steps.nrows() {
            let x_t = steps.row(t);
            let pre = self.w_in.dot(&x_t) + self.w_rec.dot(&h) + &self.b_h;
            h = pre.mapv(f64::tanh);
            states.push(h.clone());
        }
        states
    }

    /// Regression output (in standardized space) for one sequence of shape
    /// `(sequence_length, input_size)`.
    pub fn forward(&self, steps: &Array2<f64>) -> f64 {
        match self.hidden_states(steps).last() {
            Some(h) => self.w_out.dot(h) + self.b_out,
            None => self.b_out,
        }
    }
}

fn random_matrix(rows: usize, cols: usize, scale: f64, rng: &mut Pcg64Mcg) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-scale..scale))
}

fn random_vector(len: usize, scale: f64, rng: &mut Pcg64Mcg) -> Array1<f64> {
    Array1::from_shape_fn(len, |_| rng.gen_range(-scale..scale))
}

fn outer(a: &Array1<f64>, b: ArrayView1<'_, f64>) -> Array2<f64> {
    let a2 = a.view().insert_axis(Axis(1));
    let b2 = b.insert_axis(Axis(0));
    a2.dot(&b2)
}

// ── Gradients ────────────────────────────────────────────────────────────────

struct Gradients {
    w_in:  Array2<f64>,
    w_rec: Array2<f64>,
    b_h:   Array1<f64>,
    w_out: Array1<f64>,
    b_out: f64,
}

impl Gradients {
    fn zeros(model: &RecurrentRegressor) -> Self {
        Self {
            w_in:  Array2::zeros((model.hidden_size, model.input_size)),
            w_rec: Array2::zeros((model.hidden_size, model.hidden_size)),
            b_h:   Array1::zeros(model.hidden_size),
            w_out: Array1::zeros(model.hidden_size),
            b_out: 0.0,
        }
    }

    fn scale(&mut self, k: f64) {
        self.w_in *= k;
        self.w_rec *= k;
        self.b_h *= k;
        self.w_out *= k;
        self.b_out *= k;
    }

    fn clip_global_norm(&mut self, max_norm: f64) {
        let sq = self.w_in.iter().map(|v| v * v).sum::<f64>()
            + self.w_rec.iter().map(|v| v * v).sum::<f64>()
            + self.b_h.iter().map(|v| v * v).sum::<f64>()
            + self.w_out.iter().map(|v| v * v).sum::<f64>()
            + self.b_out * self.b_out;
        let norm = sq.sqrt();
        if norm > max_norm {
            self.scale(max_norm / norm);
        }
    }
}

/// Squared-error loss and its gradients for one sequence, by
/// backpropagation through time.
fn backprop(model: &RecurrentRegressor, steps: &Array2<f64>, target: f64) -> (f64, Gradients) {
    let states = model.hidden_states(steps);
    let mut grads = Gradients::zeros(model);

    let last = match states.last() {
        Some(h) => h,
        None => return (0.0, grads),
    };
    let output = model.w_out.dot(last) + model.b_out;
    let err = output - target;
    let loss = err * err;

    let d_out = 2.0 * err;
    grads.w_out += &(last * d_out);
    grads.b_out += d_out;

    let mut d_h: Array1<f64> = model.w_out.mapv(|w| w * d_out);

    for t in (0..states.len()).rev() {
        let h_t = &states[t];
        let one_minus_sq = h_t.mapv(|v| 1.0 - v * v);
        let d_a = &d_h * &one_minus_sq;

        grads.b_h += &d_a;
        grads.w_in += &outer(&d_a, steps.row(t));
        if t > 0 {
            grads.w_rec += &outer(&d_a, states[t - 1].view());
        }
        d_h = model.w_rec.t().dot(&d_a);
    }

    (loss, grads)
}

// ── Adam ─────────────────────────────────────────────────────────────────────

struct Adam {
    lr:      f64,
    t:       i32,
    m:       Gradients,
    v:       Gradients,
}

impl Adam {
    fn new(model: &RecurrentRegressor, lr: f64) -> Self {
        Self {
            lr,
            t: 0,
            m: Gradients::zeros(model),
            v: Gradients::zeros(model),
        }
    }

    fn step(&mut self, model: &mut RecurrentRegressor, grads: &Gradients) {
        self.t += 1;
        let bc1 = 1.0 - ADAM_BETA1.powi(self.t);
        let bc2 = 1.0 - ADAM_BETA2.powi(self.t);
        let lr = self.lr;

        adam_apply2(&mut model.w_in, &grads.w_in, &mut self.m.w_in, &mut self.v.w_in, lr, bc1, bc2);
        adam_apply2(&mut model.w_rec, &grads.w_rec, &mut self.m.w_rec, &mut self.v.w_rec, lr, bc1, bc2);
        adam_apply1(&mut model.b_h, &grads.b_h, &mut self.m.b_h, &mut self.v.b_h, lr, bc1, bc2);
        adam_apply1(&mut model.w_out, &grads.w_out, &mut self.m.w_out, &mut self.v.w_out, lr, bc1, bc2);

        self.m.b_out = ADAM_BETA1 * self.m.b_out + (1.0 - ADAM_BETA1) * grads.b_out;
        self.v.b_out = ADAM_BETA2 * self.v.b_out + (1.0 - ADAM_BETA2) * grads.b_out * grads.b_out;
        model.b_out -= lr * (self.m.b_out / bc1) / ((self.v.b_out / bc2).sqrt() + ADAM_EPS);
    }
}

fn adam_apply2(
    param: &mut Array2<f64>,
    grad: &Array2<f64>,
    m: &mut Array2<f64>,
    v: &mut Array2<f64>,
    lr: f64,
    bc1: f64,
    bc2: f64,
) {
    for (((p, g), m), v) in param
        .iter_mut()
        .zip(grad.iter())
        .zip(m.iter_mut())
        .zip(v.iter_mut())
    {
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + ADAM_EPS);
    }
}

fn adam_apply1(
    param: &mut Array1<f64>,
    grad: &Array1<f64>,
    m: &mut Array1<f64>,
    v: &mut Array1<f64>,
    lr: f64,
    bc1: f64,
    bc2: f64,
) {
    for (((p, g), m), v) in param
        .iter_mut()
        .zip(grad.iter())
        .zip(m.iter_mut())
        .zip(v.iter_mut())
    {
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + ADAM_EPS);
    }
}

// ── Training loop ────────────────────────────────────────────────────────────

/// Fit `model` in place over standardized sequences/targets. Returns the
/// final epoch's mean training loss.
pub fn fit(
    model: &mut RecurrentRegressor,
    sequences: &[Array2<f64>],
    targets: &[f64],
    epochs: usize,
    learning_rate: f64,
    batch_size: usize,
    rng: &mut Pcg64Mcg,
) -> f64 {
    use rand::seq::SliceRandom;

    let mut optimizer = Adam::new(model, learning_rate);
    let mut order: Vec<usize> = (0..sequences.len()).collect();
    let batch_size = batch_size.max(1);
    let mut epoch_loss = 0.0;

    for epoch in 0..epochs {
        order.shuffle(rng);
        let mut total_loss = 0.0;

        for batch in order.chunks(batch_size) {
            let mut grads = Gradients::zeros(model);
            let mut batch_loss = 0.0;
            for &i in batch {
                let (loss, g) = backprop(model, &sequences[i], targets[i]);
                batch_loss += loss;
                grads.w_in += &g.w_in;
                grads.w_rec += &g.w_rec;
                grads.b_h += &g.b_h;
                grads.w_out += &g.w_out;
                grads.b_out += g.b_out;
            }
            grads.scale(1.0 / batch.len() as f64);
            grads.clip_global_norm(GRAD_CLIP_NORM);
            optimizer.step(model, &grads);
            total_loss += batch_loss;
        }

        epoch_loss = total_loss / sequences.len().max(1) as f64;
        if (epoch + 1) % 10 == 0 {
            log::debug!("next_purchase: epoch {}/{epochs} loss={epoch_loss:.5}", epoch + 1);
        }
    }

    epoch_loss
}
