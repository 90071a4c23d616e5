//! Numeric kernels shared by the classifier.
//!
//! Feature maps are stored channels-last as a 2-D array of shape
//! `(batch * height * width, channels)`, row `(b * height + y) * width + x`.

use ndarray::{s, Array1, Array2, Axis, Zip};

/// Unfold every `k x k` window of a feature map into one row, ordered
/// `(ky, kx, channel)`. Output shape is `(batch * oh * ow, k * k * channels)`.
pub fn im2col(input: &Array2<f32>, batch: usize, h: usize, w: usize, k: usize) -> Array2<f32> {
    let c = input.ncols();
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut out = Array2::zeros((batch * oh * ow, k * k * c));
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                let orow = (b * oh + y) * ow + x;
                for ky in 0..k {
                    for kx in 0..k {
                        let irow = (b * h + y + ky) * w + x + kx;
                        let col = (ky * k + kx) * c;
                        out.slice_mut(s![orow, col..col + c]).assign(&input.row(irow));
                    }
                }
            }
        }
    }
    out
}

/// Adjoint of [`im2col`]: scatter-add window rows back onto the feature map.
pub fn col2im(
    cols: &Array2<f32>,
    batch: usize,
    h: usize,
    w: usize,
    k: usize,
    c: usize,
) -> Array2<f32> {
    let (oh, ow) = (h - k + 1, w - k + 1);
    let mut out = Array2::zeros((batch * h * w, c));
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                let orow = (b * oh + y) * ow + x;
                for ky in 0..k {
                    for kx in 0..k {
                        let irow = (b * h + y + ky) * w + x + kx;
                        let col = (ky * k + kx) * c;
                        let mut dst = out.row_mut(irow);
                        dst += &cols.slice(s![orow, col..col + c]);
                    }
                }
            }
        }
    }
    out
}

/// 2x2 max pooling with stride 2. Returns the pooled map and, for every
/// output element, the input row that supplied the maximum.
pub fn max_pool2(input: &Array2<f32>, batch: usize, h: usize, w: usize) -> (Array2<f32>, Array2<usize>) {
    let c = input.ncols();
    let (oh, ow) = (h / 2, w / 2);
    let mut out = Array2::zeros((batch * oh * ow, c));
    let mut argmax = Array2::zeros((batch * oh * ow, c));
    for b in 0..batch {
        for y in 0..oh {
            for x in 0..ow {
                let orow = (b * oh + y) * ow + x;
                let base = (b * h + 2 * y) * w + 2 * x;
                let candidates = [base, base + 1, base + w, base + w + 1];
                for ch in 0..c {
                    let mut best = candidates[0];
                    for &row in &candidates[1..] {
                        if input[[row, ch]] > input[[best, ch]] {
                            best = row;
                        }
                    }
                    out[[orow, ch]] = input[[best, ch]];
                    argmax[[orow, ch]] = best;
                }
            }
        }
    }
    (out, argmax)
}

/// Route pooled gradients back to the winning input positions.
pub fn max_pool2_backward(grad: &Array2<f32>, argmax: &Array2<usize>, input_rows: usize) -> Array2<f32> {
    let mut out = Array2::zeros((input_rows, grad.ncols()));
    for ((orow, ch), &g) in grad.indexed_iter() {
        out[[argmax[[orow, ch]], ch]] += g;
    }
    out
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Mask `grad` by where the pre-activation was positive.
pub fn relu_backward(mut grad: Array2<f32>, pre: &Array2<f32>) -> Array2<f32> {
    Zip::from(&mut grad).and(pre).for_each(|g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

/// Row-wise log-softmax, shifted by the row max for stability.
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();
    for mut row in result.rows_mut() {
        let max_val = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        let log_sum = row.iter().map(|&x| (x - max_val).exp()).sum::<f32>().ln();
        row.mapv_inplace(|x| (x - max_val) - log_sum);
    }
    result
}

/// Negative log-likelihood summed over the batch.
pub fn nll_loss_sum(log_probs: &Array2<f32>, labels: &Array1<usize>) -> f32 {
    labels
        .iter()
        .enumerate()
        .map(|(i, &label)| -log_probs[[i, label]])
        .sum()
}

/// Gradient of the mean NLL of a log-softmax output with respect to its logits.
pub fn log_softmax_nll_gradient(log_probs: &Array2<f32>, labels: &Array1<usize>) -> Array2<f32> {
    let scale = 1.0 / labels.len().max(1) as f32;
    let mut grad = log_probs.mapv(f32::exp);
    for (i, &label) in labels.iter().enumerate() {
        grad[[i, label]] -= 1.0;
    }
    grad *= scale;
    grad
}

/// Index of the largest value in each row; the first one wins ties.
pub fn argmax_rows(x: &Array2<f32>) -> Array1<usize> {
    x.map_axis(Axis(1), |row| {
        let mut best = 0;
        for (i, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = i;
            }
        }
        best
    })
}

pub fn correct_count(log_probs: &Array2<f32>, labels: &Array1<usize>) -> usize {
    argmax_rows(log_probs)
        .iter()
        .zip(labels.iter())
        .filter(|(pred, label)| pred == label)
        .count()
}
