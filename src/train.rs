use std::fmt;

use anyhow::{Context, Result};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{correct_count, nll_loss_sum};
use crate::config::Arguments;
use crate::data::{Dataset, MnistData};
use crate::federated::FederatedDataLoader;
use crate::model::Net;
use crate::optim::Sgd;
use crate::worker::Federation;

/// Per-batch training losses of one epoch, in loader order.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub losses: Vec<f32>,
}

impl EpochReport {
    pub fn mean_loss(&self) -> f32 {
        if self.losses.is_empty() {
            return 0.0;
        }
        self.losses.iter().sum::<f32>() / self.losses.len() as f32
    }
}

/// Evaluation over a held-out set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestReport {
    pub average_loss: f32,
    pub correct: usize,
    pub total: usize,
}

impl TestReport {
    /// Fraction of correctly classified samples, in [0, 1].
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f32 / self.total as f32
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Test set: Average loss: {:.4}, Accuracy: {}/{} ({:.0}%)",
            self.average_loss,
            self.correct,
            self.total,
            100.0 * self.accuracy()
        )
    }
}

pub fn train_log_line(epoch: usize, batch_idx: usize, batch_size: usize, batches: usize, loss: f32) -> String {
    format!(
        "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
        epoch,
        batch_idx * batch_size,
        batches * batch_size,
        100.0 * batch_idx as f32 / batches.max(1) as f32,
        loss
    )
}

/// One pass over the federated training data.
///
/// For every batch the model is sent to the worker owning that batch, takes a
/// single optimizer step there and is brought back before the next batch.
pub fn train_epoch<R: Rng>(
    args: &Arguments,
    model: Net,
    optimizer: &mut Sgd,
    loader: &FederatedDataLoader<'_>,
    epoch: usize,
    rng: &mut R,
) -> Result<(Net, EpochReport)> {
    let batches = loader.len();
    let mut model = model;
    let mut losses = Vec::with_capacity(batches);

    for (batch_idx, batch) in loader.iter(rng).enumerate() {
        let mut remote_model = batch.location().send(model);
        let loss = remote_model.apply(&batch, |net, data| {
            let (loss, grads) = net.forward_backward(&data.images, &data.labels)?;
            optimizer.step(net, &grads)?;
            Ok(loss)
        });
        model = remote_model.get();
        let loss = loss
            .with_context(|| format!("training step {} of epoch {}", batch_idx, epoch))?
            .get();
        losses.push(loss);

        if batch_idx % args.log_interval.max(1) == 0 {
            println!(
                "{}",
                train_log_line(epoch, batch_idx, loader.batch_size(), batches, loss)
            );
        }
    }

    Ok((model, EpochReport { epoch, losses }))
}

/// Summed NLL and argmax accuracy over `dataset`, loss averaged by sample count.
pub fn evaluate(model: &Net, dataset: &Dataset, test_batch_size: usize) -> Result<TestReport> {
    let mut test_loss = 0.0f64;
    let mut correct = 0;
    for batch in dataset.batches(test_batch_size) {
        let output = model.forward(&batch.images)?;
        test_loss += nll_loss_sum(&output, &batch.labels) as f64;
        correct += correct_count(&output, &batch.labels);
    }
    let total = dataset.len();
    let average_loss = if total == 0 { 0.0 } else { (test_loss / total as f64) as f32 };

    Ok(TestReport {
        average_loss,
        correct,
        total,
    })
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub model: Net,
    pub epochs: Vec<EpochReport>,
    pub tests: Vec<TestReport>,
}

/// Federate the training set, then alternate a training epoch and an
/// evaluation pass `args.epochs` times.
pub fn run(args: &Arguments, data: &MnistData) -> Result<RunSummary> {
    args.validate()?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let federation = Federation::new(&args.workers)?;
    info!(
        "Federating {} training samples from {} across {:?}",
        data.train.len(),
        federation.local().id(),
        args.workers
    );
    let federated = data.train.federate(federation.workers())?;
    for (worker, samples) in federated.shard_sizes() {
        info!("{} holds {} training samples", worker, samples);
    }
    let loader = FederatedDataLoader::new(&federated, args.batch_size, true)?;

    let mut model = Net::new(&mut rng);
    info!("Model has {} parameters", model.parameter_count());
    let mut optimizer = Sgd::new(args.lr, args.momentum);

    let mut epochs = Vec::with_capacity(args.epochs);
    let mut tests = Vec::with_capacity(args.epochs);
    for epoch in 1..=args.epochs {
        let (trained, report) = train_epoch(args, model, &mut optimizer, &loader, epoch, &mut rng)?;
        model = trained;
        info!("Epoch {} mean training loss {:.6}", epoch, report.mean_loss());
        epochs.push(report);

        let test_report = evaluate(&model, &data.test, args.test_batch_size)?;
        println!("\n{}\n", test_report);
        tests.push(test_report);
    }

    for worker in federation.workers() {
        info!("{} received {} objects", worker, worker.objects_received());
    }

    if args.save_model {
        model.save(&args.model_path)?;
        info!("Saved model to {}", args.model_path.display());
    }

    Ok(RunSummary {
        model,
        epochs,
        tests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{IMAGE_DIM, LABELS};
    use ndarray::{Array1, Array2};

    #[test]
    fn test_train_log_line_format() {
        let line = train_log_line(3, 30, 64, 938, 0.123456789);
        assert_eq!(line, "Train Epoch: 3 [1920/60032 (3%)]\tLoss: 0.123457");
    }

    #[test]
    fn test_report_display_and_accuracy() {
        let report = TestReport {
            average_loss: 0.04567,
            correct: 9876,
            total: 10000,
        };
        assert_eq!(
            report.to_string(),
            "Test set: Average loss: 0.0457, Accuracy: 9876/10000 (99%)"
        );
        assert!((report.accuracy() - 0.9876).abs() < 1e-6);

        let empty = TestReport {
            average_loss: 0.0,
            correct: 0,
            total: 0,
        };
        assert_eq!(empty.accuracy(), 0.0);
    }

    #[test]
    fn test_evaluation_bounds() {
        let mut rng = StdRng::seed_from_u64(2);
        let net = Net::new(&mut rng);
        let images = Array2::from_shape_fn((25, IMAGE_DIM), |_| rng.gen_range(-1.0..1.0));
        let labels = Array1::from_shape_fn(25, |i| i % LABELS);
        let ds = Dataset::new(images, labels).unwrap();

        let report = evaluate(&net, &ds, 10).unwrap();
        assert_eq!(report.total, 25);
        assert!(report.average_loss >= 0.0);
        assert!((0.0..=1.0).contains(&report.accuracy()));

        // batch size must not change the result
        let whole = evaluate(&net, &ds, 1000).unwrap();
        assert_eq!(whole.correct, report.correct);
        assert!((whole.average_loss - report.average_loss).abs() < 1e-4);
    }

    #[test]
    fn test_epoch_mean_loss() {
        let report = EpochReport {
            epoch: 1,
            losses: vec![1.0, 2.0, 3.0],
        };
        assert_eq!(report.mean_loss(), 2.0);
    }
}
