use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Hyperparameters for a training run. Built once at startup and only read
/// afterwards.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "federated_mnist")]
#[command(about = "Train an MNIST CNN on data federated across virtual workers")]
pub struct Arguments {
    /// Samples per training batch
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Samples per evaluation batch
    #[arg(long, default_value_t = 1000)]
    pub test_batch_size: usize,

    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    /// Learning rate
    #[arg(long, default_value_t = 0.01)]
    pub lr: f32,

    /// SGD momentum
    #[arg(long, default_value_t = 0.5)]
    pub momentum: f32,

    /// Seed for weight init and shuffling
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Print a training line every N batches
    #[arg(long, default_value_t = 30)]
    pub log_interval: usize,

    /// Persist the trained weights to `model_path`
    #[arg(long)]
    pub save_model: bool,

    #[arg(long, default_value = "mnist_cnn.bin")]
    pub model_path: PathBuf,

    /// Where the MNIST archives are cached
    #[arg(long, default_value = "data/mnist")]
    pub data_dir: PathBuf,

    /// Names of the participants holding the training data
    #[arg(long, value_delimiter = ',', default_values = ["bob", "alice"])]
    pub workers: Vec<String>,
}

impl Default for Arguments {
    fn default() -> Self {
        Self::parse_from(["federated_mnist"])
    }
}

impl Arguments {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.test_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if self.epochs == 0 {
            bail!("epochs must be positive");
        }
        if self.log_interval == 0 {
            bail!("log interval must be positive");
        }
        if !(self.lr > 0.0) {
            bail!("learning rate must be positive, got {}", self.lr);
        }
        if !(0.0..1.0).contains(&self.momentum) {
            bail!("momentum must be in [0, 1), got {}", self.momentum);
        }
        if self.workers.is_empty() {
            bail!("at least one worker is required");
        }
        let mut seen = HashSet::new();
        for name in &self.workers {
            if !seen.insert(name.as_str()) {
                bail!("duplicate worker name '{}'", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tutorial() {
        let args = Arguments::default();
        assert_eq!(args.batch_size, 64);
        assert_eq!(args.test_batch_size, 1000);
        assert_eq!(args.epochs, 10);
        assert!((args.lr - 0.01).abs() < 1e-9);
        assert!((args.momentum - 0.5).abs() < 1e-9);
        assert_eq!(args.seed, 1);
        assert_eq!(args.log_interval, 30);
        assert!(!args.save_model);
        assert_eq!(args.workers, vec!["bob".to_string(), "alice".to_string()]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_parse_flags() {
        let args = Arguments::parse_from([
            "federated_mnist",
            "--epochs",
            "2",
            "--save-model",
            "--workers",
            "carol,dave,erin",
        ]);
        assert_eq!(args.epochs, 2);
        assert!(args.save_model);
        assert_eq!(args.workers.len(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut args = Arguments::default();
        args.batch_size = 0;
        assert!(args.validate().is_err());

        let mut args = Arguments::default();
        args.momentum = 1.0;
        assert!(args.validate().is_err());

        let mut args = Arguments::default();
        args.workers = vec!["bob".into(), "bob".into()];
        assert!(args.validate().is_err());

        let mut args = Arguments::default();
        args.lr = 0.0;
        assert!(args.validate().is_err());
    }
}
