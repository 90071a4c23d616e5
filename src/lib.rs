//! Federated training of a small MNIST CNN.
//!
//! The training set is split across named virtual workers. For every batch the
//! model is sent to the worker holding that batch, updated there, and brought
//! back; evaluation runs centrally on the held-out test set.

pub mod common;
pub mod config;
pub mod data;
pub mod federated;
pub mod model;
pub mod optim;
pub mod train;
pub mod worker;

pub use config::Arguments;
pub use data::{Batch, Dataset, MnistData};
pub use federated::{FederatedDataLoader, FederatedDataset};
pub use model::Net;
pub use optim::Sgd;
pub use train::{evaluate, run, train_epoch, EpochReport, RunSummary, TestReport};
pub use worker::{Federation, Remote, VirtualWorker};
