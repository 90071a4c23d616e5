use anyhow::{bail, Result};
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::{Batch, Dataset};
use crate::worker::{Remote, VirtualWorker};

/// A training set split across workers, one shard each.
#[derive(Debug)]
pub struct FederatedDataset {
    shards: Vec<Remote<Dataset>>,
}

impl FederatedDataset {
    pub fn shards(&self) -> &[Remote<Dataset>] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map(Dataset::len).get()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample count per worker, in federation order.
    pub fn shard_sizes(&self) -> Vec<(String, usize)> {
        self.shards
            .iter()
            .map(|s| (s.location().id().to_string(), s.map(Dataset::len).get()))
            .collect()
    }
}

impl Dataset {
    /// Split into contiguous shards and send one to each worker. Every worker
    /// gets `len / workers` samples; the last one also takes the remainder.
    pub fn federate(&self, workers: &[VirtualWorker]) -> Result<FederatedDataset> {
        if workers.is_empty() {
            bail!("cannot federate a dataset across zero workers");
        }
        let total = self.len();
        if total < workers.len() {
            bail!("{} samples cannot be split across {} workers", total, workers.len());
        }
        let per_worker = total / workers.len();

        let mut shards = Vec::with_capacity(workers.len());
        for (i, worker) in workers.iter().enumerate() {
            let start = i * per_worker;
            let end = if i == workers.len() - 1 {
                total
            } else {
                start + per_worker
            };
            info!("Worker {}: {} samples ({}-{})", worker.id(), end - start, start, end);
            shards.push(worker.send(self.slice(start, end)));
        }

        Ok(FederatedDataset { shards })
    }
}

/// Yields worker-owned batches, draining one worker's shard before moving to
/// the next.
pub struct FederatedDataLoader<'a> {
    dataset: &'a FederatedDataset,
    batch_size: usize,
    shuffle: bool,
}

impl<'a> FederatedDataLoader<'a> {
    pub fn new(dataset: &'a FederatedDataset, batch_size: usize, shuffle: bool) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Total number of batches across all workers.
    pub fn len(&self) -> usize {
        self.dataset
            .shards
            .iter()
            .map(|s| s.map(Dataset::len).get().div_ceil(self.batch_size))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One pass over the data. Sample order within each shard is drawn from
    /// `rng` when shuffling is enabled.
    pub fn iter<R: Rng>(&self, rng: &mut R) -> impl Iterator<Item = Remote<Batch>> + 'a {
        let batch_size = self.batch_size;
        let dataset: &'a FederatedDataset = self.dataset;
        let mut plans = Vec::with_capacity(dataset.shards.len());
        for shard in &dataset.shards {
            let mut order: Vec<usize> = (0..shard.map(Dataset::len).get()).collect();
            if self.shuffle {
                order.shuffle(rng);
            }
            plans.push((shard, order));
        }

        plans.into_iter().flat_map(move |(shard, order)| {
            let chunks: Vec<Vec<usize>> = order.chunks(batch_size).map(<[usize]>::to_vec).collect();
            chunks
                .into_iter()
                .map(move |positions| shard.map(|data| data.batch(&positions)))
        })
    }
}
