//! Batch loading with an order guarantee.
//!
//! The sample order of an epoch is fixed up front (optionally shuffled from
//! the seed and the epoch number). A rayon pool loads and collates one window
//! of batches at a time, in parallel, while the training loop consumes the
//! previous window; `collect` keeps the window in plan order, so a run is
//! reproducible whatever the number of workers.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
};

use burn::data::{dataloader::batcher::Batcher, dataset::Dataset};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use tracing::warn;

use crate::error::{CrnnError, Result};

type SharedBatcher<I, O> = Arc<dyn Batcher<I, Result<O>> + Send + Sync>;
type SharedDataset<I> = Arc<dyn Dataset<I> + Send + Sync>;

pub struct OrderedDataLoaderBuilder<I, O> {
    batcher: SharedBatcher<I, O>,
    batch_size: usize,
    num_workers: usize,
    prefetch: Option<usize>,
    shuffle: Option<u64>,
}

impl<I, O> OrderedDataLoaderBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<Bt>(batcher: Bt) -> Self
    where
        Bt: Batcher<I, Result<O>> + Send + Sync + 'static,
    {
        Self {
            batcher: Arc::new(batcher),
            batch_size: 1,
            num_workers: 0,
            prefetch: None,
            shuffle: None,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Shuffle the samples of every epoch; the order depends only on `seed`
    /// and the epoch number.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(seed);
        self
    }

    /// Zero loads batches on the calling thread.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Number of batches loaded together in the background. Defaults to
    /// twice the number of workers.
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn build<D>(self, dataset: D) -> OrderedDataLoader<I, O>
    where
        D: Dataset<I> + Send + Sync + 'static,
    {
        let pool = if self.num_workers == 0 {
            None
        } else {
            ThreadPoolBuilder::new()
                .num_threads(self.num_workers)
                .thread_name(|idx| format!("batch-loader-{idx}"))
                .build()
                .map(Arc::new)
                .map_err(|err| warn!(%err, "fail to start loader threads, loading sequentially"))
                .ok()
        };
        let prefetch = match pool {
            Some(_) => self
                .prefetch
                .unwrap_or(2 * self.num_workers)
                .max(self.num_workers),
            None => 1,
        };

        OrderedDataLoader {
            dataset: Arc::new(dataset),
            batcher: self.batcher,
            batch_size: self.batch_size,
            prefetch,
            shuffle: self.shuffle,
            pool,
        }
    }
}

pub struct OrderedDataLoader<I, O> {
    dataset: SharedDataset<I>,
    batcher: SharedBatcher<I, O>,
    batch_size: usize,
    prefetch: usize,
    shuffle: Option<u64>,
    pool: Option<Arc<ThreadPool>>,
}

impl<I, O> OrderedDataLoader<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn num_batches(&self) -> usize {
        self.num_items().div_ceil(self.batch_size)
    }

    /// Sample indices of every batch of `epoch`, in delivery order.
    pub fn batch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.num_items()).collect();
        if let Some(seed) = self.shuffle {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn iter(&self, epoch: usize) -> BatchIter<I, O> {
        let plan: VecDeque<Vec<usize>> = self.batch_indices(epoch).into();

        BatchIter {
            remaining: plan.len(),
            plan,
            ready: VecDeque::new(),
            pending: None,
            window: self.prefetch,
            dataset: self.dataset.clone(),
            batcher: self.batcher.clone(),
            pool: self.pool.clone(),
        }
    }
}

fn load_batch<I, O>(
    dataset: &dyn Dataset<I>,
    batcher: &(dyn Batcher<I, Result<O>> + Send + Sync),
    indices: &[usize],
) -> Result<O> {
    let items = indices
        .iter()
        .map(|&index| dataset.get(index).ok_or(CrnnError::MissingSample { index }))
        .collect::<Result<Vec<_>>>()?;

    batcher.batch(items)
}

/// Loads a window of batches in parallel. The output follows the order of
/// `jobs`.
fn load_window<I: Send, O: Send>(
    dataset: &SharedDataset<I>,
    batcher: &SharedBatcher<I, O>,
    jobs: &[Vec<usize>],
) -> Vec<Result<O>> {
    jobs.par_iter()
        .map(|indices| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                load_batch(dataset.as_ref(), batcher.as_ref(), indices)
            }))
            .unwrap_or_else(|_| {
                Err(CrnnError::Worker(format!(
                    "panicked while loading samples {indices:?}"
                )))
            })
        })
        .collect()
}

/// Batches of one epoch, in the order fixed for that epoch.
pub struct BatchIter<I, O> {
    plan: VecDeque<Vec<usize>>,
    remaining: usize,
    ready: VecDeque<Result<O>>,
    pending: Option<Receiver<Vec<Result<O>>>>,
    window: usize,
    dataset: SharedDataset<I>,
    batcher: SharedBatcher<I, O>,
    pool: Option<Arc<ThreadPool>>,
}

impl<I, O> BatchIter<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn next_jobs(&mut self) -> Vec<Vec<usize>> {
        let size = self.window.min(self.plan.len());
        self.plan.drain(..size).collect()
    }

    /// Starts loading the next window on the pool.
    fn prefetch(&mut self, pool: &ThreadPool) {
        let jobs = self.next_jobs();
        if jobs.is_empty() {
            return;
        }

        let (sender, receiver) = mpsc::sync_channel(1);
        let dataset = self.dataset.clone();
        let batcher = self.batcher.clone();
        pool.spawn(move || {
            // the receiver is gone when the epoch was abandoned
            let _ = sender.send(load_window(&dataset, &batcher, &jobs));
        });
        self.pending = Some(receiver);
    }
}

impl<I, O> Iterator for BatchIter<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Item = Result<O>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let Some(pool) = self.pool.clone() else {
            let indices = self.plan.pop_front()?;
            self.remaining -= 1;
            return Some(load_batch(
                self.dataset.as_ref(),
                self.batcher.as_ref(),
                &indices,
            ));
        };

        if self.ready.is_empty() {
            let window = match self.pending.take() {
                Some(pending) => pending.recv().map_err(|_| {
                    CrnnError::Worker("loader thread stopped before delivering".to_string())
                }),
                None => {
                    let jobs = self.next_jobs();
                    Ok(pool.install(|| load_window(&self.dataset, &self.batcher, &jobs)))
                }
            };

            match window {
                Ok(window) => self.ready = window.into(),
                Err(err) => {
                    self.remaining = 0;
                    return Some(Err(err));
                }
            }
        }

        if self.pending.is_none() {
            self.prefetch(&pool);
        }

        let batch = self.ready.pop_front()?;
        self.remaining -= 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use burn::data::dataset::InMemDataset;

    use super::*;

    struct CollectBatcher;

    impl Batcher<usize, Result<Vec<usize>>> for CollectBatcher {
        fn batch(&self, items: Vec<usize>) -> Result<Vec<usize>> {
            // uneven work so that workers finish out of order
            if let Some(&first) = items.first() {
                thread::sleep(Duration::from_millis((first % 3) as u64 * 2));
            }
            Ok(items)
        }
    }

    struct Holey(usize);

    impl Dataset<usize> for Holey {
        fn get(&self, index: usize) -> Option<usize> {
            (index != 5 && index < self.0).then_some(index)
        }

        fn len(&self) -> usize {
            self.0
        }
    }

    fn loader(num_workers: usize, shuffle: Option<u64>) -> OrderedDataLoader<usize, Vec<usize>> {
        let builder = OrderedDataLoaderBuilder::new(CollectBatcher)
            .batch_size(3)
            .num_workers(num_workers);
        let builder = match shuffle {
            Some(seed) => builder.shuffle(seed),
            None => builder,
        };

        builder.build(InMemDataset::new((0..20).collect::<Vec<usize>>()))
    }

    fn collect(loader: &OrderedDataLoader<usize, Vec<usize>>, epoch: usize) -> Vec<Vec<usize>> {
        loader.iter(epoch).map(|batch| batch.unwrap()).collect()
    }

    #[test]
    fn test_sequential_order() {
        let batches = collect(&loader(0, None), 0);

        assert_eq!(batches.len(), 7);
        assert_eq!(batches[0], vec![0, 1, 2]);
        assert_eq!(batches[6], vec![18, 19]);
    }

    #[test]
    fn test_workers_keep_order() {
        let sequential = collect(&loader(0, Some(7)), 1);
        let parallel = collect(&loader(4, Some(7)), 1);

        assert_eq!(sequential, parallel);
        assert_eq!(loader(4, Some(7)).batch_indices(1), sequential);
    }

    #[test]
    fn test_shuffle_is_fixed_per_epoch() {
        let loader = loader(2, Some(42));

        assert_eq!(collect(&loader, 0), collect(&loader, 0));
        assert_ne!(collect(&loader, 0), collect(&loader, 1));

        let mut seen: Vec<usize> = collect(&loader, 3).into_iter().flatten().collect();
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_sample_is_an_error() {
        for num_workers in [0, 3] {
            let loader = OrderedDataLoaderBuilder::new(CollectBatcher)
                .batch_size(4)
                .num_workers(num_workers)
                .build(Holey(8));

            let batches: Vec<_> = loader.iter(0).collect();
            assert_eq!(batches.len(), 2);
            assert!(batches[0].is_ok());
            assert!(matches!(
                batches[1],
                Err(CrnnError::MissingSample { index: 5 })
            ));
        }
    }

    #[test]
    fn test_abandoned_epoch() {
        let loader = loader(3, None);
        let mut iter = loader.iter(0);
        assert_eq!(iter.next().unwrap().unwrap(), vec![0, 1, 2]);
        assert_eq!(iter.size_hint(), (6, Some(6)));
        drop(iter);

        // the pool is still usable for the next epoch
        assert_eq!(collect(&loader, 1).len(), loader.num_batches());
    }

    #[test]
    fn test_window_larger_than_epoch() {
        let loader = OrderedDataLoaderBuilder::new(CollectBatcher)
            .batch_size(3)
            .num_workers(2)
            .prefetch(16)
            .build(InMemDataset::new((0..20).collect::<Vec<usize>>()));

        assert_eq!(collect(&loader, 0), loader.batch_indices(0));
    }
}
