use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use clmbr_model::Batch;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::{BatchStore, Split};
use crate::TrainingError;

/// One scheduled training step. `batch` is `None` when the batch carries no valid label slots.
#[derive(Debug)]
pub struct StreamItem {
    pub step: usize,
    pub batch: Option<Batch>,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to load train batch {index} for step {step}: {message}")]
    Load {
        step: usize,
        index: usize,
        message: String,
    },
    #[error("batch worker {0} exited before the schedule finished")]
    Disconnected(usize),
}

impl From<StreamError> for TrainingError {
    fn from(value: StreamError) -> Self {
        TrainingError::runtime(value.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub seed: u64,
    pub n_epochs: usize,
    pub num_threads: usize,
    pub prefetch_depth: usize,
}

type Delivery = (usize, std::result::Result<Batch, StreamError>);

/// Prefetching iterator over `n_epochs` shuffled passes of the train split.
///
/// Worker `w` of `n` loads steps `w, w + n, ...` into its own bounded channel; reading the
/// channels round-robin yields steps in order.
pub struct BatchStream {
    receivers: Vec<Receiver<Delivery>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    next_step: usize,
    total_steps: usize,
}

impl BatchStream {
    pub fn spawn(store: Arc<dyn BatchStore>, options: StreamOptions) -> Result<Self, TrainingError> {
        let num_batches = store.batch_count(Split::Train);
        let total_steps = num_batches * options.n_epochs;
        let num_threads = options.num_threads.max(1);
        let stop = Arc::new(AtomicBool::new(false));

        let mut receivers = Vec::with_capacity(num_threads);
        let mut workers = Vec::with_capacity(num_threads);
        for worker in 0..num_threads {
            let (sender, receiver) = mpsc::sync_channel(options.prefetch_depth.max(1));
            let schedule = Schedule {
                seed: options.seed,
                num_batches,
                epoch: None,
                order: Vec::new(),
            };
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("batch-loader-{worker}"))
                .spawn(move || {
                    run_worker(worker, num_threads, total_steps, schedule, store, sender, stop)
                })
                .map_err(|err| {
                    TrainingError::initialization(format!("failed to spawn batch worker: {err}"))
                })?;
            receivers.push(receiver);
            workers.push(handle);
        }

        Ok(Self {
            receivers,
            workers,
            stop,
            next_step: 0,
            total_steps,
        })
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

impl Iterator for BatchStream {
    type Item = std::result::Result<StreamItem, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_step >= self.total_steps {
            return None;
        }
        let worker = self.next_step % self.receivers.len();
        let item = match self.receivers[worker].recv() {
            Ok((step, Ok(batch))) => Ok(StreamItem {
                step,
                batch: if batch.is_empty() { None } else { Some(batch) },
            }),
            Ok((_, Err(err))) => Err(err),
            Err(_) => Err(StreamError::Disconnected(worker)),
        };
        if item.is_err() {
            self.next_step = self.total_steps;
        } else {
            self.next_step += 1;
        }
        Some(item)
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Closing the receivers unblocks workers waiting on a full channel.
        self.receivers.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Lazily materialized per-epoch permutation of train batch indices.
struct Schedule {
    seed: u64,
    num_batches: usize,
    epoch: Option<usize>,
    order: Vec<usize>,
}

impl Schedule {
    fn index_for(&mut self, step: usize) -> usize {
        let epoch = step / self.num_batches;
        if self.epoch != Some(epoch) {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_mul(100).wrapping_add(epoch as u64));
            self.order = (0..self.num_batches).collect();
            self.order.shuffle(&mut rng);
            self.epoch = Some(epoch);
        }
        self.order[step % self.num_batches]
    }
}

fn run_worker(
    worker: usize,
    stride: usize,
    total_steps: usize,
    mut schedule: Schedule,
    store: Arc<dyn BatchStore>,
    sender: SyncSender<Delivery>,
    stop: Arc<AtomicBool>,
) {
    for step in (worker..total_steps).step_by(stride) {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        let index = schedule.index_for(step);
        let result = store
            .batch(Split::Train, index)
            .map_err(|err| StreamError::Load {
                step,
                index,
                message: err.to_string(),
            });
        let failed = result.is_err();
        if sender.send((step, result)).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchInfo, BatchTask, BatchTransformerInfo, InMemoryBatchStore};
    use clmbr_model::{TaskLabels, TransformerBatch};

    fn batch(pid: i64, num_indices: usize) -> Batch {
        Batch {
            num_indices,
            patient_ids: vec![pid],
            offsets: vec![0],
            transformer: TransformerBatch {
                length: 1,
                tokens: vec![1],
                ages: vec![0.0],
                integer_ages: vec![0],
                valid_tokens: vec![true],
                label_indices: vec![0],
                hierarchical_tokens: vec![],
                hierarchical_weights: vec![],
                token_offsets: vec![],
            },
            task: TaskLabels::Clmbr { labels: vec![0] },
        }
    }

    fn store(batches: Vec<Batch>) -> Arc<dyn BatchStore> {
        let info = BatchInfo {
            seed: 1,
            task: BatchTask::Clmbr { vocab_size: 2 },
            transformer: BatchTransformerInfo {
                vocab_size: 2,
                is_hierarchical: false,
                note_embedding_data: None,
            },
        };
        Arc::new(InMemoryBatchStore::new(info).with_split(Split::Train, batches))
    }

    fn options(num_threads: usize) -> StreamOptions {
        StreamOptions {
            seed: 9,
            n_epochs: 3,
            num_threads,
            prefetch_depth: 2,
        }
    }

    #[test]
    fn every_epoch_visits_every_batch_in_step_order() {
        let batches = (0..5).map(|pid| batch(pid, 1)).collect();
        let stream = BatchStream::spawn(store(batches), options(3)).unwrap();
        assert_eq!(stream.total_steps(), 15);

        let items: Vec<StreamItem> = stream.map(|item| item.unwrap()).collect();
        assert_eq!(items.len(), 15);
        for (expected, item) in items.iter().enumerate() {
            assert_eq!(item.step, expected);
        }
        for epoch in items.chunks(5) {
            let mut pids: Vec<i64> = epoch
                .iter()
                .map(|item| item.batch.as_ref().unwrap().patient_ids[0])
                .collect();
            pids.sort();
            assert_eq!(pids, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn delivery_order_does_not_depend_on_thread_count() {
        let batches: Vec<Batch> = (0..7).map(|pid| batch(pid, 1)).collect();
        let collect = |threads| -> Vec<i64> {
            BatchStream::spawn(store(batches.clone()), options(threads))
                .unwrap()
                .map(|item| item.unwrap().batch.unwrap().patient_ids[0])
                .collect()
        };
        assert_eq!(collect(1), collect(4));
    }

    #[test]
    fn empty_batches_become_none() {
        let stream = BatchStream::spawn(store(vec![batch(0, 0)]), options(1)).unwrap();
        let items: Vec<StreamItem> = stream.map(|item| item.unwrap()).collect();
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.batch.is_none()));
    }

    #[test]
    fn dropping_mid_stream_joins_workers() {
        let batches = (0..20).map(|pid| batch(pid, 1)).collect();
        let mut stream = BatchStream::spawn(store(batches), options(2)).unwrap();
        assert!(stream.next().is_some());
        drop(stream);
    }
}
