use crate::params::TechnicalParams;
use crate::util;
use bus::Bus;
use core_affinity::CoreId;
use itertools::Itertools;
use simple_error::{SimpleError, SimpleResult};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::channel as mpsc_channel;
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

/// A batch of independent items, split between workers in contiguous partitions.
pub trait Job: Send + Sync + 'static {
    fn num_items(&self) -> usize;
}

type WorkFn<J, R> = dyn Fn(&J, usize) -> SimpleResult<R> + Send + Sync;

struct PartitionResult<R> {
    start: usize,
    results: Vec<SimpleResult<R>>,
}

enum Workers<J, R> {
    Inline(Arc<WorkFn<J, R>>),
    Threads {
        broadcast_tx: Option<Bus<Arc<J>>>,
        partition_result_rx: MpscReceiver<PartitionResult<R>>,
        join_handles: Vec<JoinHandle<()>>,
    },
}

/// Fixed set of worker threads, each processing its partition of every job broadcast to it.
/// With a single thread the work runs inline on the caller's thread.
pub struct WorkerPool<J, R> {
    num_threads: usize,
    workers: Workers<J, R>,
}

impl<J: Job, R: Send + 'static> WorkerPool<J, R> {
    pub fn new<F>(technical_params: &TechnicalParams, work_fn: F) -> Self
    where
        F: Fn(&J, usize) -> SimpleResult<R> + Send + Sync + 'static,
    {
        let work_fn: Arc<WorkFn<J, R>> = Arc::new(work_fn);
        let num_threads = get_num_threads(technical_params);

        if num_threads == 1 {
            return Self {
                num_threads,
                workers: Workers::Inline(work_fn),
            };
        }

        let mut broadcast_tx: Bus<Arc<J>> = Bus::new(1);
        let (partition_result_tx, partition_result_rx) = mpsc_channel();
        let mut join_handles = Vec::new();

        for thread_id in 0..num_threads {
            let mut broadcast_rx = broadcast_tx.add_rx();
            let partition_result_tx = partition_result_tx.clone();
            let work_fn = Arc::clone(&work_fn);
            let pin_threads = technical_params.pin_threads;

            join_handles.push(thread::spawn(move || {
                if pin_threads {
                    let core_id = CoreId { id: thread_id };
                    core_affinity::set_for_current(core_id);
                }

                while let Ok(job) = broadcast_rx.recv() {
                    let range = util::get_partition_range(num_threads, thread_id, job.num_items());
                    let start = range.start;
                    let results = range
                        .map(|item_idx| process_item(work_fn.as_ref(), &*job, item_idx))
                        .collect();

                    if partition_result_tx
                        .send(PartitionResult { start, results })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        Self {
            num_threads,
            workers: Workers::Threads {
                broadcast_tx: Some(broadcast_tx),
                partition_result_rx,
                join_handles,
            },
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Processes every item of the job. Results come back in item order; a failing or
    /// panicking item only fails its own entry.
    pub fn run(&mut self, job: J) -> SimpleResult<Vec<SimpleResult<R>>> {
        match &mut self.workers {
            Workers::Inline(work_fn) => Ok((0..job.num_items())
                .map(|item_idx| process_item(work_fn.as_ref(), &job, item_idx))
                .collect()),
            Workers::Threads {
                broadcast_tx,
                partition_result_rx,
                ..
            } => {
                let broadcast_tx = broadcast_tx
                    .as_mut()
                    .ok_or_else(|| SimpleError::new("worker pool is shut down"))?;
                broadcast_tx.broadcast(Arc::new(job));

                let mut partition_results = Vec::with_capacity(self.num_threads);

                for _ in 0..self.num_threads {
                    let partition_result = partition_result_rx
                        .recv()
                        .map_err(|_| SimpleError::new("worker thread terminated unexpectedly"))?;
                    partition_results.push(partition_result);
                }

                Ok(partition_results
                    .into_iter()
                    .sorted_by_key(|partition_result| partition_result.start)
                    .flat_map(|partition_result| partition_result.results)
                    .collect())
            }
        }
    }
}

impl<J, R> Drop for WorkerPool<J, R> {
    fn drop(&mut self) {
        if let Workers::Threads {
            broadcast_tx,
            join_handles,
            ..
        } = &mut self.workers
        {
            drop(broadcast_tx.take()); // signals the worker threads to exit the loop

            join_handles.drain(..).for_each(|join_handle| {
                join_handle.join().ok();
            });
        }
    }
}

fn get_num_threads(technical_params: &TechnicalParams) -> usize {
    technical_params
        .num_threads
        .unwrap_or_else(num_cpus::get)
        .max(1)
}

fn process_item<J, R>(work_fn: &WorkFn<J, R>, job: &J, item_idx: usize) -> SimpleResult<R> {
    panic::catch_unwind(AssertUnwindSafe(|| work_fn(job, item_idx))).unwrap_or_else(|payload| {
        Err(SimpleError::new(format!(
            "item {} panicked: {}",
            item_idx,
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}
