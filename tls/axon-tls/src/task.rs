// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker pool for delegated TLS tasks
//!
//! The event loop never blocks on delegated work: tasks run here and each
//! completion is reported back as the owning stream id, which the host turns
//! into a `SIGNAL(FLUSH_HANDSHAKE)` on that stream. Cancellation is
//! best-effort: a cancelled task is skipped if it has not started, and its
//! completion is still reported so accounting stays balanced.

use crate::{engine::DelegatedTask, stream::id::Id};
use crossbeam_channel::{Receiver, Sender, TryIter};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// Cancels the associated task if it has not started running
#[derive(Clone, Debug)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// A fresh handle; hosts wiring their own executor pair it with a task
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct Job {
    stream_id: Id,
    task: DelegatedTask,
    cancelled: Arc<AtomicBool>,
}

pub struct ThreadPool {
    jobs: Option<Sender<Job>>,
    completions: Receiver<Id>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> io::Result<Self> {
        let (jobs, job_queue) = crossbeam_channel::unbounded::<Job>();
        let (done, completions) = crossbeam_channel::unbounded();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let job_queue = job_queue.clone();
            let done = done.clone();
            let worker = std::thread::Builder::new()
                .name(format!("axon-tls-task-{index}"))
                .spawn(move || {
                    for job in job_queue.iter() {
                        if !job.cancelled.load(Ordering::Relaxed) {
                            job.task.run();
                        }
                        if done.send(job.stream_id).is_err() {
                            break;
                        }
                    }
                })?;
            workers.push(worker);
        }

        Ok(Self {
            jobs: Some(jobs),
            completions,
            workers,
        })
    }

    /// Submits a task owned by `stream_id`
    pub fn schedule(&self, stream_id: Id, task: DelegatedTask) -> CancelHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = CancelHandle {
            cancelled: cancelled.clone(),
        };
        let job = Job {
            stream_id,
            task,
            cancelled,
        };
        if let Some(jobs) = &self.jobs {
            // a send failure means the pool is shutting down; the signal
            // will simply never fire, same as a cancelled task
            let _ = jobs.send(job);
        }
        handle
    }

    /// Drains the stream ids whose tasks completed since the last call
    pub fn completions(&self) -> TryIter<'_, Id> {
        self.completions.try_iter()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
