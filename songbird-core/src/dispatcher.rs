//! Dispatcher (C6): a fixed-size worker pool scheduling Capture Pipeline
//! jobs with backpressure and dedup (§4.5).
//!
//! Admission is a bounded `tokio::sync::mpsc` channel — that alone gives
//! `submit` its non-blocking `Accepted`/`Busy` contract. Concurrency is
//! capped by a `Semaphore` sized to the worker count; a single loop task
//! acquires a permit *before* dequeuing the next capture id, so the
//! channel only ever holds work that has nowhere to run yet — total
//! queued-plus-in-flight depth is exactly `queue_capacity + workers`, and
//! `submit`'s `Busy` return is a real backpressure signal rather than a
//! race against how fast the loop task gets scheduled. This is the
//! bounded-queue-plus-semaphore admission shape the pack's stream
//! orchestrator uses for its worker pool, generalized here to carry dedup
//! and a per-job deadline on top.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::warn;

use crate::model::{CapturePatch, CaptureStatus};
use crate::pipeline::{self, PipelineContext};
use crate::repository::Repository;

pub const DEFAULT_QUEUE_MULTIPLIER: usize = 8;
pub const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub job_deadline: Duration,
}

impl Default for DispatcherConfig {
    /// Pool size defaults to 2x the available parallelism (§4.5); queue
    /// capacity to 8x the pool size.
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(4);
        Self {
            workers,
            queue_capacity: workers * DEFAULT_QUEUE_MULTIPLIER,
            job_deadline: DEFAULT_JOB_DEADLINE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Busy,
}

pub struct Dispatcher {
    sender: mpsc::Sender<String>,
    queued_or_running: Arc<Mutex<HashSet<String>>>,
    accepting: Arc<AtomicBool>,
    shutdown_signal: Arc<Notify>,
    loop_handle: tokio::task::JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    workers: usize,
    job_deadline: Duration,
}

impl Dispatcher {
    pub fn spawn(config: DispatcherConfig, ctx: PipelineContext) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let queued_or_running = Arc::new(Mutex::new(HashSet::new()));
        let accepting = Arc::new(AtomicBool::new(true));
        let shutdown_signal = Arc::new(Notify::new());
        let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));

        let loop_handle = tokio::spawn(run_loop(
            receiver,
            semaphore.clone(),
            ctx,
            queued_or_running.clone(),
            config.job_deadline,
            shutdown_signal.clone(),
        ));

        Self {
            sender,
            queued_or_running,
            accepting,
            shutdown_signal,
            loop_handle,
            semaphore,
            workers: config.workers.max(1),
            job_deadline: config.job_deadline,
        }
    }

    /// Non-blocking submit (§4.5). Re-submitting a capture id already
    /// queued or in-flight is a no-op that still reports `Accepted` — the
    /// job is, in fact, going to run to completion.
    pub fn submit(&self, capture_id: impl Into<String>) -> SubmitOutcome {
        let capture_id = capture_id.into();
        if !self.accepting.load(Ordering::Acquire) {
            return SubmitOutcome::Busy;
        }

        {
            let mut set = self.queued_or_running.lock();
            if !set.insert(capture_id.clone()) {
                return SubmitOutcome::Accepted;
            }
        }

        match self.sender.try_send(capture_id.clone()) {
            Ok(()) => SubmitOutcome::Accepted,
            Err(_) => {
                self.queued_or_running.lock().remove(&capture_id);
                SubmitOutcome::Busy
            }
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.queued_or_running.lock().len()
    }

    /// Stop accepting new jobs, mark anything still queued `failed:Shutdown`,
    /// then wait up to `job_deadline` for in-flight jobs to wind down on
    /// their own (§5 — "signals in-flight jobs to wind down").
    pub async fn shutdown(self) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown_signal.notify_one();
        let _ = self.loop_handle.await;

        let grace = self.job_deadline + Duration::from_secs(1);
        if tokio::time::timeout(grace, self.semaphore.acquire_many(self.workers as u32))
            .await
            .is_err()
        {
            warn!("dispatcher shutdown grace period elapsed with jobs still in flight");
        }
    }
}

async fn run_loop(
    mut receiver: mpsc::Receiver<String>,
    semaphore: Arc<Semaphore>,
    ctx: PipelineContext,
    queued_or_running: Arc<Mutex<HashSet<String>>>,
    job_deadline: Duration,
    shutdown_signal: Arc<Notify>,
) {
    loop {
        // Acquire a worker slot *before* dequeuing — otherwise the channel
        // drains as fast as items arrive regardless of how many workers are
        // actually free, and `submit`'s `Busy` signal stops meaning anything.
        let permit = tokio::select! {
            biased;
            _ = shutdown_signal.notified() => {
                drain_and_fail(&mut receiver, &ctx, &queued_or_running).await;
                break;
            }
            permit = semaphore.clone().acquire_owned() => {
                permit.expect("dispatcher semaphore is never closed while jobs are submitted")
            }
        };

        tokio::select! {
            biased;
            _ = shutdown_signal.notified() => {
                drop(permit);
                drain_and_fail(&mut receiver, &ctx, &queued_or_running).await;
                break;
            }
            maybe_id = receiver.recv() => {
                match maybe_id {
                    Some(capture_id) => dispatch_job(
                        permit,
                        ctx.clone(),
                        queued_or_running.clone(),
                        capture_id,
                        job_deadline,
                    ),
                    None => {
                        drop(permit);
                        break;
                    }
                }
            }
        }
    }
}

fn dispatch_job(
    permit: tokio::sync::OwnedSemaphorePermit,
    ctx: PipelineContext,
    queued_or_running: Arc<Mutex<HashSet<String>>>,
    capture_id: String,
    job_deadline: Duration,
) {
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(job_deadline, pipeline::run_capture(&ctx, &capture_id)).await;
        if outcome.is_err() {
            warn!(capture_id = %capture_id, "job exceeded its deadline");
            let _ = ctx
                .repository
                .transition_capture(
                    &capture_id,
                    &[
                        CaptureStatus::Pending,
                        CaptureStatus::Classifying,
                        CaptureStatus::Classified,
                        CaptureStatus::Generating,
                    ],
                    CaptureStatus::Failed,
                    CapturePatch::failed("Deadline"),
                )
                .await;
        }

        queued_or_running.lock().remove(&capture_id);
        drop(permit);
    });
}

/// Jobs still sitting in the queue at shutdown never got a chance to run —
/// they are always still `pending`, since `claim` only happens once a
/// worker picks a job up.
async fn drain_and_fail(
    receiver: &mut mpsc::Receiver<String>,
    ctx: &PipelineContext,
    queued_or_running: &Mutex<HashSet<String>>,
) {
    while let Ok(capture_id) = receiver.try_recv() {
        queued_or_running.lock().remove(&capture_id);
        let result = ctx
            .repository
            .transition_capture(
                &capture_id,
                &[CaptureStatus::Pending],
                CaptureStatus::Failed,
                CapturePatch::failed("Shutdown"),
            )
            .await;
        if let Err(err) = result {
            warn!(capture_id = %capture_id, error = %err, "failed to mark queued job shutdown");
        }
    }
}
