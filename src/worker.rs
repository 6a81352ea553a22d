// src/worker.rs
//
// The worker pool and its manager. N long-lived tasks consume two bounded
// MPMC channels; the sub-job channel is drained ahead of the main channel so
// workers holding a blocked wildcard parent can never starve the sub-jobs
// that parent is waiting on.
//
// Quiescence is a positive signal here: every enqueue bumps a pending
// counter, every finished job drops it, and `finish` closes the channels
// only after the zero-crossing. No worker can exit while another worker's
// parent job is still emitting sub-jobs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::constants::JOB_QUEUE_FACTOR;
use crate::error::{JobError, JobResult};
use crate::handlers;
use crate::job::{Job, WaitCounter};
use crate::op::StatKind;
use crate::output::OutputLog;
use crate::parser::parse_line;
use crate::stats::Stats;
use crate::storage::StorageFactory;

/// Per-worker environment threaded into the operation handlers.
#[derive(Clone)]
pub struct WorkerContext {
    pub token: CancellationToken,
    pub config: Config,
    pub sub_tx: async_channel::Sender<Job>,
    pub pending: Arc<WaitCounter>,
    pub storage: Arc<dyn StorageFactory>,
    pub stats: Arc<Stats>,
    pub out: Arc<OutputLog>,
}

pub struct WorkerManager {
    config: Config,
    token: CancellationToken,
    main_tx: async_channel::Sender<Job>,
    sub_tx: async_channel::Sender<Job>,
    pending: Arc<WaitCounter>,
    stats: Arc<Stats>,
    out: Arc<OutputLog>,
    workers: Vec<JoinHandle<()>>,
}

/// What a finished run reports back to the caller.
pub struct RunSummary {
    stats: Arc<Stats>,
    explicit_exit: Option<i32>,
}

impl RunSummary {
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Exit-code policy: an explicit `exit N` wins, any hard failure yields
    /// 127, otherwise 0.
    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.explicit_exit {
            return code;
        }
        if self.stats.get(StatKind::Fail) > 0 {
            127
        } else {
            0
        }
    }
}

impl WorkerManager {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageFactory>,
        token: CancellationToken,
    ) -> WorkerManager {
        let capacity = config.worker_count * JOB_QUEUE_FACTOR;
        let (main_tx, main_rx) = async_channel::bounded::<Job>(capacity);
        let (sub_tx, sub_rx) = async_channel::bounded::<Job>(capacity);
        let pending = Arc::new(WaitCounter::new(0));
        let stats = Arc::new(Stats::new());
        let out = Arc::new(OutputLog::new());

        let ctx = WorkerContext {
            token: token.clone(),
            config: config.clone(),
            sub_tx: sub_tx.clone(),
            pending: pending.clone(),
            storage,
            stats: stats.clone(),
            out: out.clone(),
        };

        let workers = (0..config.worker_count)
            .map(|id| {
                let ctx = ctx.clone();
                let main_rx = main_rx.clone();
                let sub_rx = sub_rx.clone();
                tokio::spawn(worker_loop(id, ctx, main_rx, sub_rx))
            })
            .collect();

        WorkerManager {
            config,
            token,
            main_tx,
            sub_tx,
            pending,
            stats,
            out,
            workers,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Read commands from `file`, one job per line, and run them all.
    pub async fn run(self, file: &Path) -> Result<RunSummary> {
        let f = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("cannot open command file {}", file.display()))?;
        let mut lines = tokio::io::BufReader::new(f).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .context("reading command file failed")?
        {
            if !self.feed(&line).await {
                break;
            }
        }
        self.finish().await
    }

    /// Single-shot mode: run one command line to completion.
    pub async fn run_cmd(self, line: &str) -> Result<RunSummary> {
        self.feed(line).await;
        self.finish().await
    }

    /// Parse and enqueue one line. Returns false once the run is cancelled
    /// and the feed should stop.
    async fn feed(&self, line: &str) -> bool {
        match parse_line(line) {
            Ok(Some(job)) => self.enqueue(job).await.is_ok(),
            Ok(None) => true,
            Err(err) => {
                self.report_parse_error(&err);
                !self.token.is_cancelled()
            }
        }
    }

    async fn enqueue(&self, job: Job) -> JobResult<()> {
        self.pending.add(1);
        tokio::select! {
            _ = self.token.cancelled() => {
                self.pending.done();
                Err(JobError::Interrupted)
            }
            sent = self.main_tx.send(job) => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.pending.done();
                    Err(JobError::Interrupted)
                }
            },
        }
    }

    fn report_parse_error(&self, err: &JobError) {
        match err {
            JobError::Parse { line, msg } => {
                self.out.line(format!("-ERR \"{line}\": {msg}"));
            }
            other => self.out.line(format!("-ERR {other}")),
        }
        self.stats.increment(StatKind::Fail);
    }

    /// Wait for quiescence, then tear the pool down in order: cancel, close
    /// both channels, join the workers, flush the output writer.
    async fn finish(self) -> Result<RunSummary> {
        tokio::select! {
            _ = self.pending.wait_zero() => {}
            _ = self.token.cancelled() => {}
        }

        self.token.cancel();
        self.main_tx.close();
        self.sub_tx.close();
        for worker in self.workers {
            let _ = worker.await;
        }
        self.out.close().await;

        Ok(RunSummary {
            stats: self.stats,
            explicit_exit: self.config.requested_exit(),
        })
    }
}

async fn worker_loop(
    id: usize,
    ctx: WorkerContext,
    main_rx: async_channel::Receiver<Job>,
    sub_rx: async_channel::Receiver<Job>,
) {
    debug!(worker = id, "worker started");
    let mut main_open = true;
    loop {
        // Sub-jobs first: a saturated pool of blocked parents deadlocks if
        // anyone picks up new parent work while sub-jobs are pending.
        if let Ok(job) = sub_rx.try_recv() {
            run_job(&ctx, job).await;
            continue;
        }
        if main_open {
            tokio::select! {
                biased;
                _ = ctx.token.cancelled() => break,
                received = sub_rx.recv() => match received {
                    Ok(job) => run_job(&ctx, job).await,
                    Err(_) => break,
                },
                received = main_rx.recv() => match received {
                    Ok(job) => run_job(&ctx, job).await,
                    Err(_) => main_open = false,
                },
            }
        } else {
            tokio::select! {
                biased;
                _ = ctx.token.cancelled() => break,
                received = sub_rx.recv() => match received {
                    Ok(job) => run_job(&ctx, job).await,
                    Err(_) => break,
                },
            }
        }
    }
    debug!(worker = id, "worker exiting");
}

/// Execute one job and its chained follow-ons, reporting each outcome
/// exactly once.
async fn run_job(ctx: &WorkerContext, job: Job) {
    let mut next = Some(Box::new(job));
    while let Some(mut job) = next {
        let success_chain = job.success_job.take();
        let fail_chain = job.fail_job.take();

        let (kind, result) = handlers::dispatch(&job, ctx).await;
        if let Some(kind) = kind {
            ctx.stats.increment_if_success(kind, &result);
        }
        job.report(&ctx.out, &result);

        let success = match &result {
            Ok(()) => true,
            Err(e) => e.is_acceptable(),
        };
        job.notify(success);

        let hard_fail = matches!(&result, Err(e) if !e.is_acceptable() && !e.is_interrupted());
        if hard_fail && ctx.config.abort_on_error() {
            debug!("hard failure with abort-on-error armed, cancelling");
            ctx.token.cancel();
        }

        // Chain accounting happens before this job's decrement so the
        // pending counter cannot dip to zero with a follow-on outstanding.
        next = if success { success_chain } else { fail_chain };
        if next.is_some() {
            ctx.pending.add(1);
        }
        ctx.pending.done();
    }
}
