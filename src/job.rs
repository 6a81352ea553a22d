// src/job.rs
//
// The unit of work passed through the queues, the shared counters that tie a
// wildcard parent to its sub-jobs, and the per-job outcome reporting.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::JobError;
use crate::object_url::ObjectUrl;
use crate::op::Operation;
use crate::options::OptionList;
use crate::output::OutputLog;

/// Indentation for sub-job result rows.
const SUB_INDENT: &str = "                    ";

/// Counter with an awaitable zero-crossing.
#[derive(Debug)]
pub struct WaitCounter {
    count: AtomicU64,
    zero: Notify,
}

impl WaitCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            count: AtomicU64::new(initial),
            zero: Notify::new(),
        }
    }

    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.zero.notify_waiters();
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once the counter reaches zero. Registration happens before
    /// the load, so a concurrent `done` cannot be missed.
    pub async fn wait_zero(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Success/fail/acceptable tallies shared between a batch parent and its
/// sub-jobs. Each sub-job bumps exactly one of these when it reports.
#[derive(Debug, Default)]
pub struct JobStats {
    success: AtomicU32,
    fails: AtomicU32,
    acceptable: AtomicU32,
}

impl JobStats {
    pub fn success(&self) -> u32 {
        self.success.load(Ordering::SeqCst)
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::SeqCst)
    }

    pub fn acceptable(&self) -> u32 {
        self.acceptable.load(Ordering::SeqCst)
    }
}

/// Per-wildcard-parent completion tracking. The wait counter starts at one:
/// the enumerator holds that guard until the listing stream ends, so the
/// parent cannot observe a zero-crossing while emissions are still possible.
#[derive(Debug)]
pub struct BatchStats {
    waiter: WaitCounter,
    success: AtomicU64,
    emitted: AtomicU64,
}

impl BatchStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waiter: WaitCounter::new(1),
            success: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        })
    }

    /// Account for one emitted sub-job. Called synchronously with the
    /// submission to the sub-job channel.
    pub fn emitted(&self) {
        self.emitted.fetch_add(1, Ordering::SeqCst);
        self.waiter.add(1);
    }

    /// Drop the enumerator's guard once the listing is complete.
    pub fn producer_done(&self) {
        self.waiter.done();
    }

    /// A sub-job finished. Must be called exactly once per emitted sub-job.
    pub fn child_done(&self, success: bool) {
        if success {
            self.success.fetch_add(1, Ordering::SeqCst);
        }
        self.waiter.done();
    }

    pub async fn wait_zero(&self) {
        self.waiter.wait_zero().await;
    }

    pub fn success_count(&self) -> u64 {
        self.success.load(Ordering::SeqCst)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::SeqCst)
    }
}

pub struct Job {
    pub(crate) source_desc: String,
    pub(crate) command: String,
    pub(crate) operation: Operation,
    pub(crate) src: Vec<ObjectUrl>,
    pub(crate) dst: Option<ObjectUrl>,
    pub(crate) opts: OptionList,
    pub(crate) raw_arg: Option<String>,
    pub(crate) success_job: Option<Box<Job>>,
    pub(crate) fail_job: Option<Box<Job>>,
    pub(crate) is_sub_job: bool,
    pub(crate) stats: Option<Arc<JobStats>>,
    pub(crate) parent: Option<Arc<BatchStats>>,
}

impl Job {
    pub fn new(
        source_desc: impl Into<String>,
        command: impl Into<String>,
        operation: Operation,
        src: Vec<ObjectUrl>,
        dst: Option<ObjectUrl>,
        opts: OptionList,
    ) -> Job {
        let stats = operation.is_batch().then(|| Arc::new(JobStats::default()));
        Job {
            source_desc: source_desc.into(),
            command: command.into(),
            operation,
            src,
            dst,
            opts,
            raw_arg: None,
            success_job: None,
            fail_job: None,
            is_sub_job: false,
            stats,
            parent: None,
        }
    }

    pub fn with_raw_arg(mut self, raw: impl Into<String>) -> Job {
        self.raw_arg = Some(raw.into());
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn src(&self) -> &[ObjectUrl] {
        &self.src
    }

    pub fn dst(&self) -> Option<&ObjectUrl> {
        self.dst.as_ref()
    }

    pub fn opts(&self) -> &OptionList {
        &self.opts
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Literal argument carried by shell and exit jobs.
    pub fn raw_arg(&self) -> Option<&str> {
        self.raw_arg.as_deref()
    }

    /// The raw command text this job was parsed from.
    pub fn source_desc(&self) -> &str {
        &self.source_desc
    }

    /// Create a sub-job linked to this batch job: the outcome tallies are
    /// aliased, the raw source description is carried over.
    pub fn make_sub_job(
        &self,
        command: impl Into<String>,
        operation: Operation,
        src: Vec<ObjectUrl>,
        dst: Option<ObjectUrl>,
        opts: OptionList,
    ) -> Job {
        Job {
            source_desc: self.source_desc.clone(),
            command: command.into(),
            operation,
            src,
            dst,
            opts,
            raw_arg: None,
            success_job: None,
            fail_job: None,
            is_sub_job: true,
            stats: self.stats.clone(),
            parent: None,
        }
    }

    /// Inform the issuing parent, if any, of this job's outcome.
    pub fn notify(&self, success: bool) {
        if let Some(parent) = &self.parent {
            parent.child_done(success);
        }
    }

    /// Write the one-line outcome and update the shared tallies. Called
    /// exactly once per job by the worker that ran it. Internal operations
    /// stay silent.
    pub fn report(&self, out: &OutputLog, result: &Result<(), JobError>) {
        if self.operation.is_internal() {
            return;
        }

        if self.is_sub_job {
            match result {
                Ok(()) => {
                    if let Some(stats) = &self.stats {
                        stats.success.fetch_add(1, Ordering::SeqCst);
                    }
                    out.line(format!("{SUB_INDENT}+OK \"{self}\""));
                }
                Err(e) if e.is_acceptable() => {
                    if let Some(stats) = &self.stats {
                        stats.acceptable.fetch_add(1, Ordering::SeqCst);
                    }
                    out.line(format!("{SUB_INDENT}+OK? \"{self}\": {e}"));
                }
                Err(e) => {
                    if let Some(stats) = &self.stats {
                        stats.fails.fetch_add(1, Ordering::SeqCst);
                    }
                    out.line(format!("{SUB_INDENT}-ERR \"{self}\": {e}"));
                }
            }
            return;
        }

        match result {
            Ok(()) => self.print_ok(out),
            Err(e) if e.is_acceptable() => out.line(format!("+OK? \"{self}\": {e}")),
            Err(e) => out.line(format!("-ERR \"{self}\": {e}")),
        }
    }

    fn print_ok(&self, out: &OutputLog) {
        let Some(stats) = &self.stats else {
            out.line(format!("+OK \"{self}\""));
            return;
        };

        let acceptable = stats.acceptable();
        let fails = stats.fails();
        let total = stats.success() + acceptable;
        let ok = if acceptable > 0 { "OK?" } else { "OK" };

        let line = if total > 0 {
            if fails > 0 {
                format!("+{ok} \"{self}\" ({total}, {fails} failed)")
            } else {
                format!("+{ok} \"{self}\" ({total})")
            }
        } else if fails > 0 {
            format!("+{ok} \"{self}\" ({fails} failed)")
        } else {
            format!("+{ok} \"{self}\"")
        };
        out.line(line);
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for url in &self.src {
            write!(f, " {url}")?;
        }
        if let Some(dst) = &self.dst {
            write!(f, " {dst}")?;
        }
        if let Some(raw) = &self.raw_arg {
            write!(f, " {raw}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(operation: Operation) -> Job {
        Job::new(
            "cp src dst",
            "cp",
            operation,
            vec![ObjectUrl::local("src")],
            Some(ObjectUrl::local("dst")),
            OptionList::new(),
        )
    }

    #[test]
    fn display_joins_command_and_args() {
        assert_eq!(job(Operation::LocalCopy).to_string(), "cp src dst");
    }

    #[test]
    fn batch_jobs_carry_stats() {
        assert!(job(Operation::BatchCopy).stats.is_some());
        assert!(job(Operation::Copy).stats.is_none());
    }

    #[tokio::test]
    async fn sub_job_outcomes_bump_exactly_one_counter() {
        let parent = job(Operation::BatchLocalDelete);
        let out = OutputLog::new();
        let stats = parent.stats.clone().unwrap();

        let sub = parent.make_sub_job(
            "rm",
            Operation::LocalDelete,
            vec![ObjectUrl::local("a")],
            None,
            OptionList::new(),
        );
        assert!(sub.is_sub_job);

        sub.report(&out, &Ok(()));
        sub.report(&out, &Err(JobError::Precondition("exists".into())));
        sub.report(&out, &Err(JobError::NotFound("a".into())));

        assert_eq!(stats.success(), 1);
        assert_eq!(stats.acceptable(), 1);
        assert_eq!(stats.fails(), 1);
    }

    #[tokio::test]
    async fn batch_stats_zero_crossing_waits_for_producer_guard() {
        let stats = BatchStats::new();
        stats.emitted();
        stats.child_done(true);
        // The producer guard is still held: the counter must not be zero.
        assert_ne!(stats.total_emitted(), 0);
        stats.producer_done();
        stats.wait_zero().await;
        assert_eq!(stats.success_count(), 1);
        assert_eq!(stats.total_emitted(), 1);
    }

    #[tokio::test]
    async fn wait_counter_releases_at_zero() {
        let counter = Arc::new(WaitCounter::new(0));
        counter.add(2);
        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_zero().await })
        };
        counter.done();
        counter.done();
        waiter.await.unwrap();
        assert_eq!(counter.count(), 0);
    }
}
