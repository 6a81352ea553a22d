// src/stats.rs
//
// Opaque increment-by-kind counter service. Workers feed it one outcome per
// finished job; the binary prints the totals at the end of the run.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::JobError;
use crate::op::StatKind;

#[derive(Debug, Default)]
pub struct Stats {
    s3_ops: AtomicU64,
    file_ops: AtomicU64,
    shell_ops: AtomicU64,
    fails: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, kind: StatKind) {
        let counter = match kind {
            StatKind::S3Op => &self.s3_ops,
            StatKind::FileOp => &self.file_ops,
            StatKind::ShellOp => &self.shell_ops,
            StatKind::Fail => &self.fails,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `kind` when the outcome is success or an acceptable failure,
    /// `Fail` on a hard failure. Interruption counts nothing.
    pub fn increment_if_success(&self, kind: StatKind, result: &Result<(), JobError>) {
        match result {
            Ok(()) => self.increment(kind),
            Err(e) if e.is_acceptable() => self.increment(kind),
            Err(e) if e.is_interrupted() => {}
            Err(_) => self.increment(StatKind::Fail),
        }
    }

    pub fn get(&self, kind: StatKind) -> u64 {
        match kind {
            StatKind::S3Op => self.s3_ops.load(Ordering::Relaxed),
            StatKind::FileOp => self.file_ops.load(Ordering::Relaxed),
            StatKind::ShellOp => self.shell_ops.load(Ordering::Relaxed),
            StatKind::Fail => self.fails.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn outcome_mapping() {
        let st = Stats::new();
        st.increment_if_success(StatKind::FileOp, &Ok(()));
        st.increment_if_success(
            StatKind::FileOp,
            &Err(JobError::Precondition("exists".into())),
        );
        st.increment_if_success(StatKind::S3Op, &Err(JobError::Other(anyhow!("boom"))));
        st.increment_if_success(StatKind::S3Op, &Err(JobError::Interrupted));

        assert_eq!(st.get(StatKind::FileOp), 2);
        assert_eq!(st.get(StatKind::S3Op), 0);
        assert_eq!(st.get(StatKind::Fail), 1);
    }
}
