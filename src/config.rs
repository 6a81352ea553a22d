// src/config.rs
//
// Engine configuration threaded through the worker context. The two
// runtime-settable cells (abort-on-error, exit code) live here too so the
// engine has no process-wide singletons.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::constants::{
    DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_PART_SIZE_MB, DEFAULT_RETRY_COUNT, DEFAULT_WORKER_COUNT,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker tasks (>= 1).
    pub worker_count: usize,
    /// Retry budget for remote calls (>= 0).
    pub retry_count: u32,
    /// Upload part size in bytes (> 0).
    pub part_size: usize,
    /// Concurrent ranged GETs per large download (>= 1).
    pub download_concurrency: usize,
    /// Endpoint override for S3-compatible stores.
    pub endpoint_url: Option<String>,
    /// Region override.
    pub region: Option<String>,
    /// Skip TLS certificate verification (see DESIGN.md).
    pub no_verify_ssl: bool,
    /// Verbose diagnostics.
    pub verbose: bool,

    abort_on_error: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            retry_count: DEFAULT_RETRY_COUNT,
            part_size: DEFAULT_PART_SIZE_MB * 1024 * 1024,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            endpoint_url: None,
            region: None,
            no_verify_ssl: false,
            verbose: false,
            abort_on_error: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(AtomicI32::new(-1)),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker count must be at least 1");
        }
        if self.part_size == 0 {
            bail!("upload part size must be positive");
        }
        if self.download_concurrency == 0 {
            bail!("download concurrency must be at least 1");
        }
        Ok(())
    }

    /// Arm the abort-on-error behavior: any later hard failure cancels the run.
    pub fn set_abort_on_error(&self) {
        self.abort_on_error.store(true, Ordering::SeqCst);
    }

    pub fn abort_on_error(&self) -> bool {
        self.abort_on_error.load(Ordering::SeqCst)
    }

    /// Record an explicit exit code requested by an `exit N` command.
    /// The first writer wins.
    pub fn request_exit(&self, code: i32) {
        let _ = self
            .exit_code
            .compare_exchange(-1, code, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The explicitly requested exit code, if any.
    pub fn requested_exit(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::SeqCst) {
            -1 => None,
            n => Some(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_workers() {
        let cfg = Config {
            worker_count: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn exit_code_first_writer_wins() {
        let cfg = Config::default();
        assert_eq!(cfg.requested_exit(), None);
        cfg.request_exit(3);
        cfg.request_exit(7);
        assert_eq!(cfg.requested_exit(), Some(3));
    }
}
