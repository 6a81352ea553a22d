// src/constants.rs
//
// Centralized tunables so the engine and the CLI agree on defaults.

/// Default number of worker tasks consuming the job queues.
pub const DEFAULT_WORKER_COUNT: usize = 256;

/// Per-channel capacity is this factor times the worker count.
pub const JOB_QUEUE_FACTOR: usize = 10;

/// Maximum keys per multi-object delete round trip (S3 hard limit).
pub const DELETE_BATCH_SIZE: usize = 1_000;

/// Default retry budget handed to the S3 client.
pub const DEFAULT_RETRY_COUNT: u32 = 10;

/// Default upload part size in MiB (`-p`).
pub const DEFAULT_PART_SIZE_MB: usize = 16;

/// AWS minimum multipart part size (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Uploads at or above this size switch to multipart.
pub const MULTIPART_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Downloads at or above this size are split into ranged parallel GETs.
pub const RANGED_GET_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Default number of concurrent ranged GETs per download (`-cc`).
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 5;

/// In-flight part uploads per multipart upload.
pub const UPLOAD_CONCURRENCY: usize = 16;

/// Region fallback when neither the environment nor the flags name one.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Capacity of the per-listing item channel.
pub const LIST_CHANNEL_CAPACITY: usize = 1_000;

/// Timestamp format for listing rows.
pub const DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
