// src/lib.rs
//
// Crate root — public re-exports for the CLI and for embedding the engine.

pub mod config;
pub mod constants;
pub mod error;
pub mod file_store;
pub mod handlers;
pub mod job;
pub mod object_url;
pub mod op;
pub mod options;
pub mod output;
pub mod parser;
pub mod s3_store;
pub mod stats;
pub mod storage;
pub mod wildcard;
pub mod worker;

pub use config::Config;
pub use error::{JobError, JobResult};
pub use file_store::FileStorage;
pub use job::{BatchStats, Job, JobStats, WaitCounter};
pub use object_url::{ObjectUrl, Scheme};
pub use op::{Operation, StatKind};
pub use options::{Opt, OptionList};
pub use parser::parse_line;
pub use s3_store::{DefaultFactory, S3Opts, S3Storage};
pub use stats::Stats;
pub use storage::{Bucket, Item, Storage, StorageClass, StorageFactory};
pub use worker::{RunSummary, WorkerContext, WorkerManager};
