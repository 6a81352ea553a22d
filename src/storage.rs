// src/storage.rs
//
// Pluggable storage abstraction consumed by the operation handlers. The
// engine never talks wire protocols: it sees listings as a lazy stream of
// items, plus head/get/put/copy/remove primitives that all honor the root
// cancellation token.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::JobResult;
use crate::object_url::ObjectUrl;
use crate::options::{Opt, OptionList};

/// One listed entry. `key` is relative to the listing prefix for display;
/// `url` is the full reference usable in follow-up operations.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: String,
    pub url: ObjectUrl,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    pub is_directory: bool,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

/// Listing stream. The channel closing is the EOF sentinel; a lister that
/// fails mid-stream sends the error as its final message.
pub type ItemReceiver = async_channel::Receiver<JobResult<Item>>;

/// Storage class passed through to the remote backend on put/copy. The core
/// does not interpret it beyond selecting it from the job's options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageClass {
    #[default]
    Standard,
    ReducedRedundancy,
    InfrequentAccess,
}

impl StorageClass {
    pub fn from_opts(opts: &OptionList) -> StorageClass {
        if opts.has(Opt::ReducedRedundancy) {
            StorageClass::ReducedRedundancy
        } else if opts.has(Opt::InfrequentAccess) {
            StorageClass::InfrequentAccess
        } else {
            StorageClass::Standard
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::InfrequentAccess => "STANDARD_IA",
        }
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Start a lazy listing of `url`. Wildcard filtering happens at the
    /// source: only matching items are emitted. The producer stops on EOF,
    /// on the first backend error, or on cancellation.
    async fn list(&self, ctx: &CancellationToken, url: &ObjectUrl) -> ItemReceiver;

    /// Metadata for a single object. Absence is `JobError::NotFound`.
    async fn head(&self, ctx: &CancellationToken, url: &ObjectUrl) -> JobResult<Item>;

    /// Stream the object's bytes into `to`, returning the byte count.
    async fn get(
        &self,
        ctx: &CancellationToken,
        url: &ObjectUrl,
        to: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> JobResult<u64>;

    /// Store the local file `from` at `url` with the given storage class.
    async fn put(
        &self,
        ctx: &CancellationToken,
        from: &Path,
        url: &ObjectUrl,
        class: StorageClass,
    ) -> JobResult<()>;

    /// Backend-side copy.
    async fn copy(
        &self,
        ctx: &CancellationToken,
        src: &ObjectUrl,
        dst: &ObjectUrl,
        class: StorageClass,
    ) -> JobResult<()>;

    /// Delete up to a backend-defined batch of objects in one round trip.
    /// Callers chunk; every URL names the same container.
    async fn remove(&self, ctx: &CancellationToken, urls: &[ObjectUrl]) -> JobResult<()>;

    /// Enumerate top-level containers whose name starts with `prefix`.
    async fn list_buckets(&self, ctx: &CancellationToken, prefix: &str) -> JobResult<Vec<Bucket>>;
}

/// Maps a URL to the backend that serves it. The engine holds one factory;
/// tests substitute their own to script storage behavior.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn storage_for(&self, url: &ObjectUrl) -> JobResult<Arc<dyn Storage>>;

    /// The remote backend, for operations that carry no URL (bucket listing).
    async fn remote_storage(&self) -> JobResult<Arc<dyn Storage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_class_selection() {
        let mut opts = OptionList::new();
        assert_eq!(StorageClass::from_opts(&opts), StorageClass::Standard);
        opts.add(Opt::InfrequentAccess);
        assert_eq!(StorageClass::from_opts(&opts).as_str(), "STANDARD_IA");
    }
}
