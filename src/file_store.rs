// src/file_store.rs
//
// Local filesystem backend behind the same Storage trait the S3 backend
// implements. The lister walks with an explicit directory stack and filters
// against the URL's compiled matcher, mirroring the remote prefix+matcher
// listing semantics.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::LIST_CHANNEL_CAPACITY;
use crate::error::{JobError, JobResult};
use crate::object_url::ObjectUrl;
use crate::storage::{Bucket, Item, ItemReceiver, Storage, StorageClass};

#[derive(Debug, Default, Clone)]
pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        Self
    }
}

fn map_io(err: std::io::Error, what: &str) -> JobError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JobError::NotFound(what.to_owned())
    } else {
        JobError::Other(anyhow::Error::new(err).context(what.to_owned()))
    }
}

async fn item_for(path: &Path) -> JobResult<Item> {
    let display = path.to_string_lossy().into_owned();
    let meta = fs::metadata(path)
        .await
        .map_err(|e| map_io(e, &display))?;
    let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
    let url = ObjectUrl::local(path);
    Ok(Item {
        key: url.base(),
        size: meta.len(),
        mtime,
        etag: None,
        storage_class: None,
        is_directory: meta.is_dir(),
        url,
    })
}

/// Directory the walk starts from: the non-wildcard prefix, trimmed back to
/// a directory when it ends mid-component.
fn walk_root(url: &ObjectUrl) -> PathBuf {
    let prefix = url.prefix();
    if !url.is_wildcard() {
        return PathBuf::from(prefix);
    }
    if prefix.ends_with('/') || prefix.ends_with(std::path::MAIN_SEPARATOR) {
        PathBuf::from(prefix)
    } else {
        Path::new(prefix)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

async fn run_lister(
    ctx: CancellationToken,
    url: ObjectUrl,
    tx: async_channel::Sender<JobResult<Item>>,
) {
    let emit = |res: JobResult<Item>| {
        let tx = tx.clone();
        let ctx = ctx.clone();
        async move {
            tokio::select! {
                _ = ctx.cancelled() => false,
                sent = tx.send(res) => sent.is_ok(),
            }
        }
    };

    // A non-wildcard URL names a single file or one directory level.
    if !url.is_wildcard() {
        let root = walk_root(&url);
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                let _ = emit(item_for(&root).await).await;
                return;
            }
            Err(e) => {
                let _ = emit(Err(map_io(e, &root.to_string_lossy()))).await;
                return;
            }
        }
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = emit(Err(map_io(e, &root.to_string_lossy()))).await;
                return;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    if !emit(item_for(&entry.path()).await).await {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = emit(Err(map_io(e, &root.to_string_lossy()))).await;
                    return;
                }
            }
        }
    }

    // Wildcard: walk the tree under the prefix, client-side filtering every
    // path against the compiled matcher.
    let mut stack = vec![walk_root(&url)];
    while let Some(dir) = stack.pop() {
        if ctx.is_cancelled() {
            return;
        }
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = emit(Err(map_io(e, &dir.to_string_lossy()))).await;
                return;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        stack.push(path);
                        continue;
                    }
                    let text = path.to_string_lossy();
                    if let Some(key) = url.match_key(&text) {
                        let item = match item_for(&path).await {
                            Ok(mut item) => {
                                item.key = key;
                                Ok(item)
                            }
                            Err(e) => Err(e),
                        };
                        if !emit(item).await {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = emit(Err(map_io(e, &dir.to_string_lossy()))).await;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn list(&self, ctx: &CancellationToken, url: &ObjectUrl) -> ItemReceiver {
        let (tx, rx) = async_channel::bounded(LIST_CHANNEL_CAPACITY);
        let ctx = ctx.clone();
        let url = url.clone();
        tokio::spawn(async move {
            debug!(url = %url, "file lister starting");
            run_lister(ctx, url, tx).await;
        });
        rx
    }

    async fn head(&self, _ctx: &CancellationToken, url: &ObjectUrl) -> JobResult<Item> {
        item_for(url.as_path()).await
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        url: &ObjectUrl,
        to: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> JobResult<u64> {
        let mut file = fs::File::open(url.as_path())
            .await
            .map_err(|e| map_io(e, url.path()))?;
        tokio::select! {
            _ = ctx.cancelled() => Err(JobError::Interrupted),
            copied = tokio::io::copy(&mut file, to) => {
                copied.map_err(|e| map_io(e, url.path()))
            }
        }
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        from: &Path,
        url: &ObjectUrl,
        _class: StorageClass,
    ) -> JobResult<()> {
        copy_file(ctx, from, url.as_path()).await
    }

    async fn copy(
        &self,
        ctx: &CancellationToken,
        src: &ObjectUrl,
        dst: &ObjectUrl,
        _class: StorageClass,
    ) -> JobResult<()> {
        copy_file(ctx, src.as_path(), dst.as_path()).await
    }

    async fn remove(&self, _ctx: &CancellationToken, urls: &[ObjectUrl]) -> JobResult<()> {
        let mut first_err = None;
        for url in urls {
            if let Err(e) = fs::remove_file(url.as_path()).await {
                first_err.get_or_insert(map_io(e, url.path()));
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn list_buckets(&self, _ctx: &CancellationToken, _prefix: &str) -> JobResult<Vec<Bucket>> {
        Err(JobError::Other(anyhow!(
            "bucket listing is not supported on the local filesystem"
        )))
    }
}

async fn copy_file(ctx: &CancellationToken, from: &Path, to: &Path) -> JobResult<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, &parent.to_string_lossy()))?;
        }
    }
    tokio::select! {
        _ = ctx.cancelled() => Err(JobError::Interrupted),
        copied = fs::copy(from, to) => {
            copied
                .map(|_| ())
                .map_err(|e| map_io(e, &from.to_string_lossy()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn touch(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn head_reports_not_found() {
        let store = FileStorage::new();
        let ctx = CancellationToken::new();
        let url = ObjectUrl::local("/definitely/not/here");
        assert!(matches!(
            store.head(&ctx, &url).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wildcard_listing_filters() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.txt", "1");
        touch(dir.path(), "b.txt", "2");
        touch(dir.path(), "c.log", "3");

        let store = FileStorage::new();
        let ctx = CancellationToken::new();
        let pattern = format!("{}/*.txt", dir.path().display());
        let url = ObjectUrl::parse(&pattern).unwrap();

        let rx = store.list(&ctx, &url).await;
        let mut keys = Vec::new();
        while let Ok(item) = rx.recv().await {
            keys.push(item.unwrap().key);
        }
        keys.sort();
        assert_eq!(keys, vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn copy_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = touch(dir.path(), "src.bin", "payload");
        let dst = dir.path().join("deep/nested/dst.bin");

        let store = FileStorage::new();
        let ctx = CancellationToken::new();
        store
            .copy(
                &ctx,
                &ObjectUrl::local(&src),
                &ObjectUrl::local(&dst),
                StorageClass::Standard,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dst).unwrap(), "payload");
    }
}
