// src/s3_store.rs
//
// S3 backend on the async AWS SDK. Listing paginates ListObjectsV2 manually
// and filters against the URL's matcher before emitting; deletes ride the
// 1000-key batch API; large uploads switch to semaphore-bounded multipart;
// large downloads split into ranged GETs assembled in order.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::{
    DEFAULT_REGION, LIST_CHANNEL_CAPACITY, MIN_PART_SIZE, MULTIPART_THRESHOLD,
    RANGED_GET_THRESHOLD, UPLOAD_CONCURRENCY,
};
use crate::error::{JobError, JobResult};
use crate::file_store::FileStorage;
use crate::object_url::ObjectUrl;
use crate::storage::{Bucket, Item, ItemReceiver, Storage, StorageClass, StorageFactory};

#[derive(Debug, Clone)]
pub struct S3Opts {
    pub retry_count: u32,
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub no_verify_ssl: bool,
    pub part_size: usize,
    pub download_concurrency: usize,
}

impl From<&Config> for S3Opts {
    fn from(cfg: &Config) -> Self {
        S3Opts {
            retry_count: cfg.retry_count,
            endpoint_url: cfg.endpoint_url.clone(),
            region: cfg.region.clone(),
            no_verify_ssl: cfg.no_verify_ssl,
            part_size: cfg.part_size,
            download_concurrency: cfg.download_concurrency,
        }
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    opts: S3Opts,
}

/// Race a future against the root token.
async fn cancellable<T>(ctx: &CancellationToken, fut: impl Future<Output = T>) -> JobResult<T> {
    tokio::select! {
        _ = ctx.cancelled() => Err(JobError::Interrupted),
        out = fut => Ok(out),
    }
}

fn aws_time(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl S3Storage {
    pub async fn new(opts: S3Opts) -> Result<S3Storage> {
        if opts.no_verify_ssl {
            // The SDK's HTTP client has no insecure-verification switch;
            // custom trust roots go through AWS_CA_BUNDLE_PATH. See DESIGN.md.
            warn!("--no-verify-ssl accepted but certificate verification stays on");
        }

        let region = RegionProviderChain::first_try(opts.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(region)
            .retry_config(RetryConfig::standard().with_max_attempts(opts.retry_count + 1));
        if let Some(endpoint) = &opts.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if opts.endpoint_url.is_some() {
            builder = builder.force_path_style(true);
        }

        Ok(S3Storage {
            client: Client::from_conf(builder.build()),
            opts,
        })
    }

    async fn get_ranged(
        &self,
        ctx: &CancellationToken,
        url: &ObjectUrl,
        size: u64,
        to: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> JobResult<u64> {
        let part = (self.opts.part_size.max(MIN_PART_SIZE)) as u64;
        let ranges: Vec<(u64, u64)> = (0..size)
            .step_by(part as usize)
            .map(|start| (start, (start + part).min(size) - 1))
            .collect();
        debug!(url = %url, parts = ranges.len(), "ranged download");

        let client = self.client.clone();
        let bucket = url.bucket().to_owned();
        let key = url.path().to_owned();
        let mut chunks = futures::stream::iter(ranges.into_iter().map(move |(start, end)| {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();
            async move {
                let resp = client
                    .get_object()
                    .bucket(&bucket)
                    .key(&key)
                    .range(format!("bytes={start}-{end}"))
                    .send()
                    .await
                    .context("ranged get_object failed")?;
                let data = resp
                    .body
                    .collect()
                    .await
                    .context("collect body failed")?
                    .into_bytes();
                Ok::<Bytes, anyhow::Error>(data)
            }
        }))
        .buffered(self.opts.download_concurrency.max(1));

        let mut written = 0u64;
        loop {
            let next = cancellable(ctx, chunks.next()).await?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            written += chunk.len() as u64;
            to.write_all(&chunk)
                .await
                .context("write to destination failed")
                .map_err(JobError::Other)?;
        }
        Ok(written)
    }

    async fn put_multipart(
        &self,
        ctx: &CancellationToken,
        from: &Path,
        url: &ObjectUrl,
        class: StorageClass,
    ) -> JobResult<()> {
        let create = cancellable(
            ctx,
            self.client
                .create_multipart_upload()
                .bucket(url.bucket())
                .key(url.path())
                .storage_class(aws_sdk_s3::types::StorageClass::from(class.as_str()))
                .send(),
        )
        .await?
        .context("create_multipart_upload failed")?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| anyhow!("create_multipart_upload returned no upload id"))?
            .to_owned();

        match self.upload_parts(ctx, from, url, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                cancellable(
                    ctx,
                    self.client
                        .complete_multipart_upload()
                        .bucket(url.bucket())
                        .key(url.path())
                        .upload_id(&upload_id)
                        .multipart_upload(completed)
                        .send(),
                )
                .await?
                .context("complete_multipart_upload failed")?;
                Ok(())
            }
            Err(e) => {
                // Leave no orphaned upload behind.
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(url.bucket())
                    .key(url.path())
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        ctx: &CancellationToken,
        from: &Path,
        url: &ObjectUrl,
        upload_id: &str,
    ) -> JobResult<Vec<CompletedPart>> {
        let part_size = self.opts.part_size.max(MIN_PART_SIZE);
        let mut file = tokio::fs::File::open(from)
            .await
            .with_context(|| format!("open {} failed", from.display()))
            .map_err(JobError::Other)?;

        let sem = Arc::new(Semaphore::new(UPLOAD_CONCURRENCY));
        let mut tasks: Vec<JoinHandle<Result<CompletedPart>>> = Vec::new();
        let mut part_number = 1i32;

        loop {
            let mut buf = vec![0u8; part_size];
            let mut filled = 0;
            while filled < part_size {
                let n = cancellable(ctx, file.read(&mut buf[filled..]))
                    .await?
                    .context("read upload source failed")
                    .map_err(JobError::Other)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let permit = cancellable(ctx, sem.clone().acquire_owned())
                .await?
                .context("upload semaphore closed")
                .map_err(JobError::Other)?;
            let client = self.client.clone();
            let bucket = url.bucket().to_owned();
            let key = url.path().to_owned();
            let upload_id = upload_id.to_owned();
            let number = part_number;
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let resp = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(number)
                    .body(ByteStream::from(buf))
                    .send()
                    .await
                    .with_context(|| format!("upload_part {number} failed"))?;
                Ok(CompletedPart::builder()
                    .part_number(number)
                    .set_e_tag(resp.e_tag().map(str::to_owned))
                    .build())
            }));

            if filled < part_size {
                break;
            }
            part_number += 1;
        }

        let mut parts = Vec::with_capacity(tasks.len());
        for task in tasks {
            let part = cancellable(ctx, task)
                .await?
                .context("upload task panicked")
                .map_err(JobError::Other)?
                .map_err(JobError::Other)?;
            parts.push(part);
        }
        parts.sort_by_key(|p| p.part_number());
        Ok(parts)
    }
}

async fn run_list(
    client: Client,
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

    let mut continuation: Option<String> = None;
    loop {
        let mut req = client
            .list_objects_v2()
            .bucket(url.bucket())
            .prefix(url.prefix());
        if !url.delimiter().is_empty() {
            req = req.delimiter(url.delimiter());
        }
        if let Some(token) = &continuation {
            req = req.continuation_token(token);
        }

        let resp = tokio::select! {
            _ = ctx.cancelled() => return,
            resp = req.send() => resp,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                debug!("lister finished with error: {e}");
                let _ = emit(Err(JobError::Other(
                    anyhow::Error::new(e).context("list_objects_v2 failed"),
                )))
                .await;
                return;
            }
        };

        for cp in resp.common_prefixes() {
            let Some(prefix) = cp.prefix() else { continue };
            if let Some(key) = url.match_key(prefix) {
                let item = Item {
                    key,
                    url: ObjectUrl::remote_object(url.bucket(), prefix),
                    size: 0,
                    mtime: None,
                    etag: None,
                    storage_class: None,
                    is_directory: true,
                };
                if !emit(Ok(item)).await {
                    return;
                }
            }
        }
        for obj in resp.contents() {
            let Some(k) = obj.key() else { continue };
            if let Some(key) = url.match_key(k) {
                let item = Item {
                    key,
                    url: ObjectUrl::remote_object(url.bucket(), k),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    mtime: obj.last_modified().and_then(aws_time),
                    etag: obj.e_tag().map(str::to_owned),
                    storage_class: obj.storage_class().map(|c| c.as_str().to_owned()),
                    is_directory: k.ends_with('/'),
                };
                if !emit(Ok(item)).await {
                    return;
                }
            }
        }

        match resp.next_continuation_token() {
            Some(token) => continuation = Some(token.to_owned()),
            None => return,
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn list(&self, ctx: &CancellationToken, url: &ObjectUrl) -> ItemReceiver {
        let (tx, rx) = async_channel::bounded(LIST_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let ctx = ctx.clone();
        let url = url.clone();
        tokio::spawn(run_list(client, ctx, url, tx));
        rx
    }

    async fn head(&self, ctx: &CancellationToken, url: &ObjectUrl) -> JobResult<Item> {
        let resp = cancellable(
            ctx,
            self.client
                .head_object()
                .bucket(url.bucket())
                .key(url.path())
                .send(),
        )
        .await?
        .map_err(|e| {
            let not_found = e
                .as_service_error()
                .map(|se| se.is_not_found())
                .unwrap_or(false);
            if not_found {
                JobError::NotFound(url.to_string())
            } else {
                JobError::Other(anyhow::Error::new(e).context("head_object failed"))
            }
        })?;

        Ok(Item {
            key: url.base(),
            url: url.clone(),
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            mtime: resp.last_modified().and_then(aws_time),
            etag: resp.e_tag().map(str::to_owned),
            storage_class: resp.storage_class().map(|c| c.as_str().to_owned()),
            is_directory: false,
        })
    }

    async fn get(
        &self,
        ctx: &CancellationToken,
        url: &ObjectUrl,
        to: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> JobResult<u64> {
        // A HEAD probe decides whether the ranged path pays for itself.
        if self.opts.download_concurrency > 1 {
            match self.head(ctx, url).await {
                Ok(item) if item.size >= RANGED_GET_THRESHOLD => {
                    return self.get_ranged(ctx, url, item.size, to).await;
                }
                Err(e @ JobError::NotFound(_)) => return Err(e),
                _ => {}
            }
        }

        let resp = cancellable(
            ctx,
            self.client
                .get_object()
                .bucket(url.bucket())
                .key(url.path())
                .send(),
        )
        .await?
        .map_err(|e| {
            let not_found = e
                .as_service_error()
                .map(|se| matches!(se, aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)))
                .unwrap_or(false);
            if not_found {
                JobError::NotFound(url.to_string())
            } else {
                JobError::Other(anyhow::Error::new(e).context("get_object failed"))
            }
        })?;

        let mut body = resp.body.into_async_read();
        let copied = cancellable(ctx, tokio::io::copy(&mut body, to))
            .await?
            .context("stream body failed")
            .map_err(JobError::Other)?;
        Ok(copied)
    }

    async fn put(
        &self,
        ctx: &CancellationToken,
        from: &Path,
        url: &ObjectUrl,
        class: StorageClass,
    ) -> JobResult<()> {
        let meta = tokio::fs::metadata(from).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                JobError::NotFound(from.to_string_lossy().into_owned())
            } else {
                JobError::Other(anyhow::Error::new(e))
            }
        })?;

        if meta.len() >= MULTIPART_THRESHOLD {
            return self.put_multipart(ctx, from, url, class).await;
        }

        let body = ByteStream::from_path(from)
            .await
            .with_context(|| format!("open {} failed", from.display()))
            .map_err(JobError::Other)?;
        cancellable(
            ctx,
            self.client
                .put_object()
                .bucket(url.bucket())
                .key(url.path())
                .storage_class(aws_sdk_s3::types::StorageClass::from(class.as_str()))
                .body(body)
                .send(),
        )
        .await?
        .context("put_object failed")
        .map_err(JobError::Other)?;
        Ok(())
    }

    async fn copy(
        &self,
        ctx: &CancellationToken,
        src: &ObjectUrl,
        dst: &ObjectUrl,
        class: StorageClass,
    ) -> JobResult<()> {
        cancellable(
            ctx,
            self.client
                .copy_object()
                .bucket(dst.bucket())
                .key(dst.path())
                .copy_source(src.copy_source())
                .storage_class(aws_sdk_s3::types::StorageClass::from(class.as_str()))
                .send(),
        )
        .await?
        .context("copy_object failed")
        .map_err(JobError::Other)?;
        Ok(())
    }

    async fn remove(&self, ctx: &CancellationToken, urls: &[ObjectUrl]) -> JobResult<()> {
        let Some(first) = urls.first() else {
            return Ok(());
        };
        let objects: Vec<ObjectIdentifier> = urls
            .iter()
            .map(|u| {
                ObjectIdentifier::builder()
                    .key(u.path())
                    .build()
                    .map_err(anyhow::Error::from)
            })
            .collect::<Result<_>>()
            .map_err(JobError::Other)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(anyhow::Error::from)
            .map_err(JobError::Other)?;

        let resp = cancellable(
            ctx,
            self.client
                .delete_objects()
                .bucket(first.bucket())
                .delete(delete)
                .send(),
        )
        .await?
        .context("delete_objects failed")
        .map_err(JobError::Other)?;

        let errors = resp.errors();
        if let Some(e) = errors.first() {
            return Err(JobError::Other(anyhow!(
                "{} of {} keys failed, first: {} {}",
                errors.len(),
                urls.len(),
                e.key().unwrap_or("?"),
                e.message().unwrap_or("unknown error"),
            )));
        }
        Ok(())
    }

    async fn list_buckets(&self, ctx: &CancellationToken, prefix: &str) -> JobResult<Vec<Bucket>> {
        let resp = cancellable(ctx, self.client.list_buckets().send())
            .await?
            .context("list_buckets failed")
            .map_err(JobError::Other)?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| {
                let name = b.name()?;
                if !prefix.is_empty() && !name.starts_with(prefix) {
                    return None;
                }
                Some(Bucket {
                    name: name.to_owned(),
                    created: b.creation_date().and_then(aws_time),
                })
            })
            .collect())
    }
}

/// Default backend selection: remote URLs share one lazily-built S3 client,
/// local URLs go to the filesystem backend.
pub struct DefaultFactory {
    opts: S3Opts,
    s3: OnceCell<Arc<S3Storage>>,
    file: Arc<FileStorage>,
}

impl DefaultFactory {
    pub fn new(opts: S3Opts) -> Self {
        Self {
            opts,
            s3: OnceCell::new(),
            file: Arc::new(FileStorage::new()),
        }
    }
}

#[async_trait]
impl StorageFactory for DefaultFactory {
    async fn storage_for(&self, url: &ObjectUrl) -> JobResult<Arc<dyn Storage>> {
        if url.is_remote() {
            self.remote_storage().await
        } else {
            Ok(self.file.clone())
        }
    }

    async fn remote_storage(&self) -> JobResult<Arc<dyn Storage>> {
        let storage = self
            .s3
            .get_or_try_init(|| async { S3Storage::new(self.opts.clone()).await.map(Arc::new) })
            .await
            .map_err(JobError::Other)?;
        Ok(storage.clone() as Arc<dyn Storage>)
    }
}
