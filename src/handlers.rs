// src/handlers.rs
//
// One handler per operation tag, dispatched from an exhaustive match: the
// compile-time registry. Handlers consume a job plus the worker context and
// report the stat class of the work they did; they never touch the queues
// except through the wildcard coordinator.

use std::collections::{BTreeMap, HashMap};

use anyhow::anyhow;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::constants::{DATE_FORMAT, DELETE_BATCH_SIZE};
use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::object_url::ObjectUrl;
use crate::op::{Operation, StatKind};
use crate::options::{Opt, OptionList};
use crate::storage::Item;
use crate::wildcard::wild_operation;
use crate::worker::WorkerContext;

/// The tag → handler table.
pub async fn dispatch(job: &Job, wctx: &WorkerContext) -> (Option<StatKind>, JobResult<()>) {
    match job.operation() {
        Operation::Copy => (Some(StatKind::S3Op), run_copy(job, wctx).await),
        Operation::Download => (Some(StatKind::S3Op), run_download(job, wctx).await),
        Operation::Upload => (Some(StatKind::S3Op), run_upload(job, wctx).await),
        Operation::LocalCopy => (Some(StatKind::FileOp), run_local_copy(job, wctx).await),
        Operation::Delete => (Some(StatKind::S3Op), run_delete(job, wctx).await),
        Operation::LocalDelete => (Some(StatKind::FileOp), run_local_delete(job, wctx).await),
        Operation::List => (Some(StatKind::S3Op), run_list(job, wctx).await),
        Operation::ListBuckets => (Some(StatKind::S3Op), run_list_buckets(job, wctx).await),
        Operation::Size => (Some(StatKind::S3Op), run_size(job, wctx).await),
        Operation::Head => (Some(StatKind::S3Op), run_head(job, wctx).await),
        Operation::Cat => (Some(StatKind::S3Op), run_cat(job, wctx).await),
        Operation::BatchDownload => (Some(StatKind::S3Op), run_batch_download(job, wctx).await),
        Operation::BatchCopy => (Some(StatKind::S3Op), run_batch_copy(job, wctx).await),
        Operation::BatchDelete => (Some(StatKind::S3Op), run_batch_delete(job, wctx).await),
        Operation::BatchLocalDelete => {
            (Some(StatKind::FileOp), run_batch_delete(job, wctx).await)
        }
        Operation::ShellExec => (Some(StatKind::ShellOp), run_shell(job, wctx).await),
        Operation::AbortOnError => (None, run_abort(wctx)),
        Operation::Exit => (None, run_exit(job, wctx)),
    }
}

fn require_src(job: &Job) -> JobResult<&ObjectUrl> {
    job.src()
        .first()
        .ok_or_else(|| JobError::Other(anyhow!("job has no source URL")))
}

fn require_dst(job: &Job) -> JobResult<&ObjectUrl> {
    job.dst()
        .ok_or_else(|| JobError::Other(anyhow!("job has no destination URL")))
}

fn storage_class(opts: &OptionList) -> crate::storage::StorageClass {
    crate::storage::StorageClass::from_opts(opts)
}

/// The conditional-flag gate. With none of `-n/-s/-u` set the transfer
/// always proceeds; with any set, it proceeds only when an enabled condition
/// passes. A missing destination always proceeds; a missing source under a
/// conditional flag is an acceptable failure.
async fn precondition(
    wctx: &WorkerContext,
    src: &ObjectUrl,
    dst: &ObjectUrl,
    opts: &OptionList,
) -> JobResult<()> {
    let conditional = opts.has(Opt::IfNotExists)
        || opts.has(Opt::IfSizeDiffer)
        || opts.has(Opt::IfSourceNewer);
    if !conditional {
        return Ok(());
    }

    let src_store = wctx.storage.storage_for(src).await?;
    let src_item = match src_store.head(&wctx.token, src).await {
        Ok(item) => item,
        Err(JobError::NotFound(_)) => {
            return Err(JobError::Precondition(format!("{src}: source not found")))
        }
        Err(e) => return Err(e),
    };

    let dst_store = wctx.storage.storage_for(dst).await?;
    let dst_item = match dst_store.head(&wctx.token, dst).await {
        Ok(item) => item,
        Err(JobError::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    if opts.has(Opt::IfSizeDiffer) && src_item.size != dst_item.size {
        return Ok(());
    }
    if opts.has(Opt::IfSourceNewer) {
        if let (Some(s), Some(d)) = (src_item.mtime, dst_item.mtime) {
            if s > d {
                return Ok(());
            }
        }
    }
    Err(JobError::Precondition(format!("{dst}: object already exists")))
}

/// Directory-like local destinations get the source's base name appended.
async fn resolve_local_dst(job: &Job, src: &ObjectUrl) -> JobResult<ObjectUrl> {
    let dst = require_dst(job)?;
    let is_dir = dst.is_dir_like()
        || tokio::fs::metadata(dst.as_path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
    Ok(if is_dir { dst.join(&src.base()) } else { dst.clone() })
}

fn resolve_remote_dst(job: &Job, src: &ObjectUrl) -> JobResult<ObjectUrl> {
    let dst = require_dst(job)?;
    Ok(if dst.is_dir_like() {
        dst.join(&src.base())
    } else {
        dst.clone()
    })
}

async fn delete_source(wctx: &WorkerContext, src: &ObjectUrl) -> JobResult<()> {
    let storage = wctx.storage.storage_for(src).await?;
    storage
        .remove(&wctx.token, std::slice::from_ref(src))
        .await
}

async fn run_copy(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = resolve_remote_dst(job, src)?;
    precondition(wctx, src, &dst, job.opts()).await?;

    let storage = wctx.storage.storage_for(src).await?;
    storage
        .copy(&wctx.token, src, &dst, storage_class(job.opts()))
        .await?;
    if job.opts().has(Opt::DeleteSource) {
        delete_source(wctx, src).await?;
    }
    Ok(())
}

async fn run_download(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = resolve_local_dst(job, src).await?;
    precondition(wctx, src, &dst, job.opts()).await?;

    if let Some(parent) = dst.as_path().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::Other(anyhow::Error::new(e)))?;
        }
    }

    let storage = wctx.storage.storage_for(src).await?;
    let mut file = tokio::fs::File::create(dst.as_path())
        .await
        .map_err(|e| JobError::Other(anyhow::Error::new(e)))?;
    let bytes = storage.get(&wctx.token, src, &mut file).await?;
    file.flush()
        .await
        .map_err(|e| JobError::Other(anyhow::Error::new(e)))?;
    debug!(src = %src, dst = %dst, bytes, "download complete");

    if job.opts().has(Opt::DeleteSource) {
        delete_source(wctx, src).await?;
    }
    Ok(())
}

async fn run_upload(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = resolve_remote_dst(job, src)?;
    precondition(wctx, src, &dst, job.opts()).await?;

    let storage = wctx.storage.storage_for(&dst).await?;
    storage
        .put(&wctx.token, src.as_path(), &dst, storage_class(job.opts()))
        .await?;
    if job.opts().has(Opt::DeleteSource) {
        delete_source(wctx, src).await?;
    }
    Ok(())
}

async fn run_local_copy(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = resolve_local_dst(job, src).await?;
    precondition(wctx, src, &dst, job.opts()).await?;

    let storage = wctx.storage.storage_for(src).await?;
    storage
        .copy(&wctx.token, src, &dst, storage_class(job.opts()))
        .await?;
    if job.opts().has(Opt::DeleteSource) {
        delete_source(wctx, src).await?;
    }
    Ok(())
}

/// Remote delete: up to 1000 keys per round trip, grouped by bucket.
async fn run_delete(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let first = require_src(job)?;
    let storage = wctx.storage.storage_for(first).await?;

    let mut by_bucket: HashMap<&str, Vec<ObjectUrl>> = HashMap::new();
    for url in job.src() {
        by_bucket.entry(url.bucket()).or_default().push(url.clone());
    }
    for urls in by_bucket.values() {
        for chunk in urls.chunks(DELETE_BATCH_SIZE) {
            storage.remove(&wctx.token, chunk).await?;
        }
    }
    Ok(())
}

async fn run_local_delete(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let first = require_src(job)?;
    let storage = wctx.storage.storage_for(first).await?;
    storage.remove(&wctx.token, job.src()).await
}

async fn run_batch_download(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = require_dst(job)?.clone();
    wild_operation(wctx, src, |item| {
        let item = item?;
        if item.is_directory {
            return None;
        }
        let name = if job.opts().has(Opt::Parents) {
            item.key.clone()
        } else {
            item.url.base()
        };
        Some(job.make_sub_job(
            job.command(),
            Operation::Download,
            vec![item.url.clone()],
            Some(dst.join(&name)),
            job.opts().clone(),
        ))
    })
    .await
}

async fn run_batch_copy(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let dst = require_dst(job)?.clone();
    wild_operation(wctx, src, |item| {
        let item = item?;
        if item.is_directory {
            return None;
        }
        let name = if job.opts().has(Opt::Parents) {
            item.key.clone()
        } else {
            item.url.base()
        };
        Some(job.make_sub_job(
            job.command(),
            Operation::Copy,
            vec![item.url.clone()],
            Some(dst.join(&name)),
            job.opts().clone(),
        ))
    })
    .await
}

/// Wildcard delete: matches accumulate into sub-jobs of up to 1000 keys;
/// the coordinator's final callback flushes the tail.
async fn run_batch_delete(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let src = require_src(job)?;
    let unit_op = if job.operation() == Operation::BatchLocalDelete {
        Operation::LocalDelete
    } else {
        Operation::Delete
    };

    let mut batch: Vec<ObjectUrl> = Vec::new();
    wild_operation(wctx, src, move |item| {
        match item {
            Some(item) => {
                if item.is_directory {
                    return None;
                }
                batch.push(item.url.clone());
                if batch.len() < DELETE_BATCH_SIZE {
                    return None;
                }
            }
            None => {
                if batch.is_empty() {
                    return None;
                }
            }
        }
        let keys = std::mem::take(&mut batch);
        Some(job.make_sub_job("batch-rm", unit_op, keys, None, job.opts().clone()))
    })
    .await
}

fn format_row(item: &Item) -> String {
    if item.is_directory {
        format!("{:>19}  {:>12}  {}", "", "DIR", item.key)
    } else {
        let stamp = item
            .mtime
            .map(|t| t.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| format!("{:>19}", ""));
        format!("{stamp}  {:>12}  {}", item.size, item.key)
    }
}

async fn run_list(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let url = require_src(job)?;
    let storage = wctx.storage.storage_for(url).await?;
    let rx = storage.list(&wctx.token, url).await;

    let mut found = false;
    loop {
        let received = tokio::select! {
            _ = wctx.token.cancelled() => return Err(JobError::Interrupted),
            received = rx.recv() => received,
        };
        match received {
            Ok(Ok(item)) => {
                found = true;
                wctx.out.line(format_row(&item));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }
    if !found {
        return Err(JobError::NotFound(url.to_string()));
    }
    Ok(())
}

async fn run_list_buckets(_job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let storage = wctx.storage.remote_storage().await?;
    let buckets = storage.list_buckets(&wctx.token, "").await?;
    for bucket in buckets {
        let stamp = bucket
            .created
            .map(|t| t.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| format!("{:>19}", ""));
        wctx.out.line(format!("{stamp}  s3://{}", bucket.name));
    }
    Ok(())
}

async fn run_size(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let url = require_src(job)?;
    let storage = wctx.storage.storage_for(url).await?;
    let rx = storage.list(&wctx.token, url).await;

    let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    loop {
        let received = tokio::select! {
            _ = wctx.token.cancelled() => return Err(JobError::Interrupted),
            received = rx.recv() => received,
        };
        match received {
            Ok(Ok(item)) => {
                if !item.is_directory {
                    let class = item
                        .storage_class
                        .clone()
                        .unwrap_or_else(|| "STANDARD".to_owned());
                    let entry = totals.entry(class).or_insert((0, 0));
                    entry.0 += item.size;
                    entry.1 += 1;
                }
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    for (class, (bytes, count)) in &totals {
        wctx.out
            .line(format!("{bytes:>12} bytes in {count} objects: {url} [{class}]"));
    }
    if totals.len() != 1 {
        let bytes: u64 = totals.values().map(|(b, _)| b).sum();
        let count: u64 = totals.values().map(|(_, c)| c).sum();
        wctx.out
            .line(format!("{bytes:>12} bytes in {count} objects: {url}"));
    }
    Ok(())
}

async fn run_head(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let url = require_src(job)?;
    let storage = wctx.storage.storage_for(url).await?;
    let item = storage.head(&wctx.token, url).await?;

    let stamp = item
        .mtime
        .map(|t| t.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| format!("{:>19}", ""));
    let mut line = format!(
        "{stamp}  {:>12}  {}  {url}",
        item.size,
        item.etag.as_deref().unwrap_or("-"),
    );
    if let Some(class) = &item.storage_class {
        line.push_str(&format!(" [{class}]"));
    }
    wctx.out.line(line);
    Ok(())
}

async fn run_cat(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let url = require_src(job)?;
    let storage = wctx.storage.storage_for(url).await?;
    let mut stdout = tokio::io::stdout();
    storage.get(&wctx.token, url, &mut stdout).await?;
    stdout
        .flush()
        .await
        .map_err(|e| JobError::Other(anyhow::Error::new(e)))?;
    Ok(())
}

async fn run_shell(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let cmd = job
        .raw_arg()
        .ok_or_else(|| JobError::Other(anyhow!("shell job has no command text")))?;

    let status = tokio::select! {
        _ = wctx.token.cancelled() => return Err(JobError::Interrupted),
        status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .status() => status,
    }
    .map_err(|e| JobError::Other(anyhow::Error::new(e).context("spawning shell failed")))?;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(JobError::Other(anyhow!("exit status {code}"))),
            None => Err(JobError::Other(anyhow!("terminated by signal"))),
        }
    }
}

fn run_abort(wctx: &WorkerContext) -> JobResult<()> {
    wctx.config.set_abort_on_error();
    Ok(())
}

fn run_exit(job: &Job, wctx: &WorkerContext) -> JobResult<()> {
    let code = job
        .raw_arg()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(0);
    wctx.config.request_exit(code);
    wctx.token.cancel();
    Ok(())
}
