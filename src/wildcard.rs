// src/wildcard.rs
//
// The coordinator behind every batch operation: streams the listing for a
// pattern URL, turns matches into sub-jobs via the caller's callback, and
// blocks until every emitted sub-job has reported back.
//
// Accounting rule: a sub-job's wait-counter increment is synchronous with
// its submission to the sub-job channel, and the enumerator holds one guard
// increment for the whole listing, so the parent's zero-crossing
// happens-after both "listing complete" and "all sub-jobs done".

use crate::error::{JobError, JobResult};
use crate::job::{BatchStats, Job};
use crate::object_url::ObjectUrl;
use crate::storage::Item;
use crate::worker::WorkerContext;

use std::sync::Arc;

use tracing::debug;

/// Run one wildcard parent. The callback receives each matched item, and a
/// final `None` once the listing is exhausted so stateful callbacks (batched
/// deletes) can flush. A `None` return emits nothing for that call.
pub async fn wild_operation<F>(
    wctx: &WorkerContext,
    url: &ObjectUrl,
    mut callback: F,
) -> JobResult<()>
where
    F: FnMut(Option<&Item>) -> Option<Job>,
{
    let storage = wctx.storage.storage_for(url).await?;
    let stats = BatchStats::new();
    let rx = storage.list(&wctx.token, url).await;

    let mut lister_err: Option<JobError> = None;
    loop {
        let received = tokio::select! {
            _ = wctx.token.cancelled() => return Err(JobError::Interrupted),
            received = rx.recv() => received,
        };
        match received {
            Ok(Ok(item)) => {
                if let Some(job) = callback(Some(&item)) {
                    submit(wctx, &stats, job).await?;
                }
            }
            Ok(Err(e)) => {
                debug!("lister finished with error: {e}");
                lister_err = Some(e);
                break;
            }
            Err(_) => break, // stream closed: EOF
        }
    }

    // Final-flush call, then drop the enumeration guard: from here the
    // wait-counter can reach zero.
    if lister_err.is_none() {
        if let Some(job) = callback(None) {
            submit(wctx, &stats, job).await?;
        }
    }
    stats.producer_done();

    tokio::select! {
        _ = stats.wait_zero() => {}
        _ = wctx.token.cancelled() => return Err(JobError::Interrupted),
    }

    let done = stats.success_count();
    let total = stats.total_emitted();
    debug!("all sub-jobs finished: {done}/{total}");

    if let Some(e) = lister_err {
        return Err(e);
    }
    if done != total {
        return Err(JobError::BatchIncomplete { done, total });
    }
    Ok(())
}

/// Count the sub-job, then hand it to the pool. The send races the root
/// token so a shut-down pool cannot wedge the producer; an aborted send
/// takes the accounting back.
async fn submit(wctx: &WorkerContext, stats: &Arc<BatchStats>, mut job: Job) -> JobResult<()> {
    job.parent = Some(stats.clone());
    stats.emitted();
    wctx.pending.add(1);

    tokio::select! {
        _ = wctx.token.cancelled() => {
            stats.child_done(false);
            wctx.pending.done();
            Err(JobError::Interrupted)
        }
        sent = wctx.sub_tx.send(job) => match sent {
            Ok(()) => Ok(()),
            Err(_) => {
                stats.child_done(false);
                wctx.pending.done();
                Err(JobError::Interrupted)
            }
        },
    }
}
