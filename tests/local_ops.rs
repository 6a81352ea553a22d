// tests/local_ops.rs
//
// End-to-end engine runs: the real manager, workers, parser, and wildcard
// coordinator over the filesystem backend, plus a scripted remote backend
// for the batch fan-out paths.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use s3bulk::constants::LIST_CHANNEL_CAPACITY;
use s3bulk::{
    Bucket, Config, DefaultFactory, FileStorage, Item, JobError, JobResult, ObjectUrl, S3Opts,
    StatKind, Storage, StorageClass, StorageFactory, WorkerManager,
};

fn test_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.worker_count = workers;
    config
}

fn local_manager(workers: usize) -> WorkerManager {
    let config = test_config(workers);
    let factory = Arc::new(DefaultFactory::new(S3Opts::from(&config)));
    WorkerManager::new(config, factory, CancellationToken::new())
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn single_local_copy() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    write_file(&src, "hello");

    let summary = local_manager(2)
        .run_cmd(&format!("cp {} {}", src.display(), dst.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hello");
    assert_eq!(summary.stats().get(StatKind::FileOp), 1);
}

#[tokio::test]
async fn local_move_deletes_source() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("s");
    let dst = dir.path().join("d");
    write_file(&src, "x");

    let summary = local_manager(2)
        .run_cmd(&format!("mv {} {}", src.display(), dst.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert!(!src.exists());
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "x");
}

#[tokio::test]
async fn copy_into_directory_appends_base_name() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("data.bin");
    let sub = dir.path().join("sub");
    write_file(&src, "payload");
    std::fs::create_dir(&sub).unwrap();

    let summary = local_manager(2)
        .run_cmd(&format!("cp {} {}", src.display(), sub.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        std::fs::read_to_string(sub.join("data.bin")).unwrap(),
        "payload"
    );
}

#[tokio::test]
async fn no_clobber_is_an_acceptable_failure() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    write_file(&src, "new");
    write_file(&dst, "old");

    let summary = local_manager(2)
        .run_cmd(&format!("cp -n {} {}", src.display(), dst.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "old");
    // Counted as the op kind, not as a failure.
    assert_eq!(summary.stats().get(StatKind::FileOp), 1);
    assert_eq!(summary.stats().get(StatKind::Fail), 0);
}

#[tokio::test]
async fn size_differ_overwrites_when_sizes_differ() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    write_file(&src, "longer contents");
    write_file(&dst, "old");

    let summary = local_manager(2)
        .run_cmd(&format!("cp -n -s {} {}", src.display(), dst.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "longer contents");
}

#[tokio::test]
async fn wildcard_local_delete_fans_out() {
    let dir = tempfile::tempdir().unwrap();
    write_file(&dir.path().join("a.txt"), "1");
    write_file(&dir.path().join("b.txt"), "2");
    write_file(&dir.path().join("c.log"), "3");

    let summary = local_manager(4)
        .run_cmd(&format!("rm {}/*.txt", dir.path().display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert!(!dir.path().join("a.txt").exists());
    assert!(!dir.path().join("b.txt").exists());
    assert!(dir.path().join("c.log").exists());
}

#[tokio::test]
async fn missing_source_is_a_hard_failure() {
    let dir = tempfile::tempdir().unwrap();
    let summary = local_manager(2)
        .run_cmd(&format!(
            "cp {}/missing {}/out",
            dir.path().display(),
            dir.path().display()
        ))
        .await
        .unwrap();
    assert_eq!(summary.exit_code(), 127);
    assert_eq!(summary.stats().get(StatKind::Fail), 1);
}

#[tokio::test]
async fn command_file_runs_in_order_and_skips_bad_lines() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let dst = dir.path().join("out");
    write_file(&src, "ok");

    let script = dir.path().join("commands.txt");
    write_file(
        &script,
        &format!(
            "# setup\n\nfrobnicate nothing\ncp {} {}\n",
            src.display(),
            dst.display()
        ),
    );

    let summary = local_manager(1).run(&script).await.unwrap();

    // The parse error counts as a failure but the stream continues.
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "ok");
    assert_eq!(summary.exit_code(), 127);
}

#[tokio::test]
async fn abort_on_error_stops_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("good");
    let dst = dir.path().join("copied");
    write_file(&src, "ok");

    let script = dir.path().join("commands.txt");
    write_file(
        &script,
        &format!(
            "abort-on-any-error\ncp {}/missing {}/nowhere\ncp {} {}\n",
            dir.path().display(),
            dir.path().display(),
            src.display(),
            dst.display()
        ),
    );

    let summary = local_manager(1).run(&script).await.unwrap();

    assert_eq!(summary.exit_code(), 127);
    assert!(!dst.exists(), "job after the failure must not run");
}

#[tokio::test]
async fn exit_command_sets_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("commands.txt");
    write_file(&script, "exit 5\n");

    let summary = local_manager(1).run(&script).await.unwrap();
    assert_eq!(summary.exit_code(), 5);
}

#[tokio::test]
async fn chained_job_runs_only_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    write_file(&src, "chained");

    let summary = local_manager(2)
        .run_cmd(&format!(
            "cp {} {} && rm {}",
            src.display(),
            dst.display(),
            src.display()
        ))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert!(!src.exists(), "chained rm must run after a successful cp");
    assert_eq!(std::fs::read_to_string(&dst).unwrap(), "chained");
    assert_eq!(summary.stats().get(StatKind::FileOp), 2);
}

#[tokio::test]
async fn shell_command_success_and_failure() {
    let summary = local_manager(1).run_cmd("! true").await.unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats().get(StatKind::ShellOp), 1);

    let summary = local_manager(1).run_cmd("! false").await.unwrap();
    assert_eq!(summary.exit_code(), 127);
}

// ---------------------------------------------------------------------------
// Scripted remote backend for the batch fan-out paths.
// ---------------------------------------------------------------------------

struct MockRemote {
    keys: Vec<String>,
    bucket: String,
    /// Remove calls touching this key fail the whole round trip.
    fail_key: Option<String>,
    /// Keys removed so far, and an artificial latency per round trip.
    removed: Arc<std::sync::atomic::AtomicU64>,
    remove_delay: std::time::Duration,
}

#[async_trait]
impl Storage for MockRemote {
    async fn list(&self, _ctx: &CancellationToken, url: &ObjectUrl) -> s3bulk::storage::ItemReceiver {
        let (tx, rx) = async_channel::bounded(LIST_CHANNEL_CAPACITY);
        let items: Vec<Item> = self
            .keys
            .iter()
            .filter_map(|k| {
                let key = url.match_key(k)?;
                Some(Item {
                    key,
                    url: ObjectUrl::remote_object(&self.bucket, k),
                    size: 4,
                    mtime: None,
                    etag: None,
                    storage_class: None,
                    is_directory: k.ends_with('/'),
                })
            })
            .collect();
        tokio::spawn(async move {
            for item in items {
                if tx.send(Ok(item)).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    async fn head(&self, _ctx: &CancellationToken, url: &ObjectUrl) -> JobResult<Item> {
        Err(JobError::NotFound(url.to_string()))
    }

    async fn get(
        &self,
        _ctx: &CancellationToken,
        _url: &ObjectUrl,
        to: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> JobResult<u64> {
        to.write_all(b"data")
            .await
            .map_err(|e| JobError::Other(anyhow::Error::new(e)))?;
        Ok(4)
    }

    async fn put(
        &self,
        _ctx: &CancellationToken,
        _from: &Path,
        _url: &ObjectUrl,
        _class: StorageClass,
    ) -> JobResult<()> {
        Ok(())
    }

    async fn copy(
        &self,
        _ctx: &CancellationToken,
        _src: &ObjectUrl,
        _dst: &ObjectUrl,
        _class: StorageClass,
    ) -> JobResult<()> {
        Ok(())
    }

    async fn remove(&self, ctx: &CancellationToken, urls: &[ObjectUrl]) -> JobResult<()> {
        if !self.remove_delay.is_zero() {
            tokio::select! {
                _ = ctx.cancelled() => return Err(JobError::Interrupted),
                _ = tokio::time::sleep(self.remove_delay) => {}
            }
        }
        if let Some(fail) = &self.fail_key {
            if urls.iter().any(|u| u.path() == fail) {
                return Err(JobError::Other(anyhow::anyhow!("injected remove failure")));
            }
        }
        self.removed
            .fetch_add(urls.len() as u64, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn list_buckets(&self, _ctx: &CancellationToken, _prefix: &str) -> JobResult<Vec<Bucket>> {
        Ok(vec![Bucket {
            name: self.bucket.clone(),
            created: None,
        }])
    }
}

struct MockFactory {
    remote: Arc<MockRemote>,
    file: Arc<FileStorage>,
}

#[async_trait]
impl StorageFactory for MockFactory {
    async fn storage_for(&self, url: &ObjectUrl) -> JobResult<Arc<dyn Storage>> {
        if url.is_remote() {
            Ok(self.remote.clone())
        } else {
            Ok(self.file.clone())
        }
    }

    async fn remote_storage(&self) -> JobResult<Arc<dyn Storage>> {
        Ok(self.remote.clone())
    }
}

fn mock_manager(workers: usize, remote: MockRemote) -> WorkerManager {
    let factory = Arc::new(MockFactory {
        remote: Arc::new(remote),
        file: Arc::new(FileStorage::new()),
    });
    WorkerManager::new(test_config(workers), factory, CancellationToken::new())
}

fn logs_remote(fail_key: Option<&str>) -> MockRemote {
    MockRemote {
        keys: vec![
            "logs/a.txt".to_owned(),
            "logs/b.txt".to_owned(),
            "other/c.txt".to_owned(),
        ],
        bucket: "bucket".to_owned(),
        fail_key: fail_key.map(str::to_owned),
        removed: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        remove_delay: std::time::Duration::ZERO,
    }
}

#[tokio::test]
async fn wildcard_download_fans_out_per_match() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let summary = mock_manager(4, logs_remote(None))
        .run_cmd(&format!("cp s3://bucket/logs/*.txt {}/", out.display()))
        .await
        .unwrap();

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "data");
    assert_eq!(std::fs::read_to_string(out.join("b.txt")).unwrap(), "data");
    assert!(!out.join("c.txt").exists(), "non-matching key must be filtered");
    // Two sub-jobs plus the parent.
    assert_eq!(summary.stats().get(StatKind::S3Op), 3);
}

#[tokio::test]
async fn wildcard_delete_batches_keys() {
    let summary = mock_manager(4, logs_remote(None))
        .run_cmd("rm s3://bucket/logs/*.txt")
        .await
        .unwrap();
    assert_eq!(summary.exit_code(), 0);
    // One accumulated batch sub-job plus the parent.
    assert_eq!(summary.stats().get(StatKind::S3Op), 2);
}

#[tokio::test]
async fn cancellation_mid_batch_is_prompt() {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    let total_keys = 5_000u64;
    let removed = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let remote = MockRemote {
        keys: (0..total_keys).map(|i| format!("logs/{i:05}.txt")).collect(),
        bucket: "bucket".to_owned(),
        fail_key: None,
        removed: removed.clone(),
        remove_delay: Duration::from_millis(50),
    };

    let token = CancellationToken::new();
    let factory = Arc::new(MockFactory {
        remote: Arc::new(remote),
        file: Arc::new(FileStorage::new()),
    });
    let manager = WorkerManager::new(test_config(2), factory, token.clone());

    let run = tokio::spawn(manager.run_cmd("rm s3://bucket/logs/*.txt"));
    tokio::time::sleep(Duration::from_millis(60)).await;
    token.cancel();

    // The run must unwind promptly: every worker returns, nothing hangs.
    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run must unwind after cancellation")
        .unwrap()
        .unwrap();

    assert!(
        removed.load(Ordering::SeqCst) < total_keys,
        "cancellation must stop the batch before all keys are deleted"
    );
    // Interruption is not a hard failure.
    let _ = summary.exit_code();
}

#[tokio::test]
async fn failed_sub_job_makes_the_parent_incomplete() {
    let summary = mock_manager(4, logs_remote(Some("logs/a.txt")))
        .run_cmd("rm s3://bucket/logs/*.txt")
        .await
        .unwrap();
    // The batch sub-job fails and the parent reports incompleteness.
    assert_eq!(summary.exit_code(), 127);
    assert_eq!(summary.stats().get(StatKind::Fail), 2);
}
