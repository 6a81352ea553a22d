// src/output.rs
//
// Serialized stdout writer. All user-visible result lines funnel through one
// channel drained by a single task, so concurrent workers cannot interleave
// within a line.

use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct OutputLog {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl OutputLog {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let drain = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = stdout.flush().await;
        });
        OutputLog {
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        }
    }

    pub fn line(&self, line: impl Into<String>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(line.into());
        }
    }

    /// Close the intake and wait for every queued line to reach stdout.
    pub async fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let drain = self.drain.lock().unwrap().take();
        if let Some(handle) = drain {
            let _ = handle.await;
        }
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}
