//! Throttled "working…" status while an agent run is in flight.
//!
//! Tool callbacks arrive far faster than a chat surface accepts edits. Each
//! run gets one worker that keeps only the newest pending label, skips
//! repeats, and edits the status message at most once per interval.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1200);

/// Where status text is shown, e.g. an editable chat message.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn edit(&self, text: &str) -> Result<()>;
}

/// Short label for a tool invocation.
pub fn progress_label(tool_name: &str) -> &'static str {
    let name = tool_name.to_lowercase();
    if name.contains("web") || name.contains("search") {
        "Searching the web…"
    } else if name.contains("bash") || name.contains("shell") {
        "Running command…"
    } else if name.contains("read") {
        "Loading context…"
    } else if name.contains("write") || name.contains("edit") {
        "Editing files…"
    } else {
        "Working…"
    }
}

enum Progress {
    Label(String),
    Stop,
}

pub struct ProgressNotifier {
    tx: mpsc::UnboundedSender<Progress>,
    worker: Option<JoinHandle<()>>,
}

impl ProgressNotifier {
    pub fn spawn(sink: Arc<dyn StatusSink>, min_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(rx, sink, min_interval));
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Queues a label. Never blocks; safe to call from any thread.
    pub fn push(&self, label: impl Into<String>) {
        if self.tx.send(Progress::Label(label.into())).is_err() {
            debug!("Progress worker already stopped");
        }
    }

    pub fn push_tool(&self, tool_name: &str) {
        self.push(progress_label(tool_name));
    }

    /// Stops the worker and waits for it to exit.
    pub async fn finish(mut self) {
        // A closed channel means the worker is already gone.
        let _ = self.tx.send(Progress::Stop);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                debug!("Progress worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ProgressNotifier {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.tx.send(Progress::Stop);
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Progress>,
    sink: Arc<dyn StatusSink>,
    min_interval: Duration,
) {
    let mut shown: Option<String> = None;
    let mut last_edit: Option<Instant> = None;

    while let Some(item) = rx.recv().await {
        let Progress::Label(mut pending) = item else {
            break;
        };
        let mut stop = false;
        while let Ok(next) = rx.try_recv() {
            match next {
                Progress::Label(label) => pending = label,
                Progress::Stop => {
                    stop = true;
                    break;
                }
            }
        }
        if stop {
            break;
        }
        if shown.as_deref() == Some(pending.as_str()) {
            continue;
        }
        if let Some(at) = last_edit {
            let wait = min_interval.saturating_sub(at.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        match sink.edit(&pending).await {
            Ok(()) => {
                shown = Some(pending);
                last_edit = Some(Instant::now());
            }
            Err(e) => debug!("Status edit failed: {}", e),
        }
    }
}
