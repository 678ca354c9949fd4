//! Batching notifier
//!
//! Alerts marked `notify` are queued here. The worker opens a window on the
//! first entry, folds repeats of the same (device, code) inside it into one
//! batch entry with a count, and hands the batch to the sink when the window
//! closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::Severity;

/// One aggregated notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub device: String,
    pub code: String,
    pub severity: Severity,
    pub message: String,
    /// Occurrences inside the window
    pub count: u32,
}

impl NotificationBatch {
    pub fn single(device: impl Into<String>, code: impl Into<String>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            code: code.into(),
            severity,
            message: message.into(),
            count: 1,
        }
    }
}

/// Receives closed batches
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, batch: &[NotificationBatch]) -> anyhow::Result<()>;
}

/// Writes notifications to the service log
#[derive(Debug, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, batch: &[NotificationBatch]) -> anyhow::Result<()> {
        for entry in batch {
            let repeat = if entry.count > 1 {
                format!(" (x{})", entry.count)
            } else {
                String::new()
            };
            if entry.severity.is_error() {
                warn!("[{}] {} {}{}", entry.device, entry.code, entry.message, repeat);
            } else {
                info!("[{}] {} {}{}", entry.device, entry.code, entry.message, repeat);
            }
        }
        Ok(())
    }
}

/// Fold a new entry into the open window, keeping first-seen order
fn fold(window: &mut Vec<NotificationBatch>, index: &mut HashMap<(String, String), usize>, entry: NotificationBatch) {
    let key = (entry.device.clone(), entry.code.clone());
    match index.get(&key) {
        Some(&i) => {
            let existing = &mut window[i];
            existing.count = existing.count.saturating_add(entry.count);
            existing.severity = existing.severity.max(entry.severity);
            existing.message = entry.message;
        },
        None => {
            index.insert(key, window.len());
            window.push(entry);
        },
    }
}

async fn flush(sink: &dyn NotificationSink, window: &mut Vec<NotificationBatch>) {
    if window.is_empty() {
        return;
    }
    debug!("Flushing {} notification(s)", window.len());
    if let Err(e) = sink.notify(window).await {
        error!("Notification sink failed: {e:#}");
    }
    window.clear();
}

/// Spawn the batching worker over `rx`
pub fn spawn_notifier(
    mut rx: mpsc::Receiver<NotificationBatch>,
    sink: Arc<dyn NotificationSink>,
    window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut batch = Vec::new();
        let mut index = HashMap::new();

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                first = rx.recv() => first,
            };
            let Some(first) = first else { break };
            fold(&mut batch, &mut index, first);

            let deadline = tokio::time::Instant::now() + window;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(entry) => fold(&mut batch, &mut index, entry),
                        None => break,
                    },
                }
            }

            flush(sink.as_ref(), &mut batch).await;
            index.clear();
        }

        // Drain whatever is still queued
        while let Ok(entry) = rx.try_recv() {
            fold(&mut batch, &mut index, entry);
        }
        flush(sink.as_ref(), &mut batch).await;
        debug!("Notifier stopped");
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<Vec<NotificationBatch>>>,
    }

    #[async_trait]
    impl NotificationSink for CollectingSink {
        async fn notify(&self, batch: &[NotificationBatch]) -> anyhow::Result<()> {
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify(&self, _batch: &[NotificationBatch]) -> anyhow::Result<()> {
            anyhow::bail!("mail server down")
        }
    }

    #[tokio::test]
    async fn test_repeats_inside_window_are_counted() {
        let (tx, rx) = mpsc::channel(16);
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        let handle = spawn_notifier(rx, sink.clone(), Duration::from_millis(100), shutdown.clone());

        tx.send(NotificationBatch::single("cash-1", "A", Severity::Warning, "a"))
            .await
            .unwrap();
        tx.send(NotificationBatch::single("cash-1", "A", Severity::Error, "a"))
            .await
            .unwrap();
        tx.send(NotificationBatch::single("cash-1", "B", Severity::Info, "b"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let batches = sink.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].code, "A");
        assert_eq!(batches[0][0].count, 2);
        assert_eq!(batches[0][0].severity, Severity::Error);
        assert_eq!(batches[0][1].count, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_sink_marks_repeats() {
        let mut entry = NotificationBatch::single(
            "cash-1",
            "DEVICE.CASH_1.STATUS.NOTE_JAM",
            Severity::Error,
            "Note jam",
        );
        entry.count = 3;
        LogNotificationSink.notify(&[entry]).await.unwrap();

        assert!(logs_contain("[cash-1] DEVICE.CASH_1.STATUS.NOTE_JAM Note jam (x3)"));
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let handle = spawn_notifier(rx, Arc::new(FailingSink), Duration::from_millis(10), shutdown);

        tx.send(NotificationBatch::single("d", "X", Severity::Error, "x"))
            .await
            .unwrap();
        drop(tx);
        // Worker survives the failure and exits when the queue closes
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
