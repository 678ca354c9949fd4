//! Persistence sinks for changed snapshots

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::types::StatusSnapshot;

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()>;
}

/// Logs each change at info
#[derive(Debug, Default)]
pub struct LogPersistenceSink;

#[async_trait]
impl PersistenceSink for LogPersistenceSink {
    async fn persist(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let codes: Vec<&str> = snapshot.alerts.iter().map(|a| a.code.as_str()).collect();
        info!(
            "[{}] {:?} alerts=[{}]",
            snapshot.name,
            snapshot.health,
            codes.join(", ")
        );
        Ok(())
    }
}

/// Appends one JSON document per changed snapshot
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonlFileSink {
    async fn persist(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(snapshot).context("serialize snapshot")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Fan one snapshot out to several sinks
pub struct FanoutPersistence {
    sinks: Vec<Arc<dyn PersistenceSink>>,
}

impl FanoutPersistence {
    pub fn new(sinks: Vec<Arc<dyn PersistenceSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl PersistenceSink for FanoutPersistence {
    async fn persist(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.persist(snapshot).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Spawn the persistence worker over `rx`
pub fn spawn_persistence(
    mut rx: mpsc::Receiver<StatusSnapshot>,
    sink: Arc<dyn PersistenceSink>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => break,
                },
            };
            if let Err(e) = sink.persist(&snapshot).await {
                error!("[{}] Persistence failed: {e:#}", snapshot.name);
            }
        }

        while let Ok(snapshot) = rx.try_recv() {
            if let Err(e) = sink.persist(&snapshot).await {
                error!("[{}] Persistence failed: {e:#}", snapshot.name);
            }
        }
        debug!("Persistence worker stopped");
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::status::types::AlertScope;

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status").join("changes.jsonl");
        let sink = JsonlFileSink::new(&path);

        sink.persist(&StatusSnapshot::online("cash-1", "CDM", AlertScope::Connection))
            .await
            .unwrap();
        sink.persist(&StatusSnapshot::offline("cash-1", "CDM", AlertScope::Connection))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<StatusSnapshot> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].is_online());
        assert!(!lines[1].is_online());
    }

    #[tokio::test]
    async fn test_worker_survives_sink_errors() {
        struct Broken;

        #[async_trait]
        impl PersistenceSink for Broken {
            async fn persist(&self, _snapshot: &StatusSnapshot) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_persistence(rx, Arc::new(Broken), CancellationToken::new());
        tx.send(StatusSnapshot::online("a", "", AlertScope::Status))
            .await
            .unwrap();
        tx.send(StatusSnapshot::online("b", "", AlertScope::Status))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
