//! Status pipeline
//!
//! normalize (policy, edge-triggered notify, message) -> store merge/dedup
//! -> on change: notifier queue, persistence queue, outbound change stream.
//! All downstream hand-offs are non-blocking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::catalog::MessageCatalog;
use super::error_code::ErrorCode;
use super::notifier::{spawn_notifier, NotificationBatch, NotificationSink};
use super::persistence::{spawn_persistence, PersistenceSink};
use super::policy::{ErrorPolicy, PolicyTable};
use super::queue::BoundedQueue;
use super::store::{StatusStore, StoreUpdate};
use super::types::{Health, Severity, StatusEvent, StatusSnapshot};
use crate::core::config::StatusSection;
use crate::error::{ErrorExt, Result};

pub struct StatusPipeline {
    store: Arc<StatusStore>,
    policies: PolicyTable,
    catalog: MessageCatalog,
    notifier: Option<BoundedQueue<NotificationBatch>>,
    persistence: Option<BoundedQueue<StatusSnapshot>>,
    changes: Option<BoundedQueue<StatusSnapshot>>,
}

/// Running pipeline plus its worker handles and change stream
pub struct PipelineHandle {
    pub pipeline: Arc<StatusPipeline>,
    pub changes: mpsc::Receiver<StatusSnapshot>,
    pub workers: Vec<JoinHandle<()>>,
}

impl StatusPipeline {
    /// Pipeline with no downstream consumers
    pub fn new(store: Arc<StatusStore>, policies: PolicyTable, catalog: MessageCatalog) -> Self {
        Self {
            store,
            policies,
            catalog,
            notifier: None,
            persistence: None,
            changes: None,
        }
    }

    pub fn with_notifier(mut self, queue: BoundedQueue<NotificationBatch>) -> Self {
        self.notifier = Some(queue);
        self
    }

    pub fn with_persistence(mut self, queue: BoundedQueue<StatusSnapshot>) -> Self {
        self.persistence = Some(queue);
        self
    }

    pub fn with_changes(mut self, queue: BoundedQueue<StatusSnapshot>) -> Self {
        self.changes = Some(queue);
        self
    }

    /// Build from configuration and spawn the notifier and persistence workers
    pub fn spawn(
        config: &StatusSection,
        notification_sink: Arc<dyn NotificationSink>,
        persistence_sink: Arc<dyn PersistenceSink>,
        shutdown: CancellationToken,
    ) -> Result<PipelineHandle> {
        let policies = PolicyTable::with_overrides(&config.policies)
            .config_error("status.policies")?;
        let catalog = MessageCatalog::new(config.messages.clone());

        let capacity = config.queue_capacity;
        let (notify_queue, notify_rx) = BoundedQueue::new("notifier", capacity);
        let (persist_queue, persist_rx) = BoundedQueue::new("persistence", capacity);
        let (change_queue, change_rx) = BoundedQueue::new("status changes", capacity);

        let workers = vec![
            spawn_notifier(
                notify_rx,
                notification_sink,
                config.notifier_window(),
                shutdown.clone(),
            ),
            spawn_persistence(persist_rx, persistence_sink, shutdown),
        ];

        let pipeline = Self::new(Arc::new(StatusStore::new()), policies, catalog)
            .with_notifier(notify_queue)
            .with_persistence(persist_queue)
            .with_changes(change_queue);

        Ok(PipelineHandle {
            pipeline: Arc::new(pipeline),
            changes: change_rx,
            workers,
        })
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Policy for a code; unparsable codes get the severity-based fallback
    pub fn policy_for(&self, code: Option<&ErrorCode>, severity: Severity) -> ErrorPolicy {
        match code {
            Some(code) => self.policies.get(code.category()),
            None => ErrorPolicy::fallback(severity),
        }
    }

    /// Normalize, store and fan out one snapshot
    pub fn publish(&self, snapshot: StatusSnapshot) -> StoreUpdate {
        let normalized = if snapshot.alerts.is_empty() {
            snapshot
        } else {
            self.normalize(snapshot)
        };

        let update = self.store.apply(normalized.clone());
        if let StoreUpdate::Changed(merged) = &update {
            debug!(
                "[{}] Status changed: {:?}, {} alert(s)",
                merged.name,
                merged.health,
                merged.alerts.len()
            );

            if let Some(notifier) = &self.notifier {
                for alert in normalized.alerts.iter().filter(|a| a.notify) {
                    notifier.offer(NotificationBatch::single(
                        &normalized.name,
                        &alert.code,
                        alert.severity,
                        &alert.message,
                    ));
                }
            }
            if let Some(persistence) = &self.persistence {
                persistence.offer(merged.clone());
            }
            if let Some(changes) = &self.changes {
                changes.offer(merged.clone());
            }
        }
        update
    }

    fn normalize(&self, snapshot: StatusSnapshot) -> StatusSnapshot {
        let previous = self.store.key_set(&snapshot.name);
        let mut health = snapshot.health;

        let alerts: Vec<StatusEvent> = snapshot
            .alerts
            .iter()
            .cloned()
            .map(|alert| {
                let code = match alert.error_code.clone() {
                    Some(code) => Some(code),
                    None => match alert.code.parse::<ErrorCode>() {
                        Ok(code) => Some(code),
                        Err(e) => {
                            warn!("[{}] {e}, using fallback policy", snapshot.name);
                            None
                        },
                    },
                };
                let policy = self.policy_for(code.as_ref(), alert.severity);

                if policy.set_offline {
                    health = Health::Offline;
                }
                let severity = policy.severity_override.unwrap_or(alert.severity);
                let message = self.catalog.resolve(&alert.code, code.as_ref(), &alert.message);

                // Key on the canonical code text
                let alert = match code {
                    Some(code) => alert.with_error_code(code),
                    None => alert,
                };
                let notify = policy.notify && !previous.contains(&alert.key());
                alert
                    .with_severity(severity)
                    .with_notify(notify)
                    .with_forces_offline(policy.set_offline)
                    .with_message(message)
            })
            .collect();

        StatusSnapshot {
            alerts,
            ..snapshot
        }
        .with_health(health)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::status::error_code::ErrorCategory;
    use crate::status::types::AlertScope;

    fn pipeline() -> (
        StatusPipeline,
        mpsc::Receiver<NotificationBatch>,
        mpsc::Receiver<StatusSnapshot>,
        mpsc::Receiver<StatusSnapshot>,
    ) {
        let mut catalog = MessageCatalog::default();
        catalog.insert("STATUS.CASSETTE1_EMPTY", "Cassette 1 is empty");
        let (notify, notify_rx) = BoundedQueue::new("notifier", 16);
        let (persist, persist_rx) = BoundedQueue::new("persistence", 16);
        let (changes, changes_rx) = BoundedQueue::new("changes", 16);
        let pipeline = StatusPipeline::new(Arc::new(StatusStore::new()), PolicyTable::default(), catalog)
            .with_notifier(notify)
            .with_persistence(persist)
            .with_changes(changes);
        (pipeline, notify_rx, persist_rx, changes_rx)
    }

    fn empty_cassette() -> StatusSnapshot {
        StatusSnapshot::online("cash-1", "CDM", AlertScope::Status).with_alert(StatusEvent::new(
            ErrorCode::device("CASH_1", ErrorCategory::Status, "CASSETTE1_EMPTY"),
            Severity::Warning,
            "raw",
            AlertScope::Status,
        ))
    }

    #[tokio::test]
    async fn test_identical_publish_is_deduplicated() {
        let (pipeline, mut notify_rx, mut persist_rx, mut changes_rx) = pipeline();

        assert!(matches!(pipeline.publish(empty_cassette()), StoreUpdate::Changed(_)));
        assert_eq!(pipeline.publish(empty_cassette()), StoreUpdate::Unchanged);
        assert_eq!(pipeline.store().mutation_count(), 1);

        assert!(persist_rx.try_recv().is_ok());
        assert!(persist_rx.try_recv().is_err());
        assert!(changes_rx.try_recv().is_ok());
        assert!(changes_rx.try_recv().is_err());

        let note = notify_rx.try_recv().unwrap();
        assert_eq!(note.message, "Cassette 1 is empty");
        assert!(notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notify_only_on_first_appearance() {
        let (pipeline, _n, _p, _c) = pipeline();

        let first = match pipeline.publish(empty_cassette()) {
            StoreUpdate::Changed(s) => s,
            StoreUpdate::Unchanged => panic!("first publish must change"),
        };
        assert!(first.alerts[0].notify);

        // Same alert plus a new one: only the new one notifies
        let second = empty_cassette().with_alert(StatusEvent::new(
            ErrorCode::device("CASH_1", ErrorCategory::Status, "NOTE_JAM"),
            Severity::Error,
            "jam",
            AlertScope::Status,
        ));
        let merged = match pipeline.publish(second) {
            StoreUpdate::Changed(s) => s,
            StoreUpdate::Unchanged => panic!("new alert must change"),
        };
        let notify: Vec<(String, bool)> = merged
            .alerts
            .iter()
            .map(|a| (a.error_code.as_ref().unwrap().detail().to_string(), a.notify))
            .collect();
        assert_eq!(
            notify,
            vec![
                ("CASSETTE1_EMPTY".to_string(), false),
                ("NOTE_JAM".to_string(), true)
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_alert_forces_offline_and_error() {
        let (pipeline, _n, _p, _c) = pipeline();
        let snapshot = StatusSnapshot::online("cash-1", "CDM", AlertScope::Connection).with_alert(
            StatusEvent::raw(
                "device.cash_1.connect.open_failed",
                Severity::Warning,
                "port busy",
                AlertScope::Connection,
            ),
        );

        let stored = match pipeline.publish(snapshot) {
            StoreUpdate::Changed(s) => s,
            StoreUpdate::Unchanged => panic!("must change"),
        };
        assert_eq!(stored.health, Health::Offline);
        assert_eq!(stored.alerts[0].severity, Severity::Error);
        assert!(stored.alerts[0].forces_offline);
        assert!(stored.alerts[0].error_code.is_some());
    }

    #[tokio::test]
    async fn test_offline_status_policy_survives_command_success() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "status".to_string(),
            ErrorPolicy {
                set_offline: true,
                ..ErrorPolicy::default()
            },
        );
        let pipeline = StatusPipeline::new(
            Arc::new(StatusStore::new()),
            PolicyTable::with_overrides(&overrides).unwrap(),
            MessageCatalog::default(),
        );

        pipeline.publish(empty_cassette());
        assert_eq!(pipeline.store().get("cash-1").unwrap().health, Health::Offline);

        // A successful command clears command alerts only
        let update = pipeline.publish(StatusSnapshot::online("cash-1", "CDM", AlertScope::Command));
        assert_eq!(update, StoreUpdate::Unchanged);
        assert_eq!(pipeline.store().get("cash-1").unwrap().health, Health::Offline);

        // Clearing the status alert brings the device back
        pipeline.publish(StatusSnapshot::online("cash-1", "CDM", AlertScope::Status));
        assert_eq!(pipeline.store().get("cash-1").unwrap().health, Health::Online);
    }

    #[tokio::test]
    async fn test_unparsable_code_uses_fallback() {
        let (pipeline, mut notify_rx, _p, _c) = pipeline();
        let snapshot = StatusSnapshot::online("kiosk", "", AlertScope::Status)
            .with_alert(StatusEvent::raw("PAPER_LOW", Severity::Warning, "low", AlertScope::Status))
            .with_alert(StatusEvent::raw("PAPER_OUT", Severity::Error, "out", AlertScope::Status));

        let stored = match pipeline.publish(snapshot) {
            StoreUpdate::Changed(s) => s,
            StoreUpdate::Unchanged => panic!("must change"),
        };
        assert_eq!(stored.health, Health::Online);
        assert!(!stored.alerts[0].notify);
        assert!(stored.alerts[1].notify);
        assert_eq!(notify_rx.try_recv().unwrap().code, "PAPER_OUT");
        assert!(notify_rx.try_recv().is_err());
    }
}
