//! Fire-and-forget owner notifications
//!
//! The engine hands a [`Notification`] to a [`Notifier`] and moves on.
//! [`NotificationSender`] queues it on a bounded channel (dropping when
//! full); [`NotificationWorker`] drains the channel, applies the owner's
//! preferences, renders the message and passes it to a
//! [`NotificationTransport`] under a timeout. Failures stop at the worker.

use crate::domain::notification::{Notification, OutboundMessage};
use crate::infra::clock::Clock;
use crate::infra::metrics::Metrics;
use crate::infra::store::PreferenceStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Sink for engine notifications. Must never block or fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Delivery backend for rendered messages
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> anyhow::Result<()>;
}

/// Sender handle for notifications
///
/// Clone this to share across services.
/// Non-blocking - if the channel is full, notifications are dropped.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::Sender<Notification>,
    metrics: Arc<Metrics>,
}

impl Notifier for NotificationSender {
    fn notify(&self, notification: Notification) {
        let owner = notification.owner;
        let kind = notification.kind;
        match self.tx.try_send(notification) {
            Ok(()) => self.metrics.record_notification_queued(),
            Err(e) => {
                self.metrics.record_notification_dropped();
                warn!(owner = %owner, kind = kind.as_str(), error = %e, "notification_dropped");
            }
        }
    }
}

/// Create a new notification channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_notification_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (NotificationSender, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (NotificationSender { tx, metrics }, rx)
}

pub struct NotificationWorker {
    rx: mpsc::Receiver<Notification>,
    preferences: Arc<dyn PreferenceStore>,
    transport: Arc<dyn NotificationTransport>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    send_timeout: Duration,
}

impl NotificationWorker {
    pub fn new(
        rx: mpsc::Receiver<Notification>,
        preferences: Arc<dyn PreferenceStore>,
        transport: Arc<dyn NotificationTransport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        send_timeout: Duration,
    ) -> Self {
        Self { rx, preferences, transport, clock, metrics, send_timeout }
    }

    /// Run the worker loop until shutdown, then drain what is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(timeout_ms = self.send_timeout.as_millis() as u64, "notification_worker_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        while let Ok(notification) = self.rx.try_recv() {
                            self.handle(notification).await;
                        }
                        info!("notification_worker_shutdown");
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(notification) => self.handle(notification).await,
                        None => {
                            info!("notification_worker_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Deliver one notification. Every failure is logged and swallowed.
    pub async fn handle(&self, notification: Notification) {
        let owner = notification.owner;
        let kind = notification.kind.as_str();

        let prefs = match self.preferences.notification_preferences(owner) {
            Ok(Some(prefs)) => prefs,
            Ok(None) => {
                debug!(owner = %owner, kind, "notification_no_preferences");
                return;
            }
            Err(e) => {
                self.metrics.record_notification_failed();
                warn!(owner = %owner, kind, error = %e, "notification_preferences_failed");
                return;
            }
        };

        let Some(message) = OutboundMessage::render(&notification, &prefs, self.clock.now()) else {
            debug!(owner = %owner, kind, "notification_opted_out");
            return;
        };

        let start = Instant::now();
        match tokio::time::timeout(self.send_timeout, self.transport.deliver(&message)).await {
            Ok(Ok(())) => {
                self.metrics.record_notification_delivered();
                debug!(
                    owner = %owner,
                    kind,
                    latency_us = start.elapsed().as_micros() as u64,
                    "notification_delivered"
                );
            }
            Ok(Err(e)) => {
                self.metrics.record_notification_failed();
                warn!(owner = %owner, kind, error = %e, "notification_failed");
            }
            Err(_) => {
                self.metrics.record_notification_failed();
                warn!(
                    owner = %owner,
                    kind,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "notification_timeout"
                );
            }
        }
    }
}

/// Used when delivery is switched off in config
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self, notification: Notification) {
        debug!(
            owner = %notification.owner,
            kind = notification.kind.as_str(),
            "notification_disabled"
        );
    }
}

/// Notifier that keeps every notification in memory
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent.lock().push(notification);
    }
}

/// Transport that keeps every delivered message in memory
#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<OutboundMessage>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl NotificationTransport for RecordingTransport {
    async fn deliver(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.delivered.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::NotificationPreferences;
    use crate::domain::types::{DoorSide, EventKind, OwnerId};
    use crate::infra::clock::SystemClock;
    use crate::infra::memory_store::MemoryStore;

    struct FailingTransport;

    #[async_trait]
    impl NotificationTransport for FailingTransport {
        async fn deliver(&self, _message: &OutboundMessage) -> anyhow::Result<()> {
            anyhow::bail!("broker unreachable")
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl NotificationTransport for StalledTransport {
        async fn deliver(&self, _message: &OutboundMessage) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn store_with_prefs() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put_preferences(NotificationPreferences {
            owner: OwnerId(1),
            email_enabled: true,
            animal_approach_outside: true,
            ..Default::default()
        });
        store
    }

    fn worker(
        store: Arc<MemoryStore>,
        transport: Arc<dyn NotificationTransport>,
        metrics: Arc<Metrics>,
    ) -> NotificationWorker {
        let (_tx, rx) = mpsc::channel(1);
        NotificationWorker::new(
            rx,
            store,
            transport,
            Arc::new(SystemClock),
            metrics,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_delivers_when_opted_in() {
        let transport = Arc::new(RecordingTransport::new());
        let metrics = Arc::new(Metrics::new());
        let w = worker(store_with_prefs(), transport.clone(), metrics.clone());

        w.handle(
            Notification::new(OwnerId(1), EventKind::EntryGranted)
                .with_subject(Some("Buddy".to_string()))
                .with_side(Some(DoorSide::Outside)),
        )
        .await;

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subject, "Pet Door: Buddy used the door");
        assert_eq!(metrics.report().notifications_delivered, 1);
    }

    #[tokio::test]
    async fn test_skips_opted_out_and_unknown_owner() {
        let transport = Arc::new(RecordingTransport::new());
        let w = worker(store_with_prefs(), transport.clone(), Arc::new(Metrics::new()));

        w.handle(Notification::new(OwnerId(1), EventKind::UnknownAnimal)).await;
        w.handle(Notification::new(OwnerId(2), EventKind::EntryGranted)).await;

        assert!(transport.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_contained() {
        let metrics = Arc::new(Metrics::new());
        let w = worker(store_with_prefs(), Arc::new(FailingTransport), metrics.clone());
        w.handle(Notification::new(OwnerId(1), EventKind::EntryGranted)).await;
        assert_eq!(metrics.report().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_transport_timeout_contained() {
        let metrics = Arc::new(Metrics::new());
        let w = worker(store_with_prefs(), Arc::new(StalledTransport), metrics.clone());
        w.handle(Notification::new(OwnerId(1), EventKind::EntryGranted)).await;
        assert_eq!(metrics.report().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let metrics = Arc::new(Metrics::new());
        let (sender, _rx) = create_notification_channel(1, metrics.clone());

        sender.notify(Notification::new(OwnerId(1), EventKind::AccessDenied));
        sender.notify(Notification::new(OwnerId(1), EventKind::AccessDenied));

        let summary = metrics.report();
        assert_eq!(summary.notifications_queued, 1);
        assert_eq!(summary.notifications_dropped, 1);
    }

    #[tokio::test]
    async fn test_worker_drains_on_shutdown() {
        let metrics = Arc::new(Metrics::new());
        let transport = Arc::new(RecordingTransport::new());
        let (sender, rx) = create_notification_channel(8, metrics.clone());
        let w = NotificationWorker::new(
            rx,
            store_with_prefs(),
            transport.clone(),
            Arc::new(SystemClock),
            metrics,
            Duration::from_millis(50),
        );

        sender.notify(Notification::new(OwnerId(1), EventKind::EntryGranted));
        sender.notify(Notification::new(OwnerId(1), EventKind::EntryGranted));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(transport.delivered().len(), 2);
    }
}
