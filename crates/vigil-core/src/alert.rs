//! Rate-limited, out-of-band alert delivery.
//!
//! The throttle decision is made on the caller's thread. Alerts that pass are
//! handed to a dedicated dispatcher thread over a bounded channel, so a slow
//! or failing transport never blocks the capture loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::throttle::AlertThrottle;
use crate::types::{Classification, Verdict};

/// Alerts waiting for the dispatcher thread before new ones are dropped.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected with status {0}")]
    Rejected(u16),
}

/// One alert as delivered to transports.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub classification: Classification,
    pub name: String,
    /// Identifier distance; `null` in JSON when no score was produced.
    pub distance: Option<f32>,
    pub timestamp: DateTime<Utc>,
    /// Free text supplied by an external reporter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// JPEG of the face crop.
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
}

impl Alert {
    pub fn from_verdict(
        verdict: &Verdict,
        timestamp: DateTime<Utc>,
        snapshot: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            classification: verdict.classification,
            name: verdict.display_name.clone(),
            distance: verdict.distance.is_finite().then_some(verdict.distance),
            timestamp,
            notes: None,
            snapshot,
        }
    }

    pub fn subject(&self) -> String {
        match self.classification {
            Classification::Blacklisted => format!("[ALERT] Blacklisted person detected: {}", self.name),
            _ => format!("[ALERT] Face detected: {}", self.name),
        }
    }
}

/// Alert transport. Implementations bound their own latency (network
/// timeouts) and report failure through [`NotifyError`].
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Known identities never alert.
    NotAlertable,
    /// Same key alerted within the cooldown.
    Throttled,
    /// Handed to the dispatcher thread.
    Dispatched,
    /// Throttle passed but the queue was full or closed.
    Dropped,
}

pub struct AlertDispatcher {
    throttle: AlertThrottle,
    tx: Option<SyncSender<Alert>>,
    worker: Option<JoinHandle<()>>,
}

impl AlertDispatcher {
    /// Spawn the dispatcher thread delivering to every notifier in order.
    pub fn spawn(
        throttle: AlertThrottle,
        notifiers: Vec<Box<dyn Notifier>>,
        queue_depth: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Alert>(queue_depth.max(1));
        let worker = std::thread::Builder::new()
            .name("vigil-alerts".into())
            .spawn(move || deliver_loop(rx, notifiers))?;

        Ok(Self {
            throttle,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn throttle(&self) -> &AlertThrottle {
        &self.throttle
    }

    /// Apply alert policy and throttle to `verdict`, enqueueing an alert when
    /// both pass. The throttle is updated before the hand-off, so a dropped or
    /// failed delivery is not retried within the same cooldown.
    ///
    /// `snapshot` is only invoked when an alert is actually enqueued.
    pub fn submit<F>(
        &self,
        verdict: &Verdict,
        now: Instant,
        timestamp: DateTime<Utc>,
        snapshot: F,
    ) -> DispatchOutcome
    where
        F: FnOnce() -> Option<Vec<u8>>,
    {
        if !verdict.is_alertable() {
            return DispatchOutcome::NotAlertable;
        }
        if !self.throttle.should_notify(verdict.throttle_key(), now) {
            return DispatchOutcome::Throttled;
        }

        if self.tx.is_none() {
            return DispatchOutcome::Dropped;
        }

        tracing::debug!(name = %verdict.display_name, classification = %verdict.classification, "alert queued");
        self.enqueue(Alert::from_verdict(verdict, timestamp, snapshot()))
    }

    /// Hand `alert` to the dispatcher thread without consulting policy or
    /// throttle. Used for alerts reported by an external source.
    pub fn enqueue(&self, alert: Alert) -> DispatchOutcome {
        let Some(tx) = &self.tx else {
            return DispatchOutcome::Dropped;
        };

        match tx.try_send(alert) {
            Ok(()) => DispatchOutcome::Dispatched,
            Err(TrySendError::Full(alert)) => {
                tracing::warn!(alert_id = %alert.id, name = %alert.name, "alert queue full; dropping alert");
                DispatchOutcome::Dropped
            }
            Err(TrySendError::Disconnected(alert)) => {
                tracing::warn!(alert_id = %alert.id, "alert dispatcher stopped; dropping alert");
                DispatchOutcome::Dropped
            }
        }
    }

    /// Close the queue and wait for in-flight deliveries to finish.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("alert dispatcher thread panicked");
            }
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver_loop(rx: Receiver<Alert>, notifiers: Vec<Box<dyn Notifier>>) {
    tracing::info!(transports = notifiers.len(), "alert dispatcher started");
    for alert in rx {
        for notifier in &notifiers {
            let started = Instant::now();
            match notifier.notify(&alert) {
                Ok(()) => tracing::info!(
                    transport = notifier.name(),
                    alert_id = %alert.id,
                    name = %alert.name,
                    classification = %alert.classification,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "alert delivered"
                ),
                Err(err) => tracing::warn!(
                    transport = notifier.name(),
                    alert_id = %alert.id,
                    error = %err,
                    "alert delivery failed"
                ),
            }
        }
    }
    tracing::info!("alert dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityId;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        alerts: Arc<Mutex<Vec<Alert>>>,
    }

    impl Notifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Failing;

    impl Notifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Transport("connection refused".into()))
        }
    }

    struct Slow(Duration);

    impl Notifier for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn notify(&self, _alert: &Alert) -> Result<(), NotifyError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    fn known() -> Verdict {
        Verdict {
            classification: Classification::Known,
            display_name: "alice".into(),
            distance: 30.0,
            identity: Some(IdentityId(0)),
        }
    }

    fn blacklisted() -> Verdict {
        Verdict {
            classification: Classification::Blacklisted,
            display_name: "mallory".into(),
            distance: 20.0,
            identity: Some(IdentityId(3)),
        }
    }

    #[test]
    fn test_known_never_alerts() {
        let recorder = Recorder::default();
        let dispatcher =
            AlertDispatcher::spawn(AlertThrottle::default(), vec![Box::new(recorder.clone())], 4)
                .unwrap();

        let outcome = dispatcher.submit(&known(), Instant::now(), Utc::now(), || None);
        assert_eq!(outcome, DispatchOutcome::NotAlertable);
        assert_eq!(dispatcher.throttle().tracked_keys(), 0);

        dispatcher.shutdown();
        assert!(recorder.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_one_alert_per_cooldown() {
        let recorder = Recorder::default();
        let dispatcher = AlertDispatcher::spawn(
            AlertThrottle::new(Duration::from_secs(10)),
            vec![Box::new(recorder.clone())],
            4,
        )
        .unwrap();

        let t0 = Instant::now();
        let outcomes: Vec<_> = (0..20)
            .map(|i| {
                dispatcher.submit(
                    &Verdict::unknown(90.0),
                    t0 + Duration::from_millis(i * 100),
                    Utc::now(),
                    || None,
                )
            })
            .collect();

        assert_eq!(outcomes[0], DispatchOutcome::Dispatched);
        assert!(outcomes[1..].iter().all(|o| *o == DispatchOutcome::Throttled));

        dispatcher.shutdown();
        let alerts = recorder.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "Unknown");
        assert_eq!(alerts[0].distance, Some(90.0));
    }

    #[test]
    fn test_snapshot_only_built_when_dispatching() {
        let dispatcher = AlertDispatcher::spawn(AlertThrottle::default(), Vec::new(), 4).unwrap();
        let t0 = Instant::now();
        let mut built = 0;

        dispatcher.submit(&blacklisted(), t0, Utc::now(), || {
            built += 1;
            Some(vec![0xFF, 0xD8])
        });
        dispatcher.submit(&blacklisted(), t0, Utc::now(), || {
            built += 1;
            None
        });
        dispatcher.submit(&known(), t0, Utc::now(), || {
            built += 1;
            None
        });

        assert_eq!(built, 1);
    }

    #[test]
    fn test_failing_transport_does_not_block_others() {
        let recorder = Recorder::default();
        let dispatcher = AlertDispatcher::spawn(
            AlertThrottle::default(),
            vec![Box::new(Failing), Box::new(recorder.clone())],
            4,
        )
        .unwrap();

        assert_eq!(
            dispatcher.submit(&blacklisted(), Instant::now(), Utc::now(), || None),
            DispatchOutcome::Dispatched
        );
        dispatcher.shutdown();

        let alerts = recorder.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].classification, Classification::Blacklisted);
        assert!(alerts[0].subject().contains("mallory"));
    }

    #[test]
    fn test_slow_transport_does_not_block_submit() {
        let dispatcher = AlertDispatcher::spawn(
            AlertThrottle::new(Duration::ZERO),
            vec![Box::new(Slow(Duration::from_millis(300)))],
            1,
        )
        .unwrap();

        let started = Instant::now();
        let outcomes: Vec<_> = (0..5)
            .map(|_| dispatcher.submit(&Verdict::unknown(80.0), Instant::now(), Utc::now(), || None))
            .collect();
        assert!(started.elapsed() < Duration::from_millis(200));

        assert_eq!(outcomes[0], DispatchOutcome::Dispatched);
        assert!(outcomes.contains(&DispatchOutcome::Dropped));
    }

    #[test]
    fn test_enqueue_bypasses_throttle() {
        let recorder = Recorder::default();
        let dispatcher = AlertDispatcher::spawn(
            AlertThrottle::new(Duration::from_secs(60)),
            vec![Box::new(recorder.clone())],
            4,
        )
        .unwrap();

        let mut alert = Alert::from_verdict(&blacklisted(), Utc::now(), None);
        alert.notes = Some("seen at the loading dock".into());
        assert_eq!(dispatcher.enqueue(alert.clone()), DispatchOutcome::Dispatched);
        assert_eq!(dispatcher.enqueue(alert), DispatchOutcome::Dispatched);
        assert_eq!(dispatcher.throttle().tracked_keys(), 0);

        dispatcher.shutdown();
        let alerts = recorder.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].notes.as_deref(), Some("seen at the loading dock"));
    }

    #[test]
    fn test_alert_json_omits_snapshot() {
        let alert = Alert::from_verdict(&Verdict::unknown(f32::INFINITY), Utc::now(), Some(vec![1, 2, 3]));
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["classification"], "unknown");
        assert!(json["distance"].is_null());
        assert!(json.get("snapshot").is_none());
        assert!(json.get("notes").is_none());
    }
}
