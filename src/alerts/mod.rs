//! Connectivity alerts with delayed, cancellable down notifications.
//!
//! A host going down schedules one [`PendingAlert`] per status rule. The
//! entry fires when a sweep finds it expired, or disappears silently if the
//! host recovers first. A recovery with nothing pending means the down
//! alert already went out, so an "up" notification follows.

mod notify;

pub use notify::*;

use crate::db::{AlertRule, DbError, Host, HostStatus, Store};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Period of the expiry sweep. Off the minute so it rarely lines up with
/// polling and record maintenance.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(13);

/// Added to every rule's minimum so a single slow poll cannot fire an alert.
pub const ALERT_BUFFER: Duration = Duration::from_secs(10);

/// Delay between a host going down and its alert firing.
pub fn alert_delay(min_minutes: i64) -> Duration {
    Duration::from_secs(min_minutes.max(1) as u64 * 60) + ALERT_BUFFER
}

/// A scheduled down notification.
#[derive(Debug, Clone)]
pub struct PendingAlert {
    pub host_name: String,
    pub rule: AlertRule,
    pub expires: Instant,
}

#[derive(Debug)]
enum AlertTask {
    Schedule {
        host_name: String,
        rule: AlertRule,
        delay: Duration,
    },
    /// Drop the pending entry, or announce recovery if there is none.
    Cancel { host_name: String, rule: AlertRule },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlertStatus {
    Up,
    Down,
}

type PendingMap = Arc<Mutex<HashMap<i64, PendingAlert>>>;

/// Owns the pending-alert map and the worker that drives it.
pub struct AlertManager {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    app_url: String,
    pending: PendingMap,
    queue: mpsc::UnboundedSender<AlertTask>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<AlertTask>>>,
    stop: broadcast::Sender<()>,
}

impl AlertManager {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>, app_url: &str) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (stop, _) = broadcast::channel(1);
        Self {
            store,
            notifier,
            app_url: app_url.trim_end_matches('/').to_string(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            stop,
        }
    }

    /// Start the worker. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.queue_rx.lock().take() else {
            return;
        };
        let worker = Worker {
            pending: self.pending.clone(),
            notifier: self.notifier.clone(),
            app_url: self.app_url.clone(),
        };
        tokio::spawn(worker.run(rx, self.stop.subscribe()));
    }

    /// Stop the worker. Pending alerts are dropped.
    pub fn stop(&self) {
        let _ = self.stop.send(());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// React to a host status transition. Going down from up or pending
    /// schedules, down to up cancels. Anything involving paused is ignored.
    pub fn handle_status_change(
        &self,
        host: &Host,
        old: HostStatus,
        new: HostStatus,
    ) -> Result<(), DbError> {
        let going_down = match (old, new) {
            (HostStatus::Up | HostStatus::Pending, HostStatus::Down) => true,
            (HostStatus::Down, HostStatus::Up) => false,
            _ => return Ok(()),
        };

        let rules = self.store.get_status_alert_rules(host.id)?;
        if rules.is_empty() {
            return Ok(());
        }

        for rule in rules {
            let task = if going_down {
                if self.pending.lock().contains_key(&rule.id) {
                    continue;
                }
                AlertTask::Schedule {
                    host_name: host.name.clone(),
                    delay: alert_delay(rule.min_minutes),
                    rule,
                }
            } else {
                AlertTask::Cancel {
                    host_name: host.name.clone(),
                    rule,
                }
            };

            if self.queue.send(task).is_err() {
                tracing::warn!("Alert worker is not running, dropping task for {}", host.name);
            }
        }
        Ok(())
    }

    /// Send a test notification straight to `url`.
    pub async fn send_test_notification(&self, notifier: &WebhookNotifier, url: &str) -> Result<(), NotifyError> {
        let msg = AlertMessage {
            user_id: 0,
            title: "Test Alert".to_string(),
            message: "This is a notification from fleetwatch.".to_string(),
            link: app_link(&self.app_url, &["settings", "notifications"]),
            link_text: "View fleetwatch settings".to_string(),
        };
        notifier.send_to_url(url, &msg).await
    }
}

struct Worker {
    pending: PendingMap,
    notifier: Arc<dyn Notifier>,
    app_url: String,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<AlertTask>,
        mut stop: broadcast::Receiver<()>,
    ) {
        let mut sweep = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("AlertManager: stopping");
                    break;
                }
                task = rx.recv() => match task {
                    Some(task) => self.apply(task),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }
    }

    fn apply(&self, task: AlertTask) {
        match task {
            AlertTask::Schedule {
                host_name,
                rule,
                delay,
            } => {
                let mut pending = self.pending.lock();
                if pending.contains_key(&rule.id) {
                    return;
                }
                tracing::debug!("Scheduling down alert for {} in {:?}", host_name, delay);
                pending.insert(
                    rule.id,
                    PendingAlert {
                        host_name,
                        rule,
                        expires: Instant::now() + delay,
                    },
                );
            }
            AlertTask::Cancel { host_name, rule } => {
                let removed = self.pending.lock().remove(&rule.id);
                if removed.is_some() {
                    tracing::debug!("{} recovered before alert {} fired", host_name, rule.id);
                } else {
                    self.notify(AlertStatus::Up, &host_name, &rule);
                }
            }
        }
    }

    fn sweep(&self, now: Instant) {
        let expired: Vec<PendingAlert> = {
            let mut pending = self.pending.lock();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, p)| now > p.expires)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        for alert in expired {
            self.notify(AlertStatus::Down, &alert.host_name, &alert.rule);
        }
    }

    /// Build the message and deliver it off the worker loop.
    fn notify(&self, status: AlertStatus, host_name: &str, rule: &AlertRule) {
        let msg = status_message(status, host_name, rule.user_id, &self.app_url);
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let title = msg.title.clone();
            if let Err(e) = notifier.send(msg).await {
                tracing::error!("Failed to send alert {:?}: {}", title, e);
            }
        });
    }
}

fn status_message(status: AlertStatus, host_name: &str, user_id: i64, app_url: &str) -> AlertMessage {
    let (word, emoji) = match status {
        AlertStatus::Up => ("up", "\u{2705}"),
        AlertStatus::Down => ("down", "\u{1F534}"),
    };
    let message = format!("Connection to {} is {}", host_name, word);
    AlertMessage {
        user_id,
        title: format!("{} {}", message, emoji),
        message,
        link: app_link(app_url, &["system", host_name]),
        link_text: format!("View {}", host_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<AlertMessage>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, msg: AlertMessage) -> Result<(), NotifyError> {
            self.sent.lock().push(msg);
            Ok(())
        }
    }

    impl RecordingNotifier {
        fn titles(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.title.clone()).collect()
        }
    }

    struct Fixture {
        manager: AlertManager,
        notifier: Arc<RecordingNotifier>,
        host: Host,
        _file: NamedTempFile,
    }

    fn fixture(min_minutes: i64) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());

        let mut host = Host {
            name: "web 1".to_string(),
            address: "10.0.0.5".to_string(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap();
        let mut user = crate::db::User {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        store.add_user(&mut user).unwrap();
        store
            .add_alert_rule(&mut AlertRule {
                host_id: host.id,
                user_id: user.id,
                min_minutes,
                ..Default::default()
            })
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let manager = AlertManager::new(store, notifier.clone(), "https://hub.example.com/");
        manager.start();

        Fixture {
            manager,
            notifier,
            host,
            _file: file,
        }
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn test_alert_delay() {
        assert_eq!(alert_delay(5), Duration::from_secs(310));
        assert_eq!(alert_delay(0), Duration::from_secs(70));
        assert_eq!(alert_delay(-3), Duration::from_secs(70));
    }

    #[test]
    fn test_status_message() {
        let msg = status_message(AlertStatus::Down, "web 1", 3, "https://hub.example.com");
        assert_eq!(msg.title, "Connection to web 1 is down \u{1F534}");
        assert_eq!(msg.message, "Connection to web 1 is down");
        assert_eq!(msg.link, "https://hub.example.com/system/web%201");
        assert_eq!(msg.link_text, "View web 1");
        assert_eq!(msg.user_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_outage_is_silent() {
        let f = fixture(5);

        f.manager
            .handle_status_change(&f.host, HostStatus::Up, HostStatus::Down)
            .unwrap();
        sleep_secs(4 * 60 + 59).await;
        assert_eq!(f.manager.pending_count(), 1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Up)
            .unwrap();
        sleep_secs(600).await;

        assert_eq!(f.manager.pending_count(), 0);
        assert!(f.notifier.titles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_outage_fires_down_then_up() {
        let f = fixture(1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Up, HostStatus::Down)
            .unwrap();
        sleep_secs(60).await;
        assert!(f.notifier.titles().is_empty());

        // Expiry at 70s, caught by the 78s sweep.
        sleep_secs(20).await;
        assert_eq!(f.notifier.titles(), vec!["Connection to web 1 is down \u{1F534}"]);
        assert_eq!(f.manager.pending_count(), 0);

        sleep_secs(300 - 80).await;
        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Up)
            .unwrap();
        sleep_secs(1).await;

        assert_eq!(
            f.notifier.titles(),
            vec![
                "Connection to web 1 is down \u{1F534}",
                "Connection to web 1 is up \u{2705}"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent() {
        let f = fixture(5);

        for _ in 0..3 {
            f.manager
                .handle_status_change(&f.host, HostStatus::Up, HostStatus::Down)
                .unwrap();
        }
        sleep_secs(1).await;
        assert_eq!(f.manager.pending_count(), 1);

        sleep_secs(400).await;
        assert_eq!(f.notifier.titles().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_failure_short_outage_is_silent() {
        let f = fixture(5);

        f.manager
            .handle_status_change(&f.host, HostStatus::Pending, HostStatus::Down)
            .unwrap();
        sleep_secs(30).await;
        assert_eq!(f.manager.pending_count(), 1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Up)
            .unwrap();
        sleep_secs(600).await;

        assert_eq!(f.manager.pending_count(), 0);
        assert!(f.notifier.titles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_failure_long_outage_fires_down_then_up() {
        let f = fixture(1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Pending, HostStatus::Down)
            .unwrap();
        sleep_secs(80).await;
        assert_eq!(f.notifier.titles(), vec!["Connection to web 1 is down \u{1F534}"]);

        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Up)
            .unwrap();
        sleep_secs(1).await;

        assert_eq!(
            f.notifier.titles(),
            vec![
                "Connection to web 1 is down \u{1F534}",
                "Connection to web 1 is up \u{2705}"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_transitions_are_ignored() {
        let f = fixture(1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Paused, HostStatus::Up)
            .unwrap();
        f.manager
            .handle_status_change(&f.host, HostStatus::Up, HostStatus::Paused)
            .unwrap();
        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Paused)
            .unwrap();
        sleep_secs(120).await;

        assert_eq!(f.manager.pending_count(), 0);
        assert!(f.notifier.titles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_flap_before_worker_runs_is_silent() {
        let f = fixture(1);

        // Both tasks are queued before the worker sees either one.
        f.manager
            .handle_status_change(&f.host, HostStatus::Up, HostStatus::Down)
            .unwrap();
        f.manager
            .handle_status_change(&f.host, HostStatus::Down, HostStatus::Up)
            .unwrap();
        sleep_secs(300).await;

        assert!(f.notifier.titles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drops_pending() {
        let f = fixture(1);

        f.manager
            .handle_status_change(&f.host, HostStatus::Up, HostStatus::Down)
            .unwrap();
        sleep_secs(1).await;
        f.manager.stop();
        sleep_secs(300).await;

        assert!(f.notifier.titles().is_empty());
    }
}
