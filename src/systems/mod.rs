//! Hub-side polling of agents and the per-host status machine.

use crate::alerts::AlertManager;
use crate::db::{DbError, Host, HostStatus, RecordKind, RecordTier, StatsRecord, Store};
use crate::transport::{AgentClient, FetchedSnapshot, Network};

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};

type StopChans = Arc<RwLock<HashMap<i64, broadcast::Sender<()>>>>;

/// Runs one poll loop per host and keeps the set of loops in line with the
/// hosts table.
pub struct SystemManager {
    store: Arc<Store>,
    poller: Poller,
    poll_interval: Duration,
    stop_chans: StopChans,
    stop: broadcast::Sender<()>,
}

impl SystemManager {
    pub fn new(
        store: Arc<Store>,
        alerts: Arc<AlertManager>,
        client: AgentClient,
        poll_interval: Duration,
        max_concurrent_polls: usize,
    ) -> Self {
        let (stop, _) = broadcast::channel(1);
        Self {
            poller: Poller {
                store: store.clone(),
                alerts,
                client,
                limit: Arc::new(Semaphore::new(max_concurrent_polls.max(1))),
            },
            store,
            poll_interval,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            stop,
        }
    }

    /// Start the reconcile loop. The first reconcile runs immediately.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.reconcile().await {
                            tracing::error!("SystemManager: reconcile failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the reconcile loop and every host loop.
    pub async fn stop(&self) {
        let _ = self.stop.send(());
        let mut chans = self.stop_chans.write().await;
        for (_, stop_tx) in chans.drain() {
            let _ = stop_tx.send(());
        }
    }

    /// Start loops for new hosts and stop loops whose host is gone.
    pub async fn reconcile(&self) -> Result<(), DbError> {
        let hosts = self.store.get_hosts()?;
        let ids: HashSet<i64> = hosts.iter().map(|h| h.id).collect();

        let mut chans = self.stop_chans.write().await;
        chans.retain(|id, stop_tx| {
            if ids.contains(id) {
                return true;
            }
            let _ = stop_tx.send(());
            tracing::info!("SystemManager: removed host {}", id);
            false
        });

        for host in hosts {
            if chans.contains_key(&host.id) {
                continue;
            }
            let (stop_tx, stop_rx) = broadcast::channel(1);
            chans.insert(host.id, stop_tx);
            tracing::info!("SystemManager: adding host {}", host.name);

            let poller = self.poller.clone();
            let interval = self.poll_interval;
            let stop_chans = self.stop_chans.clone();
            tokio::spawn(async move {
                let id = host.id;
                run_host_loop(poller, id, interval, stop_rx).await;
                stop_chans.write().await.remove(&id);
            });
        }
        Ok(())
    }

    /// Number of hosts with a running loop.
    pub async fn running(&self) -> usize {
        self.stop_chans.read().await.len()
    }
}

/// Poll one host on every tick until stopped or the host row disappears.
/// The poll runs inline, so a slow host delays its own next tick instead of
/// overlapping itself.
async fn run_host_loop(
    poller: Poller,
    host_id: i64,
    every: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let host = match poller.store.get_host(host_id) {
                    Ok(h) => h,
                    Err(DbError::NotFound) => break,
                    Err(e) => {
                        tracing::error!("SystemManager: reading host {} failed: {}", host_id, e);
                        continue;
                    }
                };
                if host.status == HostStatus::Paused {
                    continue;
                }
                poller.poll(&host).await;
            }
        }
    }
}

/// Everything one poll needs, shared by all host loops.
#[derive(Clone)]
pub struct Poller {
    store: Arc<Store>,
    alerts: Arc<AlertManager>,
    client: AgentClient,
    limit: Arc<Semaphore>,
}

impl Poller {
    /// Fetch one snapshot from `host` and apply the result. Returns the
    /// host's status afterwards.
    pub async fn poll(&self, host: &Host) -> HostStatus {
        let result = {
            let Ok(_permit) = self.limit.acquire().await else {
                return host.status;
            };
            self.client
                .fetch(Network::detect(&host.address), &host.agent_address(), &host.fingerprint)
                .await
        };

        let new_status = match result {
            Ok(fetched) => {
                if let Err(e) = self.save(host, &fetched, Utc::now()) {
                    tracing::error!("SystemManager: saving stats of {} failed: {}", host.name, e);
                }
                HostStatus::Up
            }
            Err(e) => {
                tracing::warn!("SystemManager: polling {} failed: {}", host.name, e);
                HostStatus::Down
            }
        };

        if new_status == host.status {
            return new_status;
        }

        // The host may have been paused while the poll was in flight.
        match self.store.get_host(host.id) {
            Ok(current) if current.status == HostStatus::Paused => return HostStatus::Paused,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("SystemManager: reading host {} failed: {}", host.name, e);
                return host.status;
            }
        }

        if let Err(e) = self.store.set_host_status(host.id, new_status) {
            tracing::error!("SystemManager: updating status of {} failed: {}", host.name, e);
            return host.status;
        }
        tracing::info!("SystemManager: {} is {} (was {})", host.name, new_status, host.status);

        if let Err(e) = self.alerts.handle_status_change(host, host.status, new_status) {
            tracing::error!("SystemManager: alert handling for {} failed: {}", host.name, e);
        }
        new_status
    }

    fn save(&self, host: &Host, fetched: &FetchedSnapshot, now: DateTime<Utc>) -> Result<(), DbError> {
        let time = now.trunc_subsecs(0);
        let snapshot = &fetched.snapshot;

        self.store.upsert_records(
            RecordKind::System,
            &[StatsRecord {
                host_id: host.id,
                tier: RecordTier::Raw,
                time,
                payload: serde_json::to_string(&snapshot.stats)?,
            }],
        )?;

        if let Some(containers) = snapshot.containers.as_ref().filter(|c| !c.is_empty()) {
            self.store.upsert_records(
                RecordKind::Container,
                &[StatsRecord {
                    host_id: host.id,
                    tier: RecordTier::Raw,
                    time,
                    payload: serde_json::to_string(containers)?,
                }],
            )?;
        }

        self.store
            .record_host_seen(host.id, &snapshot.info, &fetched.fingerprint, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentServer;
    use crate::alerts::{AlertMessage, Notifier, NotifyError};
    use crate::collector::*;
    use crate::db::AlertRule;
    use crate::stats::GpuData;
    use crate::transport::Listener;

    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    struct StaticProbe;

    impl SystemProbe for StaticProbe {
        fn host(&mut self) -> HostReading {
            HostReading {
                hostname: "agent-host".to_string(),
                cores: 2,
                ..Default::default()
            }
        }
        fn cpu_percent(&mut self) -> f64 {
            25.0
        }
        fn memory(&mut self) -> MemoryReading {
            MemoryReading::default()
        }
        fn filesystems(&mut self) -> Vec<FsReading> {
            Vec::new()
        }
        fn network(&mut self) -> Vec<NetReading> {
            Vec::new()
        }
        fn containers(&mut self) -> Option<Vec<ContainerReading>> {
            Some(vec![ContainerReading {
                name: "nginx".to_string(),
                cpu: 1.5,
                ..Default::default()
            }])
        }
        fn gpus(&mut self) -> Option<BTreeMap<String, GpuData>> {
            None
        }
        fn temperatures(&mut self) -> Option<BTreeMap<String, f64>> {
            None
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _msg: AlertMessage) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _file: NamedTempFile,
        store: Arc<Store>,
        alerts: Arc<AlertManager>,
        notifier: Arc<CountingNotifier>,
        client: AgentClient,
        stop: broadcast::Sender<()>,
        addr: String,
    }

    async fn fixture() -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let notifier = Arc::new(CountingNotifier::default());
        let alerts = Arc::new(AlertManager::new(store.clone(), notifier.clone(), "http://hub"));

        let hub_key = SigningKey::generate(&mut OsRng);
        let collector = Arc::new(Collector::new(Box::new(StaticProbe), Vec::new()));
        let server = Arc::new(AgentServer::new(
            vec![hub_key.verifying_key()],
            collector,
            "agent-fp".to_string(),
        ));
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (stop, _) = broadcast::channel(1);
        tokio::spawn(server.serve(listener, stop.subscribe()));

        Fixture {
            _file: file,
            store,
            alerts,
            notifier,
            client: AgentClient::new(Arc::new(hub_key), Duration::from_secs(2)),
            stop,
            addr,
        }
    }

    fn add_host(store: &Store, addr: &str) -> Host {
        let (ip, port) = addr.rsplit_once(':').unwrap();
        let mut host = Host {
            name: "web-1".to_string(),
            address: ip.to_string(),
            port: port.parse().unwrap(),
            ..Default::default()
        };
        store.add_host(&mut host).unwrap();
        host
    }

    fn poller(f: &Fixture) -> Poller {
        Poller {
            store: f.store.clone(),
            alerts: f.alerts.clone(),
            client: f.client.clone(),
            limit: Arc::new(Semaphore::new(4)),
        }
    }

    #[tokio::test]
    async fn test_successful_poll_records_and_pins() {
        let f = fixture().await;
        let host = add_host(&f.store, &f.addr);

        let status = poller(&f).poll(&host).await;
        assert_eq!(status, HostStatus::Up);

        let stored = f.store.get_host(host.id).unwrap();
        assert_eq!(stored.status, HostStatus::Up);
        assert_eq!(stored.fingerprint, "agent-fp");
        assert_eq!(stored.info.hostname, "agent-host");
        assert!(stored.last_seen.is_some());

        assert_eq!(
            f.store.count_records(host.id, RecordKind::System, RecordTier::Raw).unwrap(),
            1
        );
        assert_eq!(
            f.store.count_records(host.id, RecordKind::Container, RecordTier::Raw).unwrap(),
            1
        );
        let _ = f.stop.send(());
    }

    #[tokio::test]
    async fn test_unreachable_host_goes_down() {
        let f = fixture().await;
        let mut host = add_host(&f.store, &f.addr);
        let _ = f.stop.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Listener is gone; nothing answers on this port any more.
        host.status = HostStatus::Up;
        f.store.set_host_status(host.id, HostStatus::Up).unwrap();

        let status = poller(&f).poll(&host).await;
        assert_eq!(status, HostStatus::Down);
        assert_eq!(f.store.get_host(host.id).unwrap().status, HostStatus::Down);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_goes_down() {
        let f = fixture().await;
        let mut host = add_host(&f.store, &f.addr);
        f.store
            .record_host_seen(host.id, &Default::default(), "someone-else", Utc::now())
            .unwrap();
        host = f.store.get_host(host.id).unwrap();

        let status = poller(&f).poll(&host).await;
        assert_eq!(status, HostStatus::Down);
        assert_eq!(
            f.store.count_records(host.id, RecordKind::System, RecordTier::Raw).unwrap(),
            0
        );
        let _ = f.stop.send(());
    }

    #[tokio::test]
    async fn test_down_transition_schedules_alert() {
        let f = fixture().await;
        f.alerts.start();
        let mut host = add_host(&f.store, &f.addr);

        let mut user = crate::db::User {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        f.store.add_user(&mut user).unwrap();
        let mut rule = AlertRule {
            host_id: host.id,
            user_id: user.id,
            ..Default::default()
        };
        f.store.add_alert_rule(&mut rule).unwrap();

        assert_eq!(poller(&f).poll(&host).await, HostStatus::Up);
        host.status = HostStatus::Up;

        let _ = f.stop.send(());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(poller(&f).poll(&host).await, HostStatus::Down);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.alerts.pending_count(), 1);
        f.alerts.stop();
    }

    #[tokio::test]
    async fn test_new_host_failing_first_poll_then_recovering_is_silent() {
        let f = fixture().await;
        f.alerts.start();

        // A port nobody listens on.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let mut host = add_host(&f.store, &dead_addr);
        assert_eq!(host.status, HostStatus::Pending);
        let mut user = crate::db::User {
            email: "ops@example.com".to_string(),
            ..Default::default()
        };
        f.store.add_user(&mut user).unwrap();
        f.store
            .add_alert_rule(&mut AlertRule {
                host_id: host.id,
                user_id: user.id,
                min_minutes: 5,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(poller(&f).poll(&host).await, HostStatus::Down);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.alerts.pending_count(), 1);

        // The agent comes up well within the rule's five minutes.
        let (_, port) = f.addr.rsplit_once(':').unwrap();
        host = f.store.get_host(host.id).unwrap();
        host.port = port.parse().unwrap();
        f.store.update_host(&host).unwrap();

        assert_eq!(poller(&f).poll(&host).await, HostStatus::Up);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.alerts.pending_count(), 0);
        assert_eq!(f.notifier.sent.load(Ordering::SeqCst), 0);

        f.alerts.stop();
        let _ = f.stop.send(());
    }

    #[tokio::test]
    async fn test_reconcile_follows_hosts_table() {
        let f = fixture().await;
        let manager = SystemManager::new(
            f.store.clone(),
            f.alerts.clone(),
            f.client.clone(),
            Duration::from_secs(3600),
            4,
        );

        let host = add_host(&f.store, &f.addr);
        manager.reconcile().await.unwrap();
        assert_eq!(manager.running().await, 1);

        // Reconciling again does not start a second loop.
        manager.reconcile().await.unwrap();
        assert_eq!(manager.running().await, 1);

        // The first tick fires immediately and polls the host.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.store.get_host(host.id).unwrap().status, HostStatus::Up);

        f.store.delete_host(host.id).unwrap();
        manager.reconcile().await.unwrap();
        assert_eq!(manager.running().await, 0);

        manager.stop().await;
        let _ = f.stop.send(());
    }

    #[tokio::test]
    async fn test_paused_host_is_not_polled() {
        let f = fixture().await;
        let manager = SystemManager::new(
            f.store.clone(),
            f.alerts.clone(),
            f.client.clone(),
            Duration::from_secs(3600),
            4,
        );
        let host = add_host(&f.store, &f.addr);
        f.store.set_host_status(host.id, HostStatus::Paused).unwrap();

        manager.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stored = f.store.get_host(host.id).unwrap();
        assert_eq!(stored.status, HostStatus::Paused);
        assert!(stored.last_seen.is_none());
        assert!(stored.fingerprint.is_empty());

        manager.stop().await;
        let _ = f.stop.send(());
    }
}
