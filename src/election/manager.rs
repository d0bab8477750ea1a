use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use super::{
    events::LeadershipEventSink,
    machine::{ElectionFlags, ElectionStateMachine},
    store::{ElectionStore, ElectionView},
};
use crate::{
    config::ElectionConfig,
    error::{ElectionError, Result},
};

struct ElectionHandle {
    flags: Arc<ElectionFlags>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of the elections this process takes part in.
///
/// Built once at startup and shared by reference; `stop_leader_elections`
/// drains it at shutdown.
pub struct ElectionManager {
    store: Arc<dyn ElectionStore>,
    sink: Arc<dyn LeadershipEventSink>,
    config: ElectionConfig,
    elections: Mutex<HashMap<String, ElectionHandle>>,
}

impl ElectionManager {
    pub fn new(
        store: Arc<dyn ElectionStore>,
        sink: Arc<dyn LeadershipEventSink>,
        config: ElectionConfig,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            sink,
            config,
            elections: Mutex::new(HashMap::new()),
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    fn elections(&self) -> MutexGuard<'_, HashMap<String, ElectionHandle>> {
        // The map stays consistent even if a holder panicked.
        self.elections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the election for `key`. Must be called from within a tokio runtime.
    pub fn start_leader_election(&self, key: &str) -> Result<()> {
        let mut elections = self.elections();
        if elections.contains_key(key) {
            return Ok(());
        }

        self.store.create_election(key)?;

        let machine =
            ElectionStateMachine::new(key, &self.config, self.store.clone(), self.sink.clone());
        let flags = machine.flags();
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(machine.run(cancel_rx));

        elections.insert(
            key.to_string(),
            ElectionHandle {
                flags,
                cancel,
                task,
            },
        );
        info!(key, identity = %self.config.identity, "joined leader election");

        Ok(())
    }

    /// Cancels every running election and waits for their final tick to finish.
    pub async fn stop_leader_elections(&self) {
        let stopped: Vec<(String, ElectionHandle)> = {
            let mut elections = self.elections();
            for handle in elections.values() {
                let _ = handle.cancel.send(true);
            }
            elections.drain().collect()
        };

        for (key, handle) in stopped {
            if let Err(err) = handle.task.await {
                warn!(key = %key, error = %err, "leader election task ended abnormally");
            }
        }
    }

    /// Local, possibly stale view; never touches the store.
    pub fn is_leader(&self, key: &str) -> bool {
        self.elections()
            .get(key)
            .map(|handle| handle.flags.is_leader())
            .unwrap_or(false)
    }

    /// Asks the local state machine to step down on its next tick.
    pub fn release_leader_election(&self, key: &str) -> Result<()> {
        let elections = self.elections();
        let handle = elections
            .get(key)
            .ok_or_else(|| ElectionError::NotStarted(key.to_string()))?;
        handle.flags.signal_release();
        info!(key, "leader election release requested");

        Ok(())
    }

    pub fn list_leader_elections(&self) -> Result<Vec<ElectionView>> {
        self.store.list_elections(self.config.lease_duration)
    }

    pub fn started_elections(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.elections().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, Instant};

    use super::*;
    use crate::election::{
        events::{BroadcastEventSink, LeaderChangeEvent},
        lease::SystemClock,
        sqlite::SqliteElectionStore,
    };

    const KEY: &str = "svc-controller";

    fn fast_config(identity: &str) -> ElectionConfig {
        ElectionConfig {
            identity: identity.to_string(),
            tick_period: Duration::from_millis(20),
            lease_duration: Duration::from_millis(100),
            release_cooldown_multiplier: 3,
        }
    }

    fn shared_store() -> Arc<SqliteElectionStore> {
        Arc::new(SqliteElectionStore::open_in_memory(Arc::new(SystemClock)).unwrap())
    }

    fn manager(
        store: &Arc<SqliteElectionStore>,
        sink: &Arc<BroadcastEventSink>,
        identity: &str,
    ) -> ElectionManager {
        ElectionManager::new(store.clone(), sink.clone(), fast_config(identity)).unwrap()
    }

    async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ElectionConfig {
            lease_duration: Duration::from_millis(30),
            ..fast_config("A")
        };
        let result = ElectionManager::new(
            shared_store(),
            Arc::new(BroadcastEventSink::new()),
            config,
        );
        assert!(matches!(result, Err(ElectionError::InvalidConfig(_))));

        let overflowing = ElectionConfig {
            release_cooldown_multiplier: u32::MAX,
            ..fast_config("A")
        };
        let result = ElectionManager::new(
            shared_store(),
            Arc::new(BroadcastEventSink::new()),
            overflowing,
        );
        assert!(matches!(result, Err(ElectionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn unknown_keys() {
        let manager = manager(&shared_store(), &Arc::new(BroadcastEventSink::new()), "A");

        assert!(!manager.is_leader("missing"));
        assert!(matches!(
            manager.release_leader_election("missing"),
            Err(ElectionError::NotStarted(key)) if key == "missing"
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let store = shared_store();
        let manager = manager(&store, &Arc::new(BroadcastEventSink::new()), "A");

        manager.start_leader_election(KEY).unwrap();
        manager.start_leader_election(KEY).unwrap();
        assert_eq!(manager.started_elections(), vec![KEY.to_string()]);

        let views = manager.list_leader_elections().unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].key, KEY);

        manager.stop_leader_elections().await;
        assert!(manager.started_elections().is_empty());
    }

    #[tokio::test]
    async fn single_peer_becomes_leader_and_steps_down_on_stop() {
        let store = shared_store();
        let sink = Arc::new(BroadcastEventSink::new());
        let mut events = sink.subscribe();
        let manager = manager(&store, &sink, "A");

        manager.start_leader_election(KEY).unwrap();
        assert!(wait_until(Duration::from_secs(2), || manager.is_leader(KEY)).await);

        let views = manager.list_leader_elections().unwrap();
        assert_eq!(views[0].leader, "A");
        assert!(views[0].valid);

        manager.stop_leader_elections().await;
        assert!(!manager.is_leader(KEY));

        let first = events.recv().await.unwrap();
        assert_eq!(
            first,
            LeaderChangeEvent {
                key: KEY.to_string(),
                is_leader: true,
                leader_host: "A".to_string(),
            }
        );
        let last = events.recv().await.unwrap();
        assert!(!last.is_leader);
        assert_eq!(last.leader_host, "");
    }

    #[tokio::test]
    async fn survivor_takes_over_after_leader_stops() {
        let store = shared_store();
        let sink = Arc::new(BroadcastEventSink::new());
        let a = manager(&store, &sink, "A");
        let b = manager(&store, &sink, "B");

        a.start_leader_election(KEY).unwrap();
        assert!(wait_until(Duration::from_secs(2), || a.is_leader(KEY)).await);

        b.start_leader_election(KEY).unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(!b.is_leader(KEY));

        a.stop_leader_elections().await;
        assert!(wait_until(Duration::from_secs(2), || b.is_leader(KEY)).await);

        let views = b.list_leader_elections().unwrap();
        assert_eq!(views[0].leader, "B");

        b.stop_leader_elections().await;
    }

    #[tokio::test]
    async fn release_hands_leadership_to_another_peer() {
        let store = shared_store();
        let sink = Arc::new(BroadcastEventSink::new());
        let a = manager(&store, &sink, "A");
        let b = manager(&store, &sink, "B");

        a.start_leader_election(KEY).unwrap();
        assert!(wait_until(Duration::from_secs(2), || a.is_leader(KEY)).await);
        b.start_leader_election(KEY).unwrap();

        a.release_leader_election(KEY).unwrap();
        assert!(wait_until(Duration::from_secs(2), || !a.is_leader(KEY)).await);
        assert!(wait_until(Duration::from_secs(2), || b.is_leader(KEY)).await);
        assert!(!a.is_leader(KEY));

        a.stop_leader_elections().await;
        b.stop_leader_elections().await;
    }

    #[tokio::test]
    async fn locked_database_does_not_stall_the_runtime() {
        let dir = std::env::temp_dir().join(format!(
            "leasehold-manager-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("elections.db");

        let store = Arc::new(SqliteElectionStore::open(&path, Arc::new(SystemClock)).unwrap());
        let sink = Arc::new(BroadcastEventSink::new());
        let a = manager(&store, &sink, "A");
        a.start_leader_election(KEY).unwrap();
        assert!(wait_until(Duration::from_secs(2), || a.is_leader(KEY)).await);

        // Another process grabs the write lock; heartbeats now wait on busy_timeout.
        let other = rusqlite::Connection::open(&path).unwrap();
        other.busy_timeout(Duration::from_secs(5)).unwrap();
        other.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = Instant::now();
        sleep(Duration::from_millis(50)).await;
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "50ms sleep took {elapsed:?}");

        other.execute_batch("ROLLBACK").unwrap();
        drop(other);
        a.stop_leader_elections().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
