use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::watch,
    task,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{error, info};

use super::{
    events::{LeaderChangeEvent, LeadershipEventSink},
    store::ElectionStore,
};
use crate::{config::ElectionConfig, error::Result};

/// Flags shared between a running state machine and the manager.
/// Only the state machine writes `leader`; only the manager raises `release`.
#[derive(Debug, Default)]
pub struct ElectionFlags {
    leader: AtomicBool,
    release: AtomicBool,
}

impl ElectionFlags {
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub fn signal_release(&self) {
        self.release.store(true, Ordering::Release);
    }

    fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }

    fn take_release_signal(&self) -> bool {
        self.release
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// What one tick observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Abstained because a voluntary release is still cooling down.
    CoolingDown,
    /// A leader consumed a release signal.
    Released,
    HeartbeatApplied,
    /// The dead-check itself failed; nothing is known this tick.
    LeaseCheckFailed,
    /// The lease is unexpired and held by `leader` (possibly nobody).
    LeaseHeld { leader: String },
    ElectionWon,
    /// The lease had expired but another peer's CAS landed first.
    ElectionLost,
    ElectionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stay,
    BecomeLeader,
    BecomeFollower(String),
}

/// Maps a tick's outcome onto the next role.
///
/// A leader whose heartbeat fails is not demoted by the heartbeat itself;
/// its demotion is decided by the dead-check outcome that follows in the
/// same tick. A failed or lost dead-check/election leaves the role alone.
pub fn next_transition(
    role: Role,
    known_leader: &str,
    identity: &str,
    outcome: &TickOutcome,
) -> Transition {
    match (role, outcome) {
        (Role::Leader, TickOutcome::Released) => Transition::BecomeFollower(String::new()),
        (_, TickOutcome::LeaseHeld { leader }) if leader == identity => Transition::BecomeLeader,
        (_, TickOutcome::LeaseHeld { leader }) if leader != known_leader => {
            Transition::BecomeFollower(leader.clone())
        }
        (_, TickOutcome::ElectionWon) => Transition::BecomeLeader,
        (
            _,
            TickOutcome::CoolingDown
            | TickOutcome::Released
            | TickOutcome::HeartbeatApplied
            | TickOutcome::LeaseCheckFailed
            | TickOutcome::LeaseHeld { .. }
            | TickOutcome::ElectionLost
            | TickOutcome::ElectionFailed,
        ) => Transition::Stay,
    }
}

pub struct ElectionStateMachine {
    elect_key: String,
    identity: String,
    store: Arc<dyn ElectionStore>,
    sink: Arc<dyn LeadershipEventSink>,
    flags: Arc<ElectionFlags>,
    /// Last version this instance wrote or adopted.
    version: i64,
    known_leader: String,
    release_tick_limit: u32,
    cooldown_ticks: u32,
    tick_period: Duration,
    lease_duration: Duration,
}

impl ElectionStateMachine {
    pub fn new(
        elect_key: impl Into<String>,
        config: &ElectionConfig,
        store: Arc<dyn ElectionStore>,
        sink: Arc<dyn LeadershipEventSink>,
    ) -> Self {
        Self {
            elect_key: elect_key.into(),
            identity: config.identity.clone(),
            store,
            sink,
            flags: Arc::new(ElectionFlags::default()),
            version: 0,
            known_leader: String::new(),
            release_tick_limit: 0,
            cooldown_ticks: config.release_tick_limit(),
            tick_period: config.tick_period,
            lease_duration: config.lease_duration,
        }
    }

    pub fn flags(&self) -> Arc<ElectionFlags> {
        self.flags.clone()
    }

    pub fn role(&self) -> Role {
        if self.flags.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    pub fn known_leader(&self) -> &str {
        &self.known_leader
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Runs ticks until `cancel` flips to `true` or its sender goes away.
    ///
    /// Store calls block, so each tick runs on the blocking pool with the
    /// machine moved in and handed back afterwards.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        let key = self.elect_key.clone();
        let flags = self.flags.clone();
        info!(key = %key, "leader election started");

        let mut ticker = time::interval_at(Instant::now() + self.tick_period, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut machine = Some(self);

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(mut current) = machine.take() else {
                        break;
                    };
                    match task::spawn_blocking(move || {
                        current.tick();
                        current
                    })
                    .await
                    {
                        Ok(current) => machine = Some(current),
                        Err(err) => {
                            error!(key = %key, error = %err, "leader election tick aborted");
                            break;
                        }
                    }
                }
            }
        }

        info!(key = %key, "leader election stopped");
        match machine {
            Some(mut machine) => machine.apply(Transition::BecomeFollower(String::new())),
            None => flags.set_leader(false),
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.evaluate();
        let transition =
            next_transition(self.role(), &self.known_leader, &self.identity, &outcome);
        self.apply(transition);

        if outcome == TickOutcome::Released {
            self.release_tick_limit = self.cooldown_ticks;
        }

        outcome
    }

    fn evaluate(&mut self) -> TickOutcome {
        if self.release_tick_limit > 0 {
            self.release_tick_limit -= 1;
            info!(key = %self.elect_key, remaining = self.release_tick_limit, "abandon leader election in this tick");
            return TickOutcome::CoolingDown;
        }

        let should_release = self.flags.take_release_signal();

        if self.flags.is_leader() {
            if should_release {
                info!(key = %self.elect_key, "release leader election");
                return TickOutcome::Released;
            }

            match self.heartbeat() {
                Ok(true) => return TickOutcome::HeartbeatApplied,
                Ok(false) => {
                    info!(key = %self.elect_key, version = self.version, "leader heartbeat abort, re-checking lease");
                }
                Err(err) => {
                    error!(key = %self.elect_key, error = %err, "leader heartbeat failed, re-checking lease");
                }
            }
        }

        let status = match self.store.check_lease_expired(&self.elect_key, self.lease_duration) {
            Ok(status) => status,
            Err(err) => {
                error!(key = %self.elect_key, error = %err, "check leader dead failed, keeping current state");
                return TickOutcome::LeaseCheckFailed;
            }
        };

        if !status.expired {
            if status.leader == self.identity {
                // Our own unexpired claim; heartbeat from the version we just saw.
                self.version = status.version;
            }
            return TickOutcome::LeaseHeld {
                leader: status.leader,
            };
        }

        match self.elect() {
            Ok(true) => TickOutcome::ElectionWon,
            Ok(false) => {
                info!(key = %self.elect_key, "lost leader election race");
                TickOutcome::ElectionLost
            }
            Err(err) => {
                error!(key = %self.elect_key, error = %err, "elect leader failed, keeping current state");
                TickOutcome::ElectionFailed
            }
        }
    }

    fn heartbeat(&mut self) -> Result<bool> {
        let applied = self.store.compare_and_swap(
            &self.elect_key,
            self.version,
            self.version + 1,
            &self.identity,
        )?;
        if applied {
            self.version += 1;
        }
        Ok(applied)
    }

    fn elect(&mut self) -> Result<bool> {
        let current = self.store.get_version(&self.elect_key)?;
        let applied =
            self.store
                .compare_and_swap(&self.elect_key, current, current + 1, &self.identity)?;
        if applied {
            self.version = current + 1;
        }
        Ok(applied)
    }

    fn apply(&mut self, transition: Transition) {
        match transition {
            Transition::Stay => {}
            Transition::BecomeLeader => {
                let identity = self.identity.clone();
                self.change_role(true, identity);
            }
            Transition::BecomeFollower(leader) => self.change_role(false, leader),
        }
    }

    fn change_role(&mut self, is_leader: bool, leader: String) {
        if self.flags.is_leader() == is_leader && self.known_leader == leader {
            return;
        }

        if is_leader {
            info!(key = %self.elect_key, version = self.version, "change from follower to leader");
        } else {
            info!(key = %self.elect_key, leader = %leader, "change to follower");
        }

        self.flags.set_leader(is_leader);
        self.known_leader = leader;
        self.sink.publish(LeaderChangeEvent {
            key: self.elect_key.clone(),
            is_leader,
            leader_host: self.known_leader.clone(),
        });
    }
}
