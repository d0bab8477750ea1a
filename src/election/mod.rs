//! Lease-based leader election over a shared transactional store.
//!
//! Every peer runs one [`ElectionStateMachine`] per election key. Peers never
//! talk to each other: the version column of the election record is the only
//! arbiter, and a leader keeps its lease by bumping that version every tick.

pub mod events;
pub mod lease;
pub mod machine;
pub mod manager;
pub mod sqlite;
pub mod store;

pub use events::{BroadcastEventSink, LeaderChangeEvent, LeadershipEventSink};
pub use lease::{Clock, SystemClock};
pub use machine::{ElectionStateMachine, Role, TickOutcome, Transition};
pub use manager::ElectionManager;
pub use sqlite::SqliteElectionStore;
pub use store::{ElectionRecord, ElectionStore, ElectionView, LeaseStatus};
