//! A replicated state machine built on the Raft consensus protocol.
//!
//! A fixed cluster of `N` peers elects a leader; clients submit opaque
//! payloads through the leader's `Save` RPC; the leader appends them to its
//! [`raft_log::LogStore`] and replicates to followers; once a majority has
//! durably stored an entry it is committed and handed to a
//! [`commit::CommitObserver`] in log order.
//!
//! The module layout mirrors the component breakdown this crate was built
//! against: [`replica`] owns terms/votes/roles and the election/heartbeat
//! timers, [`replication`] tracks each follower's replication cursor,
//! [`commit`] computes quorum and fires waiters/observers, [`durable`]
//! persists `{current_term, voted_for}`, and [`transport`] is the RPC
//! boundary the replica talks through.

pub mod commit;
pub mod config;
pub mod driver;
pub mod durable;
pub mod errors;
pub mod replica;
pub mod replication;
pub mod tcp;
pub mod transport;
pub mod types;

pub use config::Config;
pub use errors::ReplicaError;
pub use replica::Replica;
pub use types::{LogEntry, NodeId, Role, Term};
