mod log;
mod message;
mod node;
mod server;
mod state;
mod transport;

pub use log::{Command, Entry, Index, Log, Term};
pub use message::{Envelope, Message, ReplicaId, RequestId};
pub use node::{Node, Options};
pub use server::Server;
pub use state::{KvStore, State};
pub use transport::{Channel, Transport, Udp};

use std::ops::RangeInclusive;
use std::time::Duration;

/// The interval between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(125);

/// The minimum interval between catch-up appends to a lagging peer.
/// Heartbeats are not throttled.
pub const APPEND_INTERVAL: Duration = Duration::from_millis(25);

/// The election timeout range in milliseconds while no leader is known.
/// Short, so a leaderless cluster converges quickly.
pub const ELECTION_TIMEOUT_LEADERLESS: RangeInclusive<u64> = 50..=100;

/// The election timeout range in milliseconds while a leader is known. Long,
/// to avoid false-positive elections while the leader is healthy.
pub const ELECTION_TIMEOUT_STEADY: RangeInclusive<u64> = 250..=400;

/// How long buffered client requests may wait without a known leader before
/// they are failed (5 heartbeat intervals). Keeps clients from hammering the
/// cluster during elections.
pub const CLIENT_TIMEOUT: Duration = Duration::from_millis(625);

/// How long a pending read may wait for commit confirmation before it is
/// failed (3 heartbeat intervals).
pub const READ_TIMEOUT: Duration = Duration::from_millis(375);

/// The maximum number of entries per append_entries message.
pub const MAX_APPEND_ENTRIES: usize = 100;

/// How long the event loop blocks waiting for an inbound message.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(50);

/// The maximum wire message size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 32768;
