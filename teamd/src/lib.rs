//! teamd: single-host coordination daemon for cooperating agents.
//!
//! The daemon is the only writer of the team workspace. It owns the
//! task state machine with lease/epoch fencing, the thread append log,
//! per-agent inbox fan-out, the audit trail and the HTTP surface the
//! guard clients talk to.

pub mod bootstrap;
pub mod http;
pub mod store;

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");
