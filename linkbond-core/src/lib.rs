//! Core library for link-bonding groups.
//!
//! This library aggregates several independent point-to-point transport
//! links into a single logical datagram stream: one shared sequence space
//! on the send side, one deduplicated in-order stream on the receive side,
//! with per-member health tracking and seamless backup failover.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `group`: the `Group` object — membership, lifecycle, receive merging
//! - `sender`: broadcast fan-out and backup failover send paths
//! - `buffer`: the backup replay buffer with pooled payload blocks
//! - `member`: per-link member records and their state machine
//! - `link` / `registry` / `events`: the seams to the per-link transport,
//!   the socket registry and the readiness notification primitive
//! - `options`: deferred `(opt_id, bytes)` configuration replay
//! - `seq` / `msg`: wrap-aware shared numbering and message metadata
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use linkbond_core::{Group, GroupType, MemoryRegistry, MsgControl};
//!
//! # fn example() -> Result<(), linkbond_core::GroupError> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let group = Group::new(1, GroupType::Backup, registry);
//! // ... register links, add members ...
//! let mut ctrl = MsgControl::default();
//! group.send(b"hello", &mut ctrl)?;
//! # Ok(())
//! # }
//! ```

mod buffer;
pub mod error;
pub mod events;
pub mod group;
pub mod link;
pub mod member;
pub mod msg;
pub mod options;
pub mod registry;
pub mod seq;
mod sender;
pub mod stats;

pub use error::GroupError;
pub use events::{EventNotifier, NullNotifier};
pub use group::{Group, GroupStatus, GroupType, GROUP_ID_NONE};
pub use link::{Link, LinkError, LinkId, LinkStatus};
pub use member::{MemberData, MemberState};
pub use msg::{MsgControl, LIVE_DEF_PAYLOAD_SIZE, LIVE_MAX_PAYLOAD_SIZE};
pub use options::{ConfigItem, GroupOptions};
pub use registry::{LinkRegistry, MemoryRegistry};
pub use seq::{MsgNo, SeqNo};
pub use stats::GroupStats;
