//! Topic keys, the topic index, and the inter-node batching protocol.
//!
//! - `ssid` - Hashed, tenant-prefixed topic keys
//! - `trie` - Concurrent reverse trie with wildcard matching
//! - `pool` - Bounded object pools with scoped acquisition
//! - `fanout` - Per-publish bloom filter over peers
//! - `frame` - Frame encoding and the streaming decoder
//! - `queue` - Per-peer outbound frame queues

pub mod fanout;
pub mod frame;
pub mod pool;
pub mod queue;
pub mod ssid;
pub mod trie;

pub use fanout::*;
pub use frame::*;
pub use pool::*;
pub use queue::*;
pub use ssid::*;
pub use trie::*;
