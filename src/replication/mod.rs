//! Cluster-facing plumbing.
//!
//! This module covers what crosses node boundaries:
//! - `transport` - Peer identity and the mesh transport seam
//! - `events` - Subscription events exchanged between nodes
//! - `flush` - Background flush of per-peer frame queues

pub mod events;
pub mod flush;
pub mod transport;

pub use events::*;
pub use flush::*;
pub use transport::*;
