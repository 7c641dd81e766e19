//! Subscription routing.
//!
//! - `consumer` - Local consumer seam and interest kinds
//! - `presence` - Presence collaborator traits and notifications
//! - `subscriptions` - Subscription records and the registry
//! - `dispatcher` - Publish path and inbound frame delivery

pub mod consumer;
pub mod dispatcher;
pub mod presence;
pub mod subscriptions;

pub use consumer::*;
pub use dispatcher::*;
pub use presence::*;
pub use subscriptions::*;
