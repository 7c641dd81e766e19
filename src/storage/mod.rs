//! Hand-off of persistent messages to the external store.
//!
//! - `store` - Store collaborator trait and the background worker feeding it

pub mod store;

pub use store::*;
