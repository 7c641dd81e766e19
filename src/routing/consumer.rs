use std::sync::Arc;

use thiserror::Error;

use super::presence::{ClientIdentity, PresenceEvent};

/// Process-unique id of a local connection.
pub type ConsumerId = u64;

/// One message handed to a local consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub tenant: u32,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("consumer {0} is closed")]
    Closed(ConsumerId),
    #[error("consumer {0} is over its outbound limit")]
    Backpressure(ConsumerId),
}

/// Local connection that can receive messages and presence notifications.
///
/// Both calls happen on the publisher's thread and must not block.
/// `notify_presence` runs with the topic's subscription lock held and must not
/// subscribe or unsubscribe.
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    /// Identity merged into the presence set while subscribed, if any.
    fn identity(&self) -> Option<ClientIdentity> {
        None
    }

    fn deliver(&self, message: &Message<'_>) -> Result<(), DeliveryError>;

    fn notify_presence(&self, event: &PresenceEvent);
}

pub type ConsumerRef = Arc<dyn Consumer>;

/// What a subscription is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Messages,
    Presence,
    Both,
}

impl Interest {
    pub fn messages(self) -> bool {
        matches!(self, Interest::Messages | Interest::Both)
    }

    pub fn presence(self) -> bool {
        matches!(self, Interest::Presence | Interest::Both)
    }
}
