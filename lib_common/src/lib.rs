//! # lib_common
//!
//! Building blocks for a polling-to-pub/sub fan-out bridge: a fixed-interval
//! poller feeds a broker channel, the channel bridge relays that channel to
//! local transports and consumers, and the fan-out coordinator mirrors every
//! message onto a secondary, topic-addressed tier.
//!
//! Network drivers are feature gated (`connections`, `retrieve`,
//! `secondary-ws`, or `full`); the core and the in-memory broker and tier are
//! always built.

#![forbid(unsafe_code)]

// Declare the modules to re-export
pub mod connections;
pub mod core;
pub mod errors;
pub mod retrieve;
pub mod secondary;

// Re-export the types most callers need
pub use crate::core::{
    consumer_fn, ChannelBridge, Consumer, Delivery, FanoutCoordinator, Origin, Payload, Poller, StopFlag,
};
pub use connections::Broker;
pub use errors::*;
pub use retrieve::ExternalSource;
pub use secondary::{Credentials, TierConnector, TierSession};
