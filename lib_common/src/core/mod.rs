//! # Core Engine Module
//!
//! The transport-independent heart of the bridge. Everything here runs against
//! the `Broker` and `TierSession` traits, so it is always compiled and tested
//! with the in-memory implementations.
//!
//! ## Core Components:
//!
//! - **`payload`**: the opaque byte payload and the `Delivery` envelope that
//!   adds receive time and origin at the consuming edge.
//!
//! - **`poller`**: a fixed-interval, non-overlapping polling loop with a pure
//!   stop predicate as its only cancellation mechanism.
//!
//! - **`bridge`**: publishes to and subscribes from broker channels, and
//!   relays one broker subscription to many local transports.
//!
//! - **`fanout`**: delivers each relayed message to every local consumer and
//!   republishes it to the secondary tier while a session is attached.
//!
//! - **`consumers`**: stock consumers (receive statistics, channel hand-off).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Broker channel publish/subscribe and the transport relay.
pub mod bridge;
/// Stock consumers.
pub mod consumers;
/// Local and secondary-tier fan-out.
pub mod fanout;
/// Payload and delivery envelope.
pub mod payload;
/// Fixed-interval polling loop.
pub mod poller;

// --- Public API Re-exports ---
pub use bridge::{ChannelBridge, Relay, Subscription, TransportLink};
pub use consumers::{ChannelConsumer, OriginTotals, ReceiveStats};
pub use fanout::{consumer_fn, AttachmentState, Consumer, DispatchReport, FanoutCoordinator, FanoutStats};
pub use payload::{Delivery, Origin, Payload};
pub use poller::{PollOutcome, PollSession, PollState, PollStats, Poller, StopFlag, StopReason, TickError};
