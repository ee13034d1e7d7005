//! Shared wiring for the bridge binaries: configuration, logging, the
//! WebSocket front ends and the stock consumers.

pub mod bridge_logic;
