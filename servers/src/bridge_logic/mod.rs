pub mod config;
pub mod consumers;
pub mod downstream;
pub mod logger;
pub mod monitor;
pub mod shutdown;
pub mod tier_route;
