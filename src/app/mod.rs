//! Consumer-facing surface: configuration and the gateway façade.

mod config;
mod gateway;

pub use config::{FanoutTuning, GatewayConfig, RetryTuning, SessionTuning};
pub use gateway::Gateway;
