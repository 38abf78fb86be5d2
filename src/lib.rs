pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use crate::config::cli::{CliArgs, Command};

pub use crate::adapters::ws::WsConnector;
pub use crate::config::toml_config::PortalConfig;
pub use crate::core::api::ApiClient;
pub use crate::core::calendar::CalendarClient;
pub use crate::core::channel::{
    ChannelConfig, ChannelEvent, ChannelHandle, ChannelState, CoherenceChannel,
};
pub use crate::core::session::{gate, GateDecision, SessionCodec, SessionRecord};
pub use crate::core::triage::{classify, TriageStatus, TriageThresholds};
pub use crate::utils::error::{PortalError, Result};
