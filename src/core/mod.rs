pub mod api;
pub mod billing;
pub mod calendar;
pub mod channel;
pub mod protocol;
pub mod session;
pub mod triage;

pub use crate::domain::model::{Client, CoherenceSnapshot, Role, Trend};
pub use crate::domain::ports::{ConfigProvider, Connection, Connector};
pub use crate::utils::error::Result;
