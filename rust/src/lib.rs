//! Room subscription broker: a shared per-room reference count decides which
//! server instance holds the single upstream subscription for a room, and
//! each instance fans upstream messages out to its own connections.

pub mod config;
pub mod error;
pub mod logging;
pub mod rooms;

pub use error::{BrokerError, Result};
