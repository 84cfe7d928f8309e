//! Bridge between a CQHTTP-style bot backend and in-process plugins.
//!
//! The backend exposes two WebSocket channels: `/api` for commands and their
//! replies, `/event` for inbound notifications. [`Gateway`] keeps both open,
//! correlates replies with the echo token of the command that caused them,
//! and fans events out to registered [`Plugin`]s. An optional third channel
//! carries push frames addressed to plugin modules.

pub mod client;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod logs;
pub mod plugin;
pub mod router;
pub mod server;

pub use {
    client::CqClient,
    correlation::CorrelationTable,
    error::{Error, Result},
    gateway::Gateway,
    logs::{LogBuffer, LogCaptureLayer},
    plugin::{FilterFn, HandlerFn, Plugin, filter, handler},
    router::EventRouter,
};
