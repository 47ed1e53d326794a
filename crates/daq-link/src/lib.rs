//! `daq-link`
//!
//! Command framing, shared-link transport and retry core for rust-daq
//! laboratory instrument drivers (syringe pumps, valves, chillers).
//!
//! Drivers declare their commands as [`CommandTemplate`] constants and talk
//! to one logical device through a [`DeviceSession`]. Everything between
//! the template and the wire lives here:
//!
//! - [`format`]: per-vendor frame encoding and reply decoding
//! - [`TransportLink`]: one physical medium, one transaction at a time
//! - [`LinkRegistry`]: one link per endpoint, shared by daisy-chained devices
//! - [`ResponseParser`]: error-text rules mapping replies to [`ErrorKind`]s
//! - [`RetryPolicy`]: bounded retry of busy replies
//! - [`AddressAllocator`]: daisy-chain discovery
//! - [`LinkConfig`]: TOML + environment configuration
//! - [`mock`]: in-memory media for testing drivers without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use daq_link::{CommandTemplate, DeviceSession, LinkRegistry, RetryPolicy};
//! # use daq_link::{load_config, LinkResult};
//!
//! const SET_RATE: CommandTemplate = CommandTemplate::new("irate").with_argument(" ");
//!
//! # async fn example() -> LinkResult<()> {
//! let config = load_config("config/link.toml".as_ref())?;
//! let registry = LinkRegistry::new();
//! let link = config.acquire(&registry).await?;
//!
//! let pump = DeviceSession::new("pump", link, 0, config.format());
//! let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(2));
//! let reply = policy.with_retry(|| pump.send(&SET_RATE, "5", "ml/min")).await?;
//! println!("{}", reply.text());
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod format;
pub mod mock;
pub mod parser;
pub mod registry;
pub mod retry;
pub mod serial;
pub mod session;
pub mod transport;

pub use command::{Command, CommandTemplate};
pub use config::{
    load_config, load_config_str, ConfigError, LinkConfig, ProtocolFamily, RetryConfig,
    TransportConfig,
};
pub use discovery::AddressAllocator;
pub use error::{ErrorKind, Exchange, LinkError, LinkResult};
pub use format::{FrameFormat, ReadPlan, ReplyEnvelope, RequestFrame, StatusKind};
pub use parser::{ErrorRule, ResponseParser};
pub use registry::LinkRegistry;
pub use retry::{with_retry, RetryPolicy};
pub use serial::{Parity, SerialSettings};
pub use session::{DeviceSession, SessionState};
pub use transport::{DynMedium, LinkSettings, Medium, TransportLink};
