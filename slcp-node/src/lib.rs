//! SLCP node: binds the UDP control plane and TCP image listener, runs the
//! discovery state machine from `slcp-core`, and reports to an observer.

pub mod cli;
pub mod config;
pub mod error;
pub mod messenger;
pub mod observer;
pub mod transfer;

pub use config::{Config, ConfigError};
pub use error::NodeError;
pub use messenger::Messenger;
pub use observer::ChannelObserver;
