#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod pending;
pub mod protocol;
pub mod reconnect;
pub mod state;
mod transport;

pub use channel::ChannelHandle;
pub use client::{GatewayClient, GatewayStatus};
pub use config::{EndpointConfig, GatewayConfig, GatewayConfigBuilder};
pub use dispatch::{PushListener, SubscriptionRegistry};
pub use error::{GatelinkError, Result};
pub use frame::Frame;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use state::{ChannelKind, ChannelState, ChannelStatus};
