use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatelinkError, Result};
use crate::reconnect::ReconnectConfig;
use crate::state::ChannelKind;

/// One gateway endpoint (the protocol requires two: market-data and
/// trading, each its own TCP connection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

/// Full configuration for the gateway client.
///
/// Owned by the caller; the core only consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub market_data: EndpointConfig,
    pub trading: EndpointConfig,
    /// Client identification sent during the session-init exchange.
    pub client_id: String,
    pub connect_timeout: Duration,
    /// Default per-request deadline when the caller passes none.
    pub request_timeout: Duration,
    pub heartbeat_period: Duration,
    /// Stale after this long without any inbound frame; should be a small
    /// multiple of the period.
    pub heartbeat_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Frames declaring a larger body are a protocol violation.
    pub max_body_len: u32,
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Parse a JSON configuration document (the format `serde` writes).
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| GatelinkError::InvalidConfig(e.to_string()))
    }

    pub fn endpoint(&self, channel: ChannelKind) -> &EndpointConfig {
        match channel {
            ChannelKind::MarketData => &self.market_data,
            ChannelKind::Trading => &self.trading,
        }
    }
}

/// Fluent builder with validation for [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    market_data: Option<EndpointConfig>,
    trading: Option<EndpointConfig>,
    client_id: Option<String>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    heartbeat_period: Option<Duration>,
    heartbeat_timeout: Option<Duration>,
    reconnect: Option<ReconnectConfig>,
    max_body_len: Option<u32>,
}

impl GatewayConfigBuilder {
    pub fn market_data_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.market_data = Some(EndpointConfig { host: host.into(), port });
        self
    }
    pub fn trading_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.trading = Some(EndpointConfig { host: host.into(), port });
        self
    }
    pub fn client_id(mut self, v: impl Into<String>) -> Self {
        self.client_id = Some(v.into());
        self
    }
    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = Some(v);
        self
    }
    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = Some(v);
        self
    }
    pub fn heartbeat_period(mut self, v: Duration) -> Self {
        self.heartbeat_period = Some(v);
        self
    }
    pub fn heartbeat_timeout(mut self, v: Duration) -> Self {
        self.heartbeat_timeout = Some(v);
        self
    }
    pub fn reconnect(mut self, v: ReconnectConfig) -> Self {
        self.reconnect = Some(v);
        self
    }
    pub fn max_body_len(mut self, v: u32) -> Self {
        self.max_body_len = Some(v);
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let config = GatewayConfig {
            market_data: self
                .market_data
                .ok_or_else(|| GatelinkError::InvalidConfig("market-data endpoint missing".into()))?,
            trading: self
                .trading
                .ok_or_else(|| GatelinkError::InvalidConfig("trading endpoint missing".into()))?,
            client_id: self.client_id.unwrap_or_else(|| "gatelink".to_string()),
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(5)),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(10)),
            heartbeat_period: self.heartbeat_period.unwrap_or(Duration::from_secs(15)),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_secs(45)),
            reconnect: self.reconnect.unwrap_or_default(),
            max_body_len: self.max_body_len.unwrap_or(4 * 1024 * 1024),
        };
        if config.client_id.len() > usize::from(u16::MAX) {
            return Err(GatelinkError::InvalidConfig(
                "client_id exceeds the wire format's u16 length prefix".into(),
            ));
        }
        if config.heartbeat_period.is_zero() {
            return Err(GatelinkError::InvalidConfig("heartbeat_period must be positive".into()));
        }
        if config.heartbeat_timeout <= config.heartbeat_period {
            return Err(GatelinkError::InvalidConfig(
                "heartbeat_timeout must exceed heartbeat_period".into(),
            ));
        }
        if config.reconnect.max_attempts == 0 {
            return Err(GatelinkError::InvalidConfig(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if config.max_body_len == 0 {
            return Err(GatelinkError::InvalidConfig("max_body_len must be positive".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> GatewayConfigBuilder {
        GatewayConfig::builder()
            .market_data_endpoint("127.0.0.1", 7709)
            .trading_endpoint("127.0.0.1", 7708)
    }

    #[test]
    fn builder_fills_defaults() {
        let config = minimal().build().unwrap();
        assert_eq!(config.endpoint(ChannelKind::MarketData).port, 7709);
        assert_eq!(config.endpoint(ChannelKind::Trading).port, 7708);
        assert!(config.heartbeat_timeout > config.heartbeat_period);
        assert!(config.max_body_len > 0);
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let err = GatewayConfig::builder()
            .market_data_endpoint("127.0.0.1", 7709)
            .build()
            .unwrap_err();
        assert!(matches!(err, GatelinkError::InvalidConfig(_)));
    }

    #[test]
    fn overlong_client_id_is_rejected() {
        let err = minimal().client_id("x".repeat(70_000)).build().unwrap_err();
        assert!(matches!(err, GatelinkError::InvalidConfig(_)));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_period() {
        let err = minimal()
            .heartbeat_period(Duration::from_secs(10))
            .heartbeat_timeout(Duration::from_secs(10))
            .build()
            .unwrap_err();
        assert!(matches!(err, GatelinkError::InvalidConfig(_)));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = minimal().client_id("desk-7").build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back = GatewayConfig::from_json(&json).unwrap();
        assert_eq!(back.client_id, "desk-7");
        assert_eq!(back.market_data.host, config.market_data.host);
    }

    #[test]
    fn malformed_json_is_an_invalid_config() {
        let err = GatewayConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, GatelinkError::InvalidConfig(_)));
    }
}
