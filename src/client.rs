//! Public facade over the two logical gateway channels.
//!
//! The gateway protocol requires two independent connections, market-data
//! and trading, each with its own state machine, pending table and
//! subscriptions. [`GatewayClient`] owns one [`ChannelHandle`] per channel
//! and routes the upward API onto them.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::channel::{spawn_channel, ChannelHandle};
use crate::config::GatewayConfig;
use crate::dispatch::{PushListener, SubscriptionRegistry};
use crate::error::Result;
use crate::protocol;
use crate::state::{ChannelKind, ChannelStatus};

/// Combined status snapshot across both channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub market_data: ChannelStatus,
    pub trading: ChannelStatus,
}

/// Client for the brokerage gateway.
///
/// `request()` suspends the calling task until its own response arrives or
/// its deadline passes; concurrent requests are correlated by serial
/// number and resolve independently, in whatever order the gateway
/// answers.
pub struct GatewayClient {
    market_data: ChannelHandle,
    trading: ChannelHandle,
    market_data_subs: Arc<SubscriptionRegistry>,
    trading_subs: Arc<SubscriptionRegistry>,
}

impl GatewayClient {
    /// Bring both channels to READY (TCP connect plus session-init
    /// handshake each). Fails fast if either channel cannot come up.
    pub async fn connect(config: GatewayConfig) -> Result<Self> {
        let config = Arc::new(config);
        let market_data_subs = SubscriptionRegistry::new();
        let trading_subs = SubscriptionRegistry::new();
        let market_data = spawn_channel(
            ChannelKind::MarketData,
            Arc::clone(&config),
            Arc::clone(&market_data_subs),
        );
        let trading = spawn_channel(ChannelKind::Trading, Arc::clone(&config), Arc::clone(&trading_subs));

        market_data.connect().await?;
        if let Err(e) = trading.connect().await {
            market_data.disconnect().await;
            return Err(e);
        }
        Ok(Self { market_data, trading, market_data_subs, trading_subs })
    }

    /// Deliberate shutdown of both channels; no reconnection follows.
    pub async fn disconnect(&self) {
        self.market_data.disconnect().await;
        self.trading.disconnect().await;
    }

    /// Direct access to one logical channel.
    pub fn channel(&self, kind: ChannelKind) -> &ChannelHandle {
        match kind {
            ChannelKind::MarketData => &self.market_data,
            ChannelKind::Trading => &self.trading,
        }
    }

    /// Issue a request on the given channel. `timeout` of `None` uses the
    /// configured default.
    pub async fn request(
        &self,
        channel: ChannelKind,
        protocol_id: u32,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.channel(channel).request(protocol_id, body, timeout).await
    }

    /// Subscribe `listener` to pushes for `topic`. Order-report pushes
    /// ride the trading channel; everything else is market data. The
    /// subscription is replayed automatically after every reconnect until
    /// [`GatewayClient::unsubscribe`] is called.
    pub async fn subscribe(
        &self,
        topic: impl Into<String>,
        push_protocol_id: u32,
        listener: PushListener,
    ) -> Result<()> {
        self.channel_for_push(push_protocol_id)
            .subscribe(topic, push_protocol_id, listener)
            .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self.market_data_subs.contains(topic) {
            self.market_data.unsubscribe(topic).await
        } else if self.trading_subs.contains(topic) {
            self.trading.unsubscribe(topic).await
        } else {
            Ok(())
        }
    }

    /// Point-in-time status across both channels. Persistent failures
    /// (heartbeat loss, reconnect exhaustion) are visible here without an
    /// in-flight request.
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            market_data: self.market_data.status(),
            trading: self.trading.status(),
        }
    }

    fn channel_for_push(&self, push_protocol_id: u32) -> &ChannelHandle {
        if push_protocol_id == protocol::PUSH_ORDER {
            &self.trading
        } else {
            &self.market_data
        }
    }
}
