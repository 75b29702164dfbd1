//! Runs a gatelink client against a scripted in-process gateway:
//! connect, issue a quote request, subscribe to a topic, and print the
//! pushes that arrive.
//!
//! ```sh
//! cargo run --example mock_gateway
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gatelink::{frame, protocol, ChannelKind, GatewayClient, GatewayConfig, PushListener};

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<frame::Frame> {
    loop {
        match frame::decode(buf, 1024 * 1024) {
            Ok(Some(f)) => return Some(f),
            Ok(None) => {}
            Err(_) => return None,
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Minimal scripted gateway: acks admin messages, echoes quote requests,
/// and streams a few pushes for every subscribed topic.
async fn serve(listener: TcpListener) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        tracing::info!(%peer, "gateway: connection accepted");
        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Some(f) = read_frame(&mut stream, &mut buf).await {
                match f.protocol_id {
                    protocol::SESSION_INIT | protocol::HEARTBEAT => {
                        let ack = frame::encode(f.protocol_id, f.serial, b"");
                        let _ = stream.write_all(&ack).await;
                    }
                    protocol::GET_QUOTE => {
                        let mut body = f.body.to_vec();
                        body.extend_from_slice(b"|last=42.17");
                        let resp = frame::encode(f.protocol_id, f.serial, &body);
                        let _ = stream.write_all(&resp).await;
                    }
                    protocol::SUBSCRIBE => {
                        let ack = frame::encode(f.protocol_id, f.serial, b"");
                        let _ = stream.write_all(&ack).await;
                        if let Some((topic, _)) = protocol::split_topic(&f.body) {
                            for tick in 0..3u32 {
                                let mut body = Vec::new();
                                body.extend_from_slice(&(topic.len() as u16).to_le_bytes());
                                body.extend_from_slice(topic.as_bytes());
                                body.extend_from_slice(format!("px={}.{}", 42 + tick, tick).as_bytes());
                                let push = frame::encode(protocol::PUSH_QUOTE, frame::PUSH_SERIAL, &body);
                                let _ = stream.write_all(&push).await;
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> gatelink::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mock_gateway=info,gatelink=info".into()),
        )
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve(listener));

    let config = GatewayConfig::builder()
        .market_data_endpoint("127.0.0.1", port)
        .trading_endpoint("127.0.0.1", port)
        .client_id("demo-desk")
        .build()?;
    let client = GatewayClient::connect(config).await?;
    tracing::info!(status = ?client.status(), "connected");

    let quote = client
        .request(
            ChannelKind::MarketData,
            protocol::GET_QUOTE,
            Bytes::from_static(b"600519"),
            None,
        )
        .await?;
    tracing::info!(body = %String::from_utf8_lossy(&quote), "quote response");

    let listener_fn: PushListener = Arc::new(|payload: Bytes| {
        tracing::info!(payload = %String::from_utf8_lossy(&payload), "push for 600519");
    });
    client.subscribe("600519", protocol::PUSH_QUOTE, listener_fn).await?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.disconnect().await;
    tracing::info!(status = ?client.status(), "disconnected");
    Ok(())
}
