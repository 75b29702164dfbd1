//! Protocol identifiers and builders for the admin bodies the core sends
//! on its own behalf.
//!
//! Business payloads are opaque to this crate; only the handful of
//! messages the connection machinery itself must emit (session init,
//! heartbeat, subscribe/unsubscribe) are built here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{GatelinkError, Result};

/// Protocol-level hello exchanged before a channel may reach READY.
pub const SESSION_INIT: u32 = 0x0001;
/// Lightweight liveness request; the gateway echoes an empty body.
pub const HEARTBEAT: u32 = 0x0002;
/// Subscribe to pushes for a topic.
pub const SUBSCRIBE: u32 = 0x0003;
/// Unsubscribe from a topic.
pub const UNSUBSCRIBE: u32 = 0x0004;

/// Request a quote snapshot (body: topic bytes).
pub const GET_QUOTE: u32 = 0x1001;

/// Push: streaming quote update. Body carries the topic, then payload.
pub const PUSH_QUOTE: u32 = 0x2001;
/// Push: order/fill report on the trading channel.
pub const PUSH_ORDER: u32 = 0x2002;

/// Length prefixes are u16; anything longer cannot be encoded faithfully.
fn prefixed_len(value: &str, what: &str) -> Result<u16> {
    u16::try_from(value.len()).map_err(|_| {
        GatelinkError::Protocol(format!(
            "{what} of {} bytes exceeds the u16 length prefix",
            value.len()
        ))
    })
}

/// Client identification sent in the session-init body.
pub fn build_session_init(client_id: &str) -> Result<Bytes> {
    let len = prefixed_len(client_id, "client id")?;
    let mut buf = BytesMut::with_capacity(2 + client_id.len());
    buf.put_u16_le(len);
    buf.extend_from_slice(client_id.as_bytes());
    Ok(buf.freeze())
}

/// Heartbeats carry no body.
pub fn build_heartbeat() -> Bytes {
    Bytes::new()
}

/// Subscribe/unsubscribe bodies carry the UTF-8 topic, length-prefixed,
/// followed by the push protocol id the subscription targets.
pub fn build_subscribe(topic: &str, push_protocol_id: u32) -> Result<Bytes> {
    let len = prefixed_len(topic, "topic")?;
    let mut buf = BytesMut::with_capacity(6 + topic.len());
    buf.put_u16_le(len);
    buf.extend_from_slice(topic.as_bytes());
    buf.put_u32_le(push_protocol_id);
    Ok(buf.freeze())
}

pub fn build_unsubscribe(topic: &str, push_protocol_id: u32) -> Result<Bytes> {
    build_subscribe(topic, push_protocol_id)
}

/// Extract the length-prefixed topic from the front of a push body.
///
/// Push frames for topic-keyed protocols open with the same prefix the
/// subscribe body uses; the remainder is the payload handed to listeners.
pub fn split_topic(body: &Bytes) -> Option<(String, Bytes)> {
    if body.len() < 2 {
        return None;
    }
    let topic_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    if body.len() < 2 + topic_len {
        return None;
    }
    let topic = std::str::from_utf8(&body[2..2 + topic_len]).ok()?.to_string();
    Some((topic, body.slice(2 + topic_len..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_body_carries_topic_and_push_id() {
        let body = build_subscribe("600519", PUSH_QUOTE).unwrap();
        let (topic, rest) = split_topic(&body).unwrap();
        assert_eq!(topic, "600519");
        assert_eq!(rest.as_ref(), &PUSH_QUOTE.to_le_bytes()[..]);
    }

    #[test]
    fn topic_longer_than_the_length_prefix_is_rejected() {
        let topic = "A".repeat(usize::from(u16::MAX) + 1);
        let err = build_subscribe(&topic, PUSH_QUOTE).unwrap_err();
        assert!(matches!(err, GatelinkError::Protocol(_)), "got {err:?}");

        // The longest encodable topic still round-trips.
        let topic = "B".repeat(usize::from(u16::MAX));
        let body = build_subscribe(&topic, PUSH_QUOTE).unwrap();
        let (parsed, _) = split_topic(&body).unwrap();
        assert_eq!(parsed, topic);
    }

    #[test]
    fn client_id_longer_than_the_length_prefix_is_rejected() {
        let client_id = "c".repeat(70_000);
        let err = build_session_init(&client_id).unwrap_err();
        assert!(matches!(err, GatelinkError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn split_topic_rejects_short_bodies() {
        assert!(split_topic(&Bytes::from_static(b"\x05")).is_none());
        assert!(split_topic(&Bytes::from_static(b"\x05\x00ab")).is_none());
    }

    #[test]
    fn session_init_prefixes_client_id() {
        let body = build_session_init("algo-desk-1").unwrap();
        assert_eq!(&body[..2], &11u16.to_le_bytes()[..]);
        assert_eq!(&body[2..], b"algo-desk-1");
    }
}
