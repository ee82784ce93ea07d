//! Binary chat wire protocol and the JSON sync payloads it carries.
//!
//! Chat messages travel as mesh application data with a compact header:
//!
//! ```text
//! v2: ver(1)=2, type(1), chan_len(1), nick_len(1), created_ts(u32 BE),
//!     channel, nick, text(remainder, UTF-8)
//! v1: ver(1)=1, type(1), chan_len(1), nick_len(1), channel, nick, text
//! ```
//!
//! The encoder always emits v2; the decoder accepts both versions for
//! compatibility with older nodes, substituting the receive time where v1
//! lacks a sender timestamp.
//!
//! Sync requests ride in the text field of a `SYNC_REQUEST` message as JSON,
//! discriminated by an explicit `"mode"` field; the legacy shape without
//! `"mode"` is the since-timestamp form. Sync responses are a JSON array of
//! per-message records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CHAT_V1: u8 = 1;
pub const CHAT_V2: u8 = 2;

/// Chat message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    SyncRequest,
    SyncResponse,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Message => 1,
            MessageKind::SyncRequest => 5,
            MessageKind::SyncResponse => 6,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Message),
            5 => Some(MessageKind::SyncRequest),
            6 => Some(MessageKind::SyncResponse),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("chat message too short ({0} bytes)")]
    Truncated(usize),

    #[error("unsupported chat version {0}")]
    BadVersion(u8),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("{0} exceeds 255 bytes")]
    FieldTooLong(&'static str),

    #[error("bad sync payload: {0}")]
    BadSyncPayload(String),
}

/// A decoded chat message. `created_ts` is sender-assigned unix seconds
/// (receive time when the sender spoke v1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub channel: String,
    pub nick: String,
    pub text: String,
    pub created_ts: u32,
}

/// Encode a chat message in the current (v2) wire format.
pub fn encode_message(msg: &ChatMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_with_version(msg, CHAT_V2)
}

/// Encode in the legacy v1 format (no `created_ts`). Kept for interop with
/// nodes that have not been upgraded.
pub fn encode_message_v1(msg: &ChatMessage) -> Result<Vec<u8>, ProtocolError> {
    encode_with_version(msg, CHAT_V1)
}

fn encode_with_version(msg: &ChatMessage, version: u8) -> Result<Vec<u8>, ProtocolError> {
    let channel = msg.channel.as_bytes();
    let nick = msg.nick.as_bytes();
    let text = msg.text.as_bytes();
    if channel.len() > 255 {
        return Err(ProtocolError::FieldTooLong("channel"));
    }
    if nick.len() > 255 {
        return Err(ProtocolError::FieldTooLong("nick"));
    }

    let header_len = if version >= CHAT_V2 { 8 } else { 4 };
    let mut out = Vec::with_capacity(header_len + channel.len() + nick.len() + text.len());
    out.push(version);
    out.push(msg.kind.as_u8());
    out.push(channel.len() as u8);
    out.push(nick.len() as u8);
    if version >= CHAT_V2 {
        out.extend_from_slice(&msg.created_ts.to_be_bytes());
    }
    out.extend_from_slice(channel);
    out.extend_from_slice(nick);
    out.extend_from_slice(text);
    Ok(out)
}

/// Decode a chat message, accepting both wire versions. `recv_ts` fills in
/// `created_ts` for v1 senders.
pub fn decode_message(data: &[u8], recv_ts: u32) -> Result<ChatMessage, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated(data.len()));
    }
    let version = data[0];
    let kind = MessageKind::from_u8(data[1]).ok_or(ProtocolError::UnknownKind(data[1]))?;
    let chan_len = data[2] as usize;
    let nick_len = data[3] as usize;

    let (header_len, created_ts) = match version {
        CHAT_V1 => (4, recv_ts),
        CHAT_V2 => {
            if data.len() < 8 {
                return Err(ProtocolError::Truncated(data.len()));
            }
            let ts = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            (8, ts)
        }
        other => return Err(ProtocolError::BadVersion(other)),
    };

    let needed = header_len + chan_len + nick_len;
    if data.len() < needed {
        return Err(ProtocolError::Truncated(data.len()));
    }
    let channel = String::from_utf8_lossy(&data[header_len..header_len + chan_len]).into_owned();
    let nick =
        String::from_utf8_lossy(&data[header_len + chan_len..needed]).into_owned();
    let text = String::from_utf8_lossy(&data[needed..]).into_owned();

    Ok(ChatMessage {
        kind,
        channel,
        nick,
        text,
        created_ts,
    })
}

// ---------------------------------------------------------------------
// Sync payloads
// ---------------------------------------------------------------------

/// The three sync-request modes.
///
/// `SinceTs` is the legacy form: linear in history and bandwidth-wasteful,
/// kept only for old peers and explicit full-channel pulls. `SeqnoInventory`
/// advertises what the requester already holds so the responder sends only
/// newer items within its window. `Range` asks for an exact contiguous slice
/// from one origin and is the precise gap-healing tool.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    SinceTs {
        since_ts: f64,
    },
    SeqnoInventory {
        last_n: u32,
        inv: BTreeMap<String, u32>,
    },
    Range {
        origin_id_hex: String,
        start: u32,
        end: u32,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "mode")]
enum TaggedSyncPayload {
    #[serde(rename = "seqno")]
    Seqno {
        last_n: u32,
        inv: BTreeMap<String, u32>,
    },
    #[serde(rename = "range")]
    Range {
        origin_id_hex: String,
        start: u32,
        end: u32,
    },
}

#[derive(Serialize, Deserialize)]
struct SincePayload {
    since_ts: f64,
}

impl SyncRequest {
    pub fn to_json(&self) -> String {
        match self {
            SyncRequest::SinceTs { since_ts } => {
                serde_json::to_string(&SincePayload {
                    since_ts: *since_ts,
                })
            }
            SyncRequest::SeqnoInventory { last_n, inv } => {
                serde_json::to_string(&TaggedSyncPayload::Seqno {
                    last_n: *last_n,
                    inv: inv.clone(),
                })
            }
            SyncRequest::Range {
                origin_id_hex,
                start,
                end,
            } => serde_json::to_string(&TaggedSyncPayload::Range {
                origin_id_hex: origin_id_hex.clone(),
                start: *start,
                end: *end,
            }),
        }
        // Serializing these shapes cannot fail; they are plain data.
        .unwrap_or_default()
    }

    /// Parse a sync-request payload. Objects carrying `"mode"` take the
    /// tagged path (unknown modes are an error); anything else must be the
    /// legacy since-timestamp shape.
    pub fn from_json(text: &str) -> Result<SyncRequest, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::BadSyncPayload(e.to_string()))?;
        let has_mode = value.get("mode").is_some();
        if has_mode {
            let tagged: TaggedSyncPayload = serde_json::from_value(value)
                .map_err(|e| ProtocolError::BadSyncPayload(e.to_string()))?;
            Ok(match tagged {
                TaggedSyncPayload::Seqno { last_n, inv } => {
                    SyncRequest::SeqnoInventory { last_n, inv }
                }
                TaggedSyncPayload::Range {
                    origin_id_hex,
                    start,
                    end,
                } => SyncRequest::Range {
                    origin_id_hex,
                    start,
                    end,
                },
            })
        } else {
            let legacy: SincePayload = serde_json::from_value(value)
                .map_err(|e| ProtocolError::BadSyncPayload(e.to_string()))?;
            Ok(SyncRequest::SinceTs {
                since_ts: legacy.since_ts,
            })
        }
    }
}

/// One record in a sync response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub origin_id_hex: String,
    pub seqno: u32,
    pub nick: String,
    pub text: String,
    pub ts: f64,
}

/// Build the full wire bytes for a sync request.
pub fn encode_sync_request(
    request: &SyncRequest,
    channel: &str,
    nick: &str,
    created_ts: u32,
) -> Result<Vec<u8>, ProtocolError> {
    encode_message(&ChatMessage {
        kind: MessageKind::SyncRequest,
        channel: channel.to_string(),
        nick: nick.to_string(),
        text: request.to_json(),
        created_ts,
    })
}

/// Build the full wire bytes for a sync response.
pub fn encode_sync_response(
    records: &[SyncRecord],
    channel: &str,
    nick: &str,
    created_ts: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let text = serde_json::to_string(records)
        .map_err(|e| ProtocolError::BadSyncPayload(e.to_string()))?;
    encode_message(&ChatMessage {
        kind: MessageKind::SyncResponse,
        channel: channel.to_string(),
        nick: nick.to_string(),
        text,
        created_ts,
    })
}

/// Parse the record list out of a sync-response message text.
pub fn parse_sync_response(text: &str) -> Result<Vec<SyncRecord>, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::BadSyncPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: MessageKind) -> ChatMessage {
        ChatMessage {
            kind,
            channel: "#general".to_string(),
            nick: "alice".to_string(),
            text: "hello from the hilltop".to_string(),
            created_ts: 1_700_000_123,
        }
    }

    #[test]
    fn v2_round_trip() {
        let msg = sample(MessageKind::Message);
        let wire = encode_message(&msg).unwrap();
        assert_eq!(wire[0], CHAT_V2);
        let decoded = decode_message(&wire, 0).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn v1_round_trip_uses_receive_time() {
        let msg = sample(MessageKind::Message);
        let wire = encode_message_v1(&msg).unwrap();
        assert_eq!(wire[0], CHAT_V1);
        // v1 cannot carry created_ts; the decoder takes the caller's clock.
        let decoded = decode_message(&wire, msg.created_ts).unwrap();
        assert_eq!(decoded, msg);
        let decoded_late = decode_message(&wire, 42).unwrap();
        assert_eq!(decoded_late.created_ts, 42);
    }

    #[test]
    fn rejects_unknown_version_and_kind() {
        let mut wire = encode_message(&sample(MessageKind::Message)).unwrap();
        wire[0] = 9;
        assert!(matches!(
            decode_message(&wire, 0),
            Err(ProtocolError::BadVersion(9))
        ));
        let mut wire = encode_message(&sample(MessageKind::Message)).unwrap();
        wire[1] = 200;
        assert!(matches!(
            decode_message(&wire, 0),
            Err(ProtocolError::UnknownKind(200))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(matches!(
            decode_message(&[2, 1], 0),
            Err(ProtocolError::Truncated(2))
        ));
        let wire = encode_message(&sample(MessageKind::Message)).unwrap();
        assert!(decode_message(&wire[..10], 0).is_err());
    }

    #[test]
    fn overlong_fields_rejected_on_encode() {
        let mut msg = sample(MessageKind::Message);
        msg.channel = "#".repeat(300);
        assert!(matches!(
            encode_message(&msg),
            Err(ProtocolError::FieldTooLong("channel"))
        ));
    }

    #[test]
    fn sync_request_modes_round_trip() {
        let mut inv = BTreeMap::new();
        inv.insert("5800000000000000".to_string(), 10);
        let cases = vec![
            SyncRequest::SinceTs { since_ts: 1234.5 },
            SyncRequest::SeqnoInventory { last_n: 50, inv },
            SyncRequest::Range {
                origin_id_hex: "4b31414243000000".to_string(),
                start: 3,
                end: 6,
            },
        ];
        for case in cases {
            let json = case.to_json();
            assert_eq!(SyncRequest::from_json(&json).unwrap(), case);
        }
    }

    #[test]
    fn legacy_since_shape_has_no_mode_tag() {
        let parsed = SyncRequest::from_json("{\"since_ts\": 99.0}").unwrap();
        assert_eq!(parsed, SyncRequest::SinceTs { since_ts: 99.0 });
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(SyncRequest::from_json("{\"mode\":\"zeta\",\"x\":1}").is_err());
        assert!(SyncRequest::from_json("not json").is_err());
        assert!(SyncRequest::from_json("{\"other\":true}").is_err());
    }

    #[test]
    fn sync_response_round_trip() {
        let records = vec![SyncRecord {
            origin_id_hex: "4b31414243000000".to_string(),
            seqno: 11,
            nick: "bob".to_string(),
            text: "late news".to_string(),
            ts: 1_700_000_200.0,
        }];
        let wire = encode_sync_response(&records, "#general", "relay", 7).unwrap();
        let msg = decode_message(&wire, 0).unwrap();
        assert_eq!(msg.kind, MessageKind::SyncResponse);
        assert_eq!(parse_sync_response(&msg.text).unwrap(), records);
    }
}
