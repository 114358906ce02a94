//! Server→client event frames.
//!
//! Three frame shapes share one type byte:
//!
//! - system event (type < 30): `| type | payload |` — no sequence number,
//!   written straight to the socket, never buffered.
//! - regular event (type ≥ 30): `| type | 32bit-be seq | payload |` — flows
//!   through the per-client event buffer and is replayed on reconnect.
//! - response event (type ≥ 128): a regular event whose payload begins with
//!   the 24bit-be sequence number of the message it answers.

use crate::value::{get_u24, put_u24, Dict, Type, Value};
use crate::{Msg, ProtocolError};

/// First regular event type. Anything below is a system event.
pub const REGULAR_EV_TYPE: u8 = 30;
/// First response event type.
pub const RESPONSE_EV_TYPE: u8 = 128;

/// Event type bytes. Values are wire format; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EvType {
    PeerReady = 1,
    Pong = 2,
    Joined = 30,
    Left = 31,
    RoomProp = 32,
    ClientProp = 33,
    MasterSwitched = 34,
    Message = 35,
    Rejoined = 36,
    Succeeded = 128,
    PermissionDenied = 129,
    TargetNotFound = 130,
}

impl EvType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            1 => Self::PeerReady,
            2 => Self::Pong,
            30 => Self::Joined,
            31 => Self::Left,
            32 => Self::RoomProp,
            33 => Self::ClientProp,
            34 => Self::MasterSwitched,
            35 => Self::Message,
            36 => Self::Rejoined,
            128 => Self::Succeeded,
            129 => Self::PermissionDenied,
            130 => Self::TargetNotFound,
            other => return Err(ProtocolError::UnknownEvType(other)),
        })
    }

    pub fn is_regular(self) -> bool {
        self as u8 >= REGULAR_EV_TYPE
    }

    pub fn is_response(self) -> bool {
        self as u8 >= RESPONSE_EV_TYPE
    }
}

impl std::fmt::Display for EvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Regular events
// ---------------------------------------------------------------------------

/// A sequenced event. The sequence number is not part of the event itself:
/// it is assigned per client when the event is written to that client's
/// buffer, and stamped into the frame at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularEvent {
    etype: EvType,
    payload: Vec<u8>,
}

impl RegularEvent {
    pub fn ev_type(&self) -> EvType {
        self.etype
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Frames this event with the given per-client sequence number.
    pub fn marshal(&self, seq: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.push(self.etype as u8);
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// A client entered the room. Payload: str8 id, props dict bytes.
    pub fn joined(client_id: &str, props: &[u8]) -> Self {
        let mut payload = Value::Str(client_id.to_string()).marshal();
        payload.extend_from_slice(props);
        Self {
            etype: EvType::Joined,
            payload,
        }
    }

    /// A client re-entered before its deadline, replacing its old self.
    pub fn rejoined(client_id: &str, props: &[u8]) -> Self {
        let mut payload = Value::Str(client_id.to_string()).marshal();
        payload.extend_from_slice(props);
        Self {
            etype: EvType::Rejoined,
            payload,
        }
    }

    /// A player left. Payload: str8 left id, str8 new master id, str8 cause.
    pub fn left(client_id: &str, master_id: &str, cause: &str) -> Self {
        let mut payload = Value::Str(client_id.to_string()).marshal();
        payload.extend(Value::Str(master_id.to_string()).marshal());
        payload.extend(Value::Str(cause.to_string()).marshal());
        Self {
            etype: EvType::Left,
            payload,
        }
    }

    /// Room properties changed. The triggering message payload is echoed
    /// verbatim so every client sees exactly the applied delta.
    pub fn room_prop(msg_payload: &[u8]) -> Self {
        Self {
            etype: EvType::RoomProp,
            payload: msg_payload.to_vec(),
        }
    }

    /// A client's properties changed. Payload: str8 id, props delta dict.
    pub fn client_prop(client_id: &str, props: &[u8]) -> Self {
        let mut payload = Value::Str(client_id.to_string()).marshal();
        payload.extend_from_slice(props);
        Self {
            etype: EvType::ClientProp,
            payload,
        }
    }

    pub fn master_switched(master_id: &str) -> Self {
        Self {
            etype: EvType::MasterSwitched,
            payload: Value::Str(master_id.to_string()).marshal(),
        }
    }

    /// A relayed application message. Payload: str8 sender id, raw body.
    pub fn message(sender_id: &str, body: &[u8]) -> Self {
        let mut payload = Value::Str(sender_id.to_string()).marshal();
        payload.extend_from_slice(body);
        Self {
            etype: EvType::Message,
            payload,
        }
    }

    /// The message identified by its seq was applied.
    pub fn succeeded(msg: &Msg) -> Self {
        let mut payload = Vec::with_capacity(3);
        put_u24(&mut payload, msg.seq);
        Self {
            etype: EvType::Succeeded,
            payload,
        }
    }

    /// The sender lacked permission; the offending payload is echoed back.
    pub fn permission_denied(msg: &Msg) -> Self {
        let mut payload = Vec::with_capacity(3 + msg.payload().len());
        put_u24(&mut payload, msg.seq);
        payload.extend_from_slice(msg.payload());
        Self {
            etype: EvType::PermissionDenied,
            payload,
        }
    }

    /// Some target ids were absent. Payload: msg seq, list of absent ids,
    /// then the original payload.
    pub fn target_not_found(msg: &Msg, absent: &[String]) -> Self {
        let mut payload = Vec::new();
        put_u24(&mut payload, msg.seq);
        let ids = Value::List(absent.iter().cloned().map(Value::Str).collect());
        ids.marshal_into(&mut payload);
        payload.extend_from_slice(msg.payload());
        Self {
            etype: EvType::TargetNotFound,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// System events
// ---------------------------------------------------------------------------

/// An unsequenced event, written through to the current socket only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEvent {
    etype: EvType,
    payload: Vec<u8>,
}

impl SystemEvent {
    pub fn ev_type(&self) -> EvType {
        self.etype
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        buf.push(self.etype as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Tells a freshly attached peer the last message seq the server has
    /// processed, so the client resumes sending from the next one.
    pub fn peer_ready(last_msg_seq: u32) -> Self {
        let mut payload = Vec::with_capacity(3);
        put_u24(&mut payload, last_msg_seq);
        Self {
            etype: EvType::PeerReady,
            payload,
        }
    }

    /// Answers a ping. Payload: ULong echoed timestamp, UInt watcher count,
    /// dict of player id → last inbound unix-millis.
    pub fn pong(timestamp: u64, watchers: u32, last_msg: &Dict) -> Self {
        let mut payload = Value::ULong(timestamp).marshal();
        Value::UInt(watchers).marshal_into(&mut payload);
        payload.extend(last_msg.marshal());
        Self {
            etype: EvType::Pong,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Decoding (used by hubs, client SDKs, and the test suites)
// ---------------------------------------------------------------------------

/// A decoded event frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    System(SystemEvent),
    Regular { event: RegularEvent, seq: u32 },
}

impl Event {
    pub fn ev_type(&self) -> EvType {
        match self {
            Event::System(ev) => ev.ev_type(),
            Event::Regular { event, .. } => event.ev_type(),
        }
    }
}

/// Parses one event frame.
pub fn unmarshal_event(data: &[u8]) -> Result<Event, ProtocolError> {
    let (&tb, rest) = data
        .split_first()
        .ok_or(ProtocolError::TooShort(data.len()))?;
    let etype = EvType::from_byte(tb)?;
    if !etype.is_regular() {
        return Ok(Event::System(SystemEvent {
            etype,
            payload: rest.to_vec(),
        }));
    }
    if rest.len() < 4 {
        return Err(ProtocolError::TooShort(data.len()));
    }
    let seq = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    Ok(Event::Regular {
        event: RegularEvent {
            etype,
            payload: rest[4..].to_vec(),
        },
        seq,
    })
}

/// Decoded `Pong` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PongPayload {
    pub timestamp: u64,
    pub watchers: u32,
    pub last_msg: Dict,
}

pub fn decode_pong_payload(payload: &[u8]) -> Result<PongPayload, ProtocolError> {
    let (ts, n) = Value::unmarshal_as(payload, &[Type::ULong])?;
    let payload = &payload[n..];
    let (w, n) = Value::unmarshal_as(payload, &[Type::UInt])?;
    let payload = &payload[n..];
    let (lm, _) = Value::unmarshal_as(payload, &[Type::Dict, Type::Null])?;
    Ok(PongPayload {
        timestamp: match ts {
            Value::ULong(v) => v,
            _ => unreachable!(),
        },
        watchers: match w {
            Value::UInt(v) => v,
            _ => unreachable!(),
        },
        last_msg: match lm {
            Value::Dict(d) => d,
            _ => Dict::new(),
        },
    })
}

pub fn decode_peer_ready_payload(payload: &[u8]) -> Result<u32, ProtocolError> {
    get_u24(payload)
}

/// Decodes `Joined` / `Rejoined` / `ClientProp` payloads: str8 id then a
/// props dict.
pub fn decode_client_payload(payload: &[u8]) -> Result<(String, Dict), ProtocolError> {
    let (id, n) = Value::unmarshal_str8(payload)?;
    let (props, _) = Value::unmarshal_as(&payload[n..], &[Type::Dict, Type::Null])?;
    let props = match props {
        Value::Dict(d) => d,
        _ => Dict::new(),
    };
    Ok((id, props))
}

/// Decoded `Left` payload.
pub fn decode_left_payload(
    payload: &[u8],
) -> Result<(String, String, String), ProtocolError> {
    let (left, n) = Value::unmarshal_str8(payload)?;
    let (master, m) = Value::unmarshal_str8(&payload[n..])?;
    let (cause, _) = Value::unmarshal_str8(&payload[n + m..])?;
    Ok((left, master, cause))
}

pub fn decode_master_switched_payload(payload: &[u8]) -> Result<String, ProtocolError> {
    Ok(Value::unmarshal_str8(payload)?.0)
}

/// Decodes a `Message` payload into (sender id, body).
pub fn decode_message_payload(payload: &[u8]) -> Result<(String, &[u8]), ProtocolError> {
    let (sender, n) = Value::unmarshal_str8(payload)?;
    Ok((sender, &payload[n..]))
}

/// Decodes a response-event payload into (echoed msg seq, rest).
pub fn decode_response_payload(payload: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    let seq = get_u24(payload)?;
    Ok((seq, &payload[3..]))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg;

    #[test]
    fn test_ev_type_bytes_are_fixed() {
        assert_eq!(EvType::PeerReady as u8, 1);
        assert_eq!(EvType::Pong as u8, 2);
        assert_eq!(EvType::Joined as u8, 30);
        assert_eq!(EvType::Left as u8, 31);
        assert_eq!(EvType::RoomProp as u8, 32);
        assert_eq!(EvType::ClientProp as u8, 33);
        assert_eq!(EvType::MasterSwitched as u8, 34);
        assert_eq!(EvType::Message as u8, 35);
        assert_eq!(EvType::Rejoined as u8, 36);
        assert_eq!(EvType::Succeeded as u8, 128);
        assert_eq!(EvType::PermissionDenied as u8, 129);
        assert_eq!(EvType::TargetNotFound as u8, 130);
    }

    #[test]
    fn test_unknown_ev_type_rejected() {
        assert!(EvType::from_byte(3).is_err());
        assert!(EvType::from_byte(29).is_err());
        assert!(EvType::from_byte(131).is_err());
        assert!(unmarshal_event(&[29, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_regular_event_frame_round_trip() {
        let ev = RegularEvent::message("alice", &[1, 2, 3]);
        let frame = ev.marshal(0x01020304);

        assert_eq!(frame[0], EvType::Message as u8);
        assert_eq!(&frame[1..5], &[1, 2, 3, 4]);

        match unmarshal_event(&frame).expect("decode") {
            Event::Regular { event, seq } => {
                assert_eq!(event, ev);
                assert_eq!(seq, 0x01020304);
            }
            other => panic!("expected regular event, got {other:?}"),
        }
    }

    #[test]
    fn test_system_event_frame_round_trip() {
        let ev = SystemEvent::peer_ready(42);
        let frame = ev.marshal();
        assert_eq!(frame[0], EvType::PeerReady as u8);

        match unmarshal_event(&frame).expect("decode") {
            Event::System(decoded) => assert_eq!(decoded, ev),
            other => panic!("expected system event, got {other:?}"),
        }
        assert_eq!(decode_peer_ready_payload(&frame[1..]).unwrap(), 42);
    }

    #[test]
    fn test_regular_event_truncated_seq_rejected() {
        assert!(unmarshal_event(&[EvType::Joined as u8, 0, 0]).is_err());
        assert!(unmarshal_event(&[]).is_err());
    }

    #[test]
    fn test_pong_payload_round_trip() {
        let mut lm = Dict::new();
        lm.insert("p1", Value::ULong(1234).marshal());
        let ev = SystemEvent::pong(999, 3, &lm);
        let pp = decode_pong_payload(ev.payload()).expect("decode");
        assert_eq!(pp.timestamp, 999);
        assert_eq!(pp.watchers, 3);
        assert_eq!(pp.last_msg, lm);
    }

    #[test]
    fn test_joined_payload_round_trip() {
        let mut props = Dict::new();
        props.insert("name", Value::Str("Alice".into()).marshal());
        let ev = RegularEvent::joined("alice", &props.marshal());
        let (id, decoded) = decode_client_payload(ev.payload()).expect("decode");
        assert_eq!(id, "alice");
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_left_payload_round_trip() {
        let ev = RegularEvent::left("bob", "alice", "leave");
        let (left, master, cause) = decode_left_payload(ev.payload()).unwrap();
        assert_eq!(left, "bob");
        assert_eq!(master, "alice");
        assert_eq!(cause, "leave");
    }

    #[test]
    fn test_message_payload_round_trip() {
        let ev = RegularEvent::message("alice", &[9, 8, 7]);
        let (sender, body) = decode_message_payload(ev.payload()).unwrap();
        assert_eq!(sender, "alice");
        assert_eq!(body, &[9, 8, 7]);
    }

    #[test]
    fn test_response_events_echo_msg_seq_and_payload() {
        let raw = msg::marshal_msg(
            "key",
            msg::MsgType::Broadcast,
            77,
            &[5, 5, 5],
        );
        let m = msg::unmarshal_msg("key", &raw).expect("decode msg");

        let ok = RegularEvent::succeeded(&m);
        assert_eq!(decode_response_payload(ok.payload()).unwrap(), (77, &[][..]));

        let denied = RegularEvent::permission_denied(&m);
        let (seq, rest) = decode_response_payload(denied.payload()).unwrap();
        assert_eq!(seq, 77);
        assert_eq!(rest, &[5, 5, 5]);

        let nf = RegularEvent::target_not_found(&m, &["ghost".to_string()]);
        let (seq, rest) = decode_response_payload(nf.payload()).unwrap();
        assert_eq!(seq, 77);
        let (ids, n) = Value::unmarshal_as(rest, &[Type::List]).unwrap();
        assert_eq!(ids, Value::List(vec![Value::Str("ghost".into())]));
        assert_eq!(&rest[n..], &[5, 5, 5]);
    }

    #[test]
    fn test_response_event_types_are_regular() {
        assert!(EvType::Succeeded.is_regular());
        assert!(EvType::Succeeded.is_response());
        assert!(EvType::Joined.is_regular());
        assert!(!EvType::Joined.is_response());
        assert!(!EvType::Pong.is_regular());
    }
}
