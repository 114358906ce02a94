//! Client→server message frames.
//!
//! Frame layout: `| type | 24bit-be seq | payload | 4-byte MAC |`.
//! The MAC is HMAC-SHA1 over everything before it, keyed with the
//! per-client secret, truncated to its first four bytes. Verification is
//! constant-time; a wrong MAC is indistinguishable from a malformed frame.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::value::{get_u24, put_u24, Dict, Type, Value};
use crate::ProtocolError;

type HmacSha1 = Hmac<Sha1>;

/// Length of the truncated MAC trailer.
pub const MAC_LEN: usize = 4;

/// Minimum frame: type byte, 3-byte seq, empty payload, MAC.
const MIN_FRAME: usize = 4 + MAC_LEN;

/// First message type that carries room-mutating semantics. Below this are
/// system messages (ping, node count).
pub const REGULAR_MSG_TYPE: u8 = 30;

/// Message type bytes. Values are wire format; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 1,
    NodeCount = 2,
    Leave = 30,
    RoomProp = 31,
    ClientProp = 32,
    SwitchMaster = 33,
    Targets = 34,
    ToMaster = 35,
    Broadcast = 36,
    Kick = 37,
}

impl MsgType {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            1 => Self::Ping,
            2 => Self::NodeCount,
            30 => Self::Leave,
            31 => Self::RoomProp,
            32 => Self::ClientProp,
            33 => Self::SwitchMaster,
            34 => Self::Targets,
            35 => Self::ToMaster,
            36 => Self::Broadcast,
            37 => Self::Kick,
            other => return Err(ProtocolError::UnknownMsgType(other)),
        })
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Room-property update carried by a `RoomProp` message, and echoed
/// verbatim as the `RoomProp` event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPropPayload {
    pub visible: bool,
    pub joinable: bool,
    pub watchable: bool,
    pub search_group: u32,
    pub max_players: u16,
    /// New idle deadline in seconds; 0 leaves the deadline unchanged.
    pub client_deadline: u16,
    pub public_props: Dict,
    pub private_props: Dict,
}

pub const ROOM_FLAG_VISIBLE: u8 = 1;
pub const ROOM_FLAG_JOINABLE: u8 = 2;
pub const ROOM_FLAG_WATCHABLE: u8 = 4;

impl RoomPropPayload {
    pub fn marshal(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.visible {
            flags |= ROOM_FLAG_VISIBLE;
        }
        if self.joinable {
            flags |= ROOM_FLAG_JOINABLE;
        }
        if self.watchable {
            flags |= ROOM_FLAG_WATCHABLE;
        }
        let mut buf = Value::Byte(flags).marshal();
        Value::UInt(self.search_group).marshal_into(&mut buf);
        Value::UShort(self.max_players).marshal_into(&mut buf);
        Value::UShort(self.client_deadline).marshal_into(&mut buf);
        self.public_props.marshal_into(&mut buf);
        self.private_props.marshal_into(&mut buf);
        buf
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (flags, n) = Value::unmarshal_as(payload, &[Type::Byte])?;
        let flags = match flags {
            Value::Byte(b) => b,
            _ => unreachable!(),
        };
        let mut rest = &payload[n..];

        let (group, n) = Value::unmarshal_as(rest, &[Type::UInt])?;
        rest = &rest[n..];
        let (maxp, n) = Value::unmarshal_as(rest, &[Type::UShort])?;
        rest = &rest[n..];
        let (deadline, n) = Value::unmarshal_as(rest, &[Type::UShort])?;
        rest = &rest[n..];
        let (pubp, n) = Value::unmarshal_as(rest, &[Type::Dict])?;
        rest = &rest[n..];
        let (privp, _) = Value::unmarshal_as(rest, &[Type::Dict])?;

        Ok(Self {
            visible: flags & ROOM_FLAG_VISIBLE != 0,
            joinable: flags & ROOM_FLAG_JOINABLE != 0,
            watchable: flags & ROOM_FLAG_WATCHABLE != 0,
            search_group: match group {
                Value::UInt(v) => v,
                _ => unreachable!(),
            },
            max_players: match maxp {
                Value::UShort(v) => v,
                _ => unreachable!(),
            },
            client_deadline: match deadline {
                Value::UShort(v) => v,
                _ => unreachable!(),
            },
            public_props: match pubp {
                Value::Dict(d) => d,
                _ => unreachable!(),
            },
            private_props: match privp {
                Value::Dict(d) => d,
                _ => unreachable!(),
            },
        })
    }
}

/// Parsed body of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgBody {
    Ping { timestamp: u64 },
    NodeCount { count: u32 },
    Leave { message: String },
    RoomProp(RoomPropPayload),
    ClientProp { props: Dict },
    SwitchMaster { target: String },
    Targets { targets: Vec<String>, data: Vec<u8> },
    ToMaster { data: Vec<u8> },
    Broadcast { data: Vec<u8> },
    Kick { target: String, message: String },
}

/// A fully decoded, MAC-verified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub mtype: MsgType,
    pub seq: u32,
    payload: Vec<u8>,
    pub body: MsgBody,
}

impl Msg {
    /// The raw payload bytes, kept for response events that echo them.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Verifies the MAC trailer and parses the frame.
pub fn unmarshal_msg(mac_key: &str, data: &[u8]) -> Result<Msg, ProtocolError> {
    if data.len() < MIN_FRAME {
        return Err(ProtocolError::TooShort(data.len()));
    }
    let (signed, tag) = data.split_at(data.len() - MAC_LEN);

    let mut mac = HmacSha1::new_from_slice(mac_key.as_bytes())
        .map_err(|_| ProtocolError::BadMac)?;
    mac.update(signed);
    // Constant-time comparison of the truncated tag.
    mac.verify_truncated_left(tag)
        .map_err(|_| ProtocolError::BadMac)?;

    let mtype = MsgType::from_byte(signed[0])?;
    let seq = get_u24(&signed[1..])?;
    let payload = signed[4..].to_vec();
    let body = parse_body(mtype, &payload)?;

    Ok(Msg {
        mtype,
        seq,
        payload,
        body,
    })
}

/// Builds a signed frame. Used by client SDKs, hub nodes, and tests; the
/// relay itself only decodes.
pub fn marshal_msg(mac_key: &str, mtype: MsgType, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len() + MAC_LEN);
    buf.push(mtype as u8);
    put_u24(&mut buf, seq);
    buf.extend_from_slice(payload);

    let mut mac = HmacSha1::new_from_slice(mac_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(&buf);
    let tag = mac.finalize().into_bytes();
    buf.extend_from_slice(&tag[..MAC_LEN]);
    buf
}

fn parse_body(mtype: MsgType, payload: &[u8]) -> Result<MsgBody, ProtocolError> {
    Ok(match mtype {
        MsgType::Ping => {
            let (v, _) = Value::unmarshal_as(payload, &[Type::ULong])?;
            MsgBody::Ping {
                timestamp: match v {
                    Value::ULong(t) => t,
                    _ => unreachable!(),
                },
            }
        }
        MsgType::NodeCount => {
            let (v, _) = Value::unmarshal_as(payload, &[Type::UInt])?;
            MsgBody::NodeCount {
                count: match v {
                    Value::UInt(c) => c,
                    _ => unreachable!(),
                },
            }
        }
        MsgType::Leave => {
            let (message, _) = Value::unmarshal_str8(payload)?;
            MsgBody::Leave { message }
        }
        MsgType::RoomProp => MsgBody::RoomProp(RoomPropPayload::unmarshal(payload)?),
        MsgType::ClientProp => {
            let (v, _) = Value::unmarshal_as(payload, &[Type::Dict])?;
            MsgBody::ClientProp {
                props: match v {
                    Value::Dict(d) => d,
                    _ => unreachable!(),
                },
            }
        }
        MsgType::SwitchMaster => {
            let (target, _) = Value::unmarshal_str8(payload)?;
            MsgBody::SwitchMaster { target }
        }
        MsgType::Targets => {
            let (ids, n) = Value::unmarshal_as(payload, &[Type::List])?;
            let targets = match ids {
                Value::List(items) => items
                    .into_iter()
                    .map(|v| match v {
                        Value::Str(s) => Ok(s),
                        _ => Err(ProtocolError::UnexpectedType {
                            expected: vec![Type::Str8],
                            got: Type::List,
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => unreachable!(),
            };
            MsgBody::Targets {
                targets,
                data: payload[n..].to_vec(),
            }
        }
        MsgType::ToMaster => MsgBody::ToMaster {
            data: payload.to_vec(),
        },
        MsgType::Broadcast => MsgBody::Broadcast {
            data: payload.to_vec(),
        },
        MsgType::Kick => {
            let (target, n) = Value::unmarshal_str8(payload)?;
            let (message, _) = Value::unmarshal_str8(&payload[n..])?;
            MsgBody::Kick { target, message }
        }
    })
}

// -- Payload builders (client side of the wire) -----------------------------

pub fn ping_payload(timestamp: u64) -> Vec<u8> {
    Value::ULong(timestamp).marshal()
}

pub fn node_count_payload(count: u32) -> Vec<u8> {
    Value::UInt(count).marshal()
}

pub fn leave_payload(message: &str) -> Vec<u8> {
    Value::Str(message.to_string()).marshal()
}

pub fn switch_master_payload(target: &str) -> Vec<u8> {
    Value::Str(target.to_string()).marshal()
}

pub fn targets_payload(targets: &[&str], data: &[u8]) -> Vec<u8> {
    let ids = Value::List(
        targets
            .iter()
            .map(|t| Value::Str((*t).to_string()))
            .collect(),
    );
    let mut buf = ids.marshal();
    buf.extend_from_slice(data);
    buf
}

pub fn kick_payload(target: &str, message: &str) -> Vec<u8> {
    let mut buf = Value::Str(target.to_string()).marshal();
    Value::Str(message.to_string()).marshal_into(&mut buf);
    buf
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef";

    #[test]
    fn test_msg_round_trip_with_valid_mac() {
        let frame = marshal_msg(KEY, MsgType::Broadcast, 12, &[1, 2, 3]);
        let msg = unmarshal_msg(KEY, &frame).expect("decode");
        assert_eq!(msg.mtype, MsgType::Broadcast);
        assert_eq!(msg.seq, 12);
        assert_eq!(msg.payload(), &[1, 2, 3]);
        assert_eq!(msg.body, MsgBody::Broadcast { data: vec![1, 2, 3] });
    }

    #[test]
    fn test_wrong_key_rejected() {
        let frame = marshal_msg(KEY, MsgType::Broadcast, 1, &[]);
        let err = unmarshal_msg("other-key", &frame).unwrap_err();
        assert!(matches!(err, ProtocolError::BadMac));
    }

    #[test]
    fn test_any_bit_flip_rejected() {
        let frame = marshal_msg(KEY, MsgType::Broadcast, 1, &[0xAA, 0xBB]);
        for i in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupt = frame.clone();
                corrupt[i] ^= 1 << bit;
                assert!(
                    unmarshal_msg(KEY, &corrupt).is_err(),
                    "flip at byte {i} bit {bit} must not verify"
                );
            }
        }
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(unmarshal_msg(KEY, &[]).is_err());
        assert!(unmarshal_msg(KEY, &[1, 0, 0, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        // Sign a frame with an out-of-range type byte: the MAC passes but
        // the type must still be refused.
        let mut buf = vec![99u8];
        put_u24(&mut buf, 1);
        let mut mac = HmacSha1::new_from_slice(KEY.as_bytes()).unwrap();
        mac.update(&buf);
        let tag = mac.finalize().into_bytes();
        buf.extend_from_slice(&tag[..MAC_LEN]);

        let err = unmarshal_msg(KEY, &buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMsgType(99)));
    }

    #[test]
    fn test_ping_body() {
        let frame = marshal_msg(KEY, MsgType::Ping, 3, &ping_payload(777));
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(msg.body, MsgBody::Ping { timestamp: 777 });
    }

    #[test]
    fn test_node_count_body() {
        let frame = marshal_msg(KEY, MsgType::NodeCount, 4, &node_count_payload(5));
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(msg.body, MsgBody::NodeCount { count: 5 });
    }

    #[test]
    fn test_leave_body() {
        let frame = marshal_msg(KEY, MsgType::Leave, 9, &leave_payload("bye"));
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(msg.body, MsgBody::Leave { message: "bye".into() });
    }

    #[test]
    fn test_targets_body_keeps_trailing_data() {
        let frame = marshal_msg(
            KEY,
            MsgType::Targets,
            5,
            &targets_payload(&["a", "b"], &[7, 7]),
        );
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(
            msg.body,
            MsgBody::Targets {
                targets: vec!["a".into(), "b".into()],
                data: vec![7, 7],
            }
        );
    }

    #[test]
    fn test_kick_body() {
        let frame = marshal_msg(KEY, MsgType::Kick, 6, &kick_payload("bob", "afk"));
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(
            msg.body,
            MsgBody::Kick {
                target: "bob".into(),
                message: "afk".into(),
            }
        );
    }

    #[test]
    fn test_room_prop_payload_round_trip() {
        let mut pubp = Dict::new();
        pubp.insert("title", Value::Str("room".into()).marshal());
        let rpp = RoomPropPayload {
            visible: true,
            joinable: false,
            watchable: true,
            search_group: 7,
            max_players: 10,
            client_deadline: 60,
            public_props: pubp,
            private_props: Dict::new(),
        };
        let decoded = RoomPropPayload::unmarshal(&rpp.marshal()).expect("decode");
        assert_eq!(decoded, rpp);
    }

    #[test]
    fn test_room_prop_via_frame() {
        let rpp = RoomPropPayload {
            visible: true,
            joinable: true,
            watchable: false,
            search_group: 0,
            max_players: 4,
            client_deadline: 0,
            public_props: Dict::new(),
            private_props: Dict::new(),
        };
        let frame = marshal_msg(KEY, MsgType::RoomProp, 2, &rpp.marshal());
        let msg = unmarshal_msg(KEY, &frame).unwrap();
        assert_eq!(msg.body, MsgBody::RoomProp(rpp));
    }
}
