//! Wire format for the Roomcast relay.
//!
//! Pure encode/decode: typed values and insertion-ordered dicts, the
//! server→client event frames, and the MAC-authenticated client→server
//! message frames. No I/O and no async — everything here is a function of
//! bytes, shared by the relay, hub nodes, and test clients alike.

mod error;
pub mod event;
pub mod msg;
mod value;

pub use error::ProtocolError;
pub use event::{
    decode_client_payload, decode_left_payload, decode_master_switched_payload,
    decode_message_payload, decode_peer_ready_payload, decode_pong_payload,
    decode_response_payload, unmarshal_event, EvType, Event, PongPayload,
    RegularEvent, SystemEvent,
};
pub use msg::{
    marshal_msg, unmarshal_msg, Msg, MsgBody, MsgType, RoomPropPayload, MAC_LEN,
};
pub use value::{get_u24, put_u24, Dict, Type, Value};
