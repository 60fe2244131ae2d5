//! Grid Protocol Definitions
//!
//! This crate defines the wire frame, the identifiers carried in it and the
//! control payloads exchanged while establishing links and streams between
//! cluster peers.

pub mod frame;
pub mod handshake;
pub mod ids;

pub use frame::{Flags, Frame, Op, ProtoError};
pub use handshake::{
    decode_payload, encode_payload, ConnectReq, ConnectResp, MuxAck, MuxConnectError, PongMsg,
};
pub use ids::{AttemptId, HandlerId, MuxId, HANDLER_LIMIT};

/// Maximum payload carried by a single frame (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Mux ID used by handshake and connection-level frames
pub const CONNECTION_MUX_ID: MuxId = 0;

/// HTTP path peers upgrade on to reach the grid
pub const GRID_ROUTE_PATH: &str = "/grid/v1";
