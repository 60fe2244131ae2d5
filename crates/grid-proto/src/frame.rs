//! Wire frame for the grid protocol

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use crate::ids::{HandlerId, MuxId, HANDLER_LIMIT};

/// Operation carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Initiator handshake request
    Connect = 1,
    /// Acceptor handshake reply
    ConnectResponse = 2,
    /// Single request
    Request = 3,
    /// Reply to a single request
    Response = 4,
    /// Open a stream
    ConnectMux = 5,
    /// Stream could not be opened
    MuxConnectError = 6,
    /// Stream finished (from server) or cancelled (from client)
    DisconnectMux = 7,
    /// Stream request data
    MuxClientMsg = 8,
    /// Stream response data
    MuxServerMsg = 9,
    /// Terminal stream error
    MuxServerErr = 10,
    /// One flow-control credit for the peer
    UnblockMux = 11,
    /// Stream accepted
    AckMux = 12,
    /// Connection going away
    Disconnect = 13,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::Connect => "Connect",
            Op::ConnectResponse => "ConnectResponse",
            Op::Request => "Request",
            Op::Response => "Response",
            Op::ConnectMux => "ConnectMux",
            Op::MuxConnectError => "MuxConnectError",
            Op::DisconnectMux => "DisconnectMux",
            Op::MuxClientMsg => "MuxClientMsg",
            Op::MuxServerMsg => "MuxServerMsg",
            Op::MuxServerErr => "MuxServerErr",
            Op::UnblockMux => "UnblockMux",
            Op::AckMux => "AckMux",
            Op::Disconnect => "Disconnect",
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Op::Connect),
            2 => Ok(Op::ConnectResponse),
            3 => Ok(Op::Request),
            4 => Ok(Op::Response),
            5 => Ok(Op::ConnectMux),
            6 => Ok(Op::MuxConnectError),
            7 => Ok(Op::DisconnectMux),
            8 => Ok(Op::MuxClientMsg),
            9 => Ok(Op::MuxServerMsg),
            10 => Ok(Op::MuxServerErr),
            11 => Ok(Op::UnblockMux),
            12 => Ok(Op::AckMux),
            13 => Ok(Op::Disconnect),
            _ => Err(ProtoError::InvalidOp(value)),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    /// Sender is done with this direction of the mux
    pub const EOF: u8 = 0b0000_0001;
    /// Stream is best-effort, responses may be dropped
    pub const STATELESS: u8 = 0b0000_0010;
    /// Payload is a remote error message
    pub const PAYLOAD_IS_ERR: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_eof(mut self) -> Self {
        self.0 |= Self::EOF;
        self
    }

    pub fn with_stateless(mut self) -> Self {
        self.0 |= Self::STATELESS;
        self
    }

    pub fn with_payload_err(mut self) -> Self {
        self.0 |= Self::PAYLOAD_IS_ERR;
        self
    }

    pub fn has_eof(&self) -> bool {
        self.0 & Self::EOF != 0
    }

    pub fn is_stateless(&self) -> bool {
        self.0 & Self::STATELESS != 0
    }

    pub fn payload_is_err(&self) -> bool {
        self.0 & Self::PAYLOAD_IS_ERR != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// One unit on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub mux_id: MuxId,
    pub seq: u32,
    pub handler: HandlerId,
    pub op: Op,
    pub flags: Flags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: mux_id (8) + seq (4) + handler (1) + op (1) + flags (1) + length (4) = 19 bytes
    pub const HEADER_SIZE: usize = 19;

    pub fn new(mux_id: MuxId, op: Op, payload: Bytes) -> Self {
        Self {
            mux_id,
            seq: 0,
            handler: HandlerId::INVALID,
            op,
            flags: Flags::new(),
            payload,
        }
    }

    /// Connection-level frame (handshake, disconnect)
    pub fn connection(op: Op, payload: Bytes) -> Self {
        Self::new(crate::CONNECTION_MUX_ID, op, payload)
    }

    pub fn with_handler(mut self, handler: HandlerId) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(ProtoError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u64(self.mux_id);
        buf.put_u32(self.seq);
        buf.put_u8(self.handler.as_u8());
        buf.put_u8(self.op as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(ProtoError::IncompleteFrame);
        }

        let mux_id = buf.get_u64();
        let seq = buf.get_u32();
        let handler = buf.get_u8();
        if handler as usize >= HANDLER_LIMIT {
            return Err(ProtoError::InvalidHandler(handler));
        }
        let op = Op::try_from(buf.get_u8())?;
        let flags = Flags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(ProtoError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);
        if buf.has_remaining() {
            return Err(ProtoError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            mux_id,
            seq,
            handler: HandlerId::from_raw(handler),
            op,
            flags,
            payload,
        })
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid op: {0}")]
    InvalidOp(u8),

    #[error("Invalid handler id: {0}")]
    InvalidHandler(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("Payload error: {0}")]
    Payload(String),
}
