//! Control payloads carried inside frames

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::frame::ProtoError;
use crate::ids::AttemptId;

/// Handshake request sent by the dialing side (`Op::Connect`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectReq {
    pub id: AttemptId,
    /// Identity the initiator claims
    pub host: String,
}

/// Handshake reply (`Op::ConnectResponse`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectResp {
    pub id: AttemptId,
    pub accepted: bool,
    pub rejected_reason: String,
}

impl ConnectResp {
    pub fn accept(id: AttemptId) -> Self {
        Self {
            id,
            accepted: true,
            rejected_reason: String::new(),
        }
    }

    pub fn reject(id: AttemptId, reason: impl Into<String>) -> Self {
        Self {
            id,
            accepted: false,
            rejected_reason: reason.into(),
        }
    }
}

/// Reply to `Op::ConnectMux` when the stream cannot be opened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MuxConnectError {
    pub error: String,
}

/// Reply of the built-in ping handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PongMsg {
    /// The mux named in the ping is not known to the responder
    pub not_found: bool,
    pub err: Option<String>,
}

/// Stream acceptance (`Op::AckMux`) with the flow-control windows of the stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MuxAck {
    /// Requests the client may send before waiting for `UnblockMux`
    pub request_window: u32,
    /// Responses the server keeps in flight at most
    pub response_window: u32,
}

/// Serialize a control payload
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, ProtoError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| ProtoError::Payload(e.to_string()))
}

/// Deserialize a control payload
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtoError> {
    bincode::deserialize(payload).map_err(|e| ProtoError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_req_payload() {
        let req = ConnectReq {
            id: AttemptId::new(),
            host: "http://10.0.0.1:9000".to_string(),
        };
        let bytes = encode_payload(&req).unwrap();
        let decoded: ConnectReq = decode_payload(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_connect_resp_helpers() {
        let id = AttemptId::new();
        let ok = ConnectResp::accept(id);
        assert!(ok.accepted);
        assert!(ok.rejected_reason.is_empty());

        let no = ConnectResp::reject(id, "unknown host");
        assert!(!no.accepted);
        assert_eq!(no.rejected_reason, "unknown host");
        assert_eq!(no.id, id);
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let result: Result<ConnectResp, _> = decode_payload(&[0xff]);
        assert!(matches!(result, Err(ProtoError::Payload(_))));
    }

    #[test]
    fn test_pong_with_error() {
        let pong = PongMsg {
            not_found: true,
            err: Some("gone".to_string()),
        };
        let decoded: PongMsg = decode_payload(&encode_payload(&pong).unwrap()).unwrap();
        assert_eq!(decoded, pong);
    }
}
