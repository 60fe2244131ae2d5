//! Link handshake
//!
//! The initiator sends `Connect` on mux 0 and waits for `ConnectResponse`.
//! The acceptor answers with the outcome of [`evaluate_connect`].

use grid_proto::{decode_payload, encode_payload, AttemptId, ConnectReq, ConnectResp, Frame, Op};
use tracing::debug;

use crate::arbitration::should_connect;
use crate::error::{GridError, GridResult};
use crate::link::Link;

/// Decide whether to accept a handshake from `req.host`.
///
/// `auth` is the outcome of the inbound authentication hook.
pub fn evaluate_connect(
    local: &str,
    hosts: &[String],
    auth: Result<(), String>,
    req: &ConnectReq,
) -> ConnectResp {
    if let Err(e) = auth {
        return ConnectResp::reject(req.id, format!("authentication failed: {}", e));
    }
    if req.host == local {
        return ConnectResp::reject(req.id, "connection to self");
    }
    if !hosts.iter().any(|h| *h == req.host) {
        return ConnectResp::reject(req.id, format!("unknown host {}", req.host));
    }
    if !should_connect(&req.host, local) {
        return ConnectResp::reject(
            req.id,
            format!("{} is not expected to dial {}", req.host, local),
        );
    }
    ConnectResp::accept(req.id)
}

/// Initiator side: announce `local` and wait for acceptance
pub async fn client_handshake(link: &mut Link, local: &str) -> GridResult<()> {
    let req = ConnectReq {
        id: AttemptId::new(),
        host: local.to_string(),
    };
    link.send_frame(&Frame::connection(Op::Connect, encode_payload(&req)?))
        .await?;

    let frame = link.next_frame().await?;
    if frame.op != Op::ConnectResponse {
        return Err(GridError::HandshakeFailed(format!(
            "expected ConnectResponse, got {}",
            frame.op
        )));
    }

    let resp: ConnectResp = decode_payload(&frame.payload)?;
    if resp.id != req.id {
        return Err(GridError::HandshakeFailed(format!(
            "response for attempt {} does not match {}",
            resp.id, req.id
        )));
    }
    if !resp.accepted {
        return Err(GridError::HandshakeRejected(resp.rejected_reason));
    }

    debug!("Handshake {} accepted", req.id);
    Ok(())
}

/// Acceptor side: read the initiator's `Connect`
pub async fn read_connect(link: &mut Link) -> GridResult<ConnectReq> {
    let frame = link.next_frame().await?;
    if frame.op != Op::Connect {
        return Err(GridError::HandshakeFailed(format!(
            "expected Connect, got {}",
            frame.op
        )));
    }
    Ok(decode_payload(&frame.payload)?)
}

pub async fn send_connect_response(link: &mut Link, resp: &ConnectResp) -> GridResult<()> {
    link.send_frame(&Frame::connection(Op::ConnectResponse, encode_payload(resp)?))
        .await
}
