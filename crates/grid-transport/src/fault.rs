//! Link fault injection

use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Failure to provoke on the current link of a connection
#[derive(Debug, Clone)]
pub enum Fault {
    /// Stop reading; the link is torn down as if the socket failed
    KillInbound,
    /// Stop writing and drop the socket without a close message
    KillOutbound,
    /// Hold inbound frames until the token is cancelled
    BlockInbound(CancellationToken),
}

#[derive(Default)]
pub(crate) struct FaultSwitches {
    kill_inbound: CancellationToken,
    kill_outbound: CancellationToken,
    block_inbound: Mutex<Option<CancellationToken>>,
}

impl FaultSwitches {
    pub(crate) fn inject(&self, fault: Fault) {
        match fault {
            Fault::KillInbound => self.kill_inbound.cancel(),
            Fault::KillOutbound => self.kill_outbound.cancel(),
            Fault::BlockInbound(release) => {
                if let Ok(mut gate) = self.block_inbound.lock() {
                    *gate = Some(release);
                }
            }
        }
    }

    pub(crate) async fn inbound_killed(&self) {
        self.kill_inbound.cancelled().await
    }

    pub(crate) async fn outbound_killed(&self) {
        self.kill_outbound.cancelled().await
    }

    /// Resolves once inbound frames may be processed
    pub(crate) async fn inbound_released(&self) {
        let gate = match self.block_inbound.lock() {
            Ok(gate) => gate.clone(),
            Err(_) => None,
        };
        if let Some(release) = gate {
            release.cancelled().await;
        }
    }
}
