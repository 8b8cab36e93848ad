//! Bearer abstraction for the advertising radio

use crate::context::{SendEvent, SendToken};
use crate::driver::Ingress;
use crate::error::MeshResult;
use crate::message::OutboundPdu;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Platform-agnostic advertising bearer
#[async_trait]
pub trait Bearer: Send + Sync {
    /// Put `pdu` on air `pdu.transmit.count` times, `pdu.transmit.interval`
    /// apart. Call [`SendProgress::started`] when the first copy goes out.
    async fn transmit(&self, pdu: &OutboundPdu, progress: SendProgress) -> MeshResult<()>;

    /// Turn passive scanning on or off
    async fn set_scanning(&self, enabled: bool) -> MeshResult<()>;
}

/// Reports the start of a transmission back to the node.
pub struct SendProgress {
    token: SendToken,
    ingress: Option<mpsc::Sender<Ingress>>,
}

impl SendProgress {
    pub(crate) fn new(token: SendToken, ingress: mpsc::Sender<Ingress>) -> Self {
        Self {
            token,
            ingress: Some(ingress),
        }
    }

    /// Progress that goes nowhere, for bearers driven outside a node.
    pub fn detached(token: SendToken) -> Self {
        Self {
            token,
            ingress: None,
        }
    }

    pub fn token(&self) -> SendToken {
        self.token
    }

    /// Marks the first copy as sent. Later calls do nothing.
    pub async fn started(&mut self) {
        if let Some(ingress) = self.ingress.take() {
            let event = Ingress::Send {
                token: self.token,
                event: SendEvent::Started,
            };
            if ingress.send(event).await.is_err() {
                debug!("Node stopped before send {:?} started", self.token);
            }
        }
    }
}
