use platform_link::OutboundPayload;
use shared::domain::Jid;
use tracing::{debug, warn};

use crate::{error::SessionError, orchestrator::SessionOrchestrator};

/// Forwards outbound messages to the library while the session is connected.
#[derive(Clone)]
pub struct OutboundSender {
    orchestrator: SessionOrchestrator,
}

impl OutboundSender {
    pub(crate) fn new(orchestrator: SessionOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn send_text(&self, jid: &Jid, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(jid, OutboundPayload::Text(text.into())).await
    }

    pub async fn send_binary(
        &self,
        jid: &Jid,
        data: Vec<u8>,
        mime_type: Option<String>,
    ) -> Result<(), SessionError> {
        self.send(jid, OutboundPayload::Binary { data, mime_type })
            .await
    }

    pub async fn send(&self, jid: &Jid, payload: OutboundPayload) -> Result<(), SessionError> {
        let Some(handle) = self.orchestrator.connected_handle().await? else {
            debug!(%jid, "send: refused, session not connected");
            return Err(SessionError::NotConnected);
        };
        handle.send(jid, payload).await.map_err(|err| {
            warn!(%jid, "send: library rejected message: {err:#}");
            SessionError::Send(err.to_string())
        })
    }
}
