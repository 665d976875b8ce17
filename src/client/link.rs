use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{HandshakeAuth, Packet};

use super::ClientError;

/// An authenticated session with the gateway.
///
/// Dropping `outbound` asks the transport to close the socket. `inbound`
/// yields packets until the first `Err`, which ends the link.
pub struct Link {
    pub connection_id: String,
    pub outbound: mpsc::UnboundedSender<Packet>,
    pub inbound: mpsc::UnboundedReceiver<Result<Packet, ClientError>>,
}

/// Transport side of a [`Link`].
pub struct LinkPeer {
    pub from_client: mpsc::UnboundedReceiver<Packet>,
    pub to_client: mpsc::UnboundedSender<Result<Packet, ClientError>>,
}

impl Link {
    pub fn pair(connection_id: impl Into<String>) -> (Link, LinkPeer) {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        (
            Link {
                connection_id: connection_id.into(),
                outbound,
                inbound,
            },
            LinkPeer {
                from_client,
                to_client,
            },
        )
    }
}

/// Opens links for the reconnection controller.
///
/// `connect` covers the whole handshake: it resolves once the server accepted
/// the CONNECT packet, or fails with the reason it did not. Dropping the
/// returned future cancels the attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, auth: &HandshakeAuth) -> Result<Link, ClientError>;
}
