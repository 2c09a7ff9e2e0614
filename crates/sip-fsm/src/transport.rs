//! Transport seam.
//!
//! Socket I/O lives outside the transaction layer. A [`Transport`] is one
//! connection or listening socket; a [`TransportService`] creates client
//! transports for outbound requests and replaces reliable connections that went
//! away before a response could be written.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

/// Shared handle to a transport.
pub type TransportHandle = Arc<dyn Transport>;

/// A connection (TCP/TLS/WS) or socket (UDP) able to carry SIP messages.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Writes on the connection itself. Used for reliable transports.
    async fn write_message(&self, message: &Message) -> Result<()>;

    /// Writes to an explicit destination. Used for datagram transports.
    async fn write_message_to(&self, message: &Message, destination: SocketAddr) -> Result<()>;

    /// Sends a keep-alive on a connection-oriented transport. Returns false when the peer is gone.
    async fn write_keep_alive(&self) -> bool;

    fn is_reliable_transport(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    fn local_address(&self) -> SocketAddr;

    /// Lower-case scheme (`udp`, `tcp`, `tls`, `ws`, `wss`).
    fn transport_scheme(&self) -> &str;
}

/// Factory for outbound transports.
#[async_trait]
pub trait TransportService: Send + Sync {
    /// Returns a transport from `local` to `remote` over `scheme`, reusing the
    /// connection named by `transport_id` when the service knows it.
    async fn create_client_transport(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        scheme: &str,
        transport_id: Option<&str>,
    ) -> Result<TransportHandle>;
}
