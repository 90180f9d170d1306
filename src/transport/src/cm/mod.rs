//! Connection establishment: the client and server state machines driven by connection manager
//! events.
use std::net::{IpAddr, SocketAddr};

use rdma::fabric::{CmEvent, CmId};

use crate::endpoint::Endpoint;
use crate::error::{Error, ProviderResultExt, Result};

pub mod client;
pub mod server;

pub use client::{Client, ClientState};
pub use server::{Server, ServerState};

/// Invoked once when the connection becomes established.
pub type ConnectionCallback = Box<dyn FnMut() + Send>;

/// Whether the event loop keeps going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// A role driver fed by the event channel of its endpoint.
pub(crate) trait EventLoop {
    fn endpoint(&self) -> &Endpoint;

    fn on_event(&mut self, event: &CmEvent) -> Result<Flow>;

    /// Processes events until a handler asks to stop.
    fn run_event_loop(&mut self) -> Result<()> {
        loop {
            let event = next_event(self.endpoint())?;
            tracing::trace!("cm event: {}", event);
            if self.on_event(&event)? == Flow::Stop {
                return Ok(());
            }
        }
    }
}

/// Blocks for the next event, then hands it back to the provider right away and keeps a copy.
pub(crate) fn next_event(endpoint: &Endpoint) -> Result<CmEvent> {
    let channel = endpoint.event_channel()?;
    let fabric = endpoint.fabric();
    let event = fabric.get_cm_event(channel).op("rdma_get_cm_event")?;
    fabric.ack_cm_event(&event).op("rdma_ack_cm_event")?;
    Ok(event)
}

/// Sets up the shared context from the device `id` is bound to, creates its queue pair and
/// pre-posts one receive.
pub(crate) fn prepare_data_path(endpoint: &mut Endpoint, id: CmId) -> Result<()> {
    let verbs = endpoint
        .fabric()
        .verbs_context(id)
        .op("rdma_cm_id::verbs")?;
    endpoint.setup_shared_context(verbs)?;
    endpoint.create_qp(id)?;
    // reaped by the first receive wait on the connection
    unsafe { endpoint.post_receive() }
}

/// Destroys the queue pair of the connection, then its identity.
pub(crate) fn teardown(endpoint: &mut Endpoint, id: CmId) -> Result<()> {
    endpoint.destroy_qp()?;
    endpoint.release_id(id)
}

pub(crate) fn parse_addr(addr: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
        Error::InvalidAddress {
            addr: addr.to_owned(),
            reason: e.to_string(),
        }
    })?;
    Ok(SocketAddr::new(ip, port))
}
