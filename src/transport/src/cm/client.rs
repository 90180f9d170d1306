use std::fmt;
use std::sync::Arc;

use rdma::fabric::{CmEvent, CmEventKind, Fabric};

use super::{parse_addr, prepare_data_path, teardown, ConnectionCallback, EventLoop, Flow};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, ProviderResultExt, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    AddrResolving,
    RouteResolving,
    Connecting,
    Established,
    Disconnected,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Init => "INIT",
            ClientState::AddrResolving => "ADDR_RESOLVING",
            ClientState::RouteResolving => "ROUTE_RESOLVING",
            ClientState::Connecting => "CONNECTING",
            ClientState::Established => "ESTABLISHED",
            ClientState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The connecting side. Owns its endpoint; the connection uses the top-level identity.
pub struct Client {
    endpoint: Endpoint,
    state: ClientState,
    on_established: Option<ConnectionCallback>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}

impl Client {
    /// Creates the endpoint and starts resolving `server_addr:port`. The connection is made by
    /// [`wait_until_connected`](Self::wait_until_connected).
    pub fn connect(
        fabric: Arc<dyn Fabric>,
        server_addr: &str,
        port: u16,
        config: EndpointConfig,
    ) -> Result<Self> {
        let addr = parse_addr(server_addr, port)?;
        let endpoint = Endpoint::create(fabric, config)?;
        let mut client = Client {
            endpoint,
            state: ClientState::Init,
            on_established: None,
        };
        tracing::info!(
            "Created RDMA client to connect on address {}, buffer sizes: send={}, recv={}",
            addr,
            client.endpoint.send_buf().len(),
            client.endpoint.recv_buf().len()
        );

        let id = client
            .endpoint
            .cm_id()
            .ok_or(Error::Destroyed)?;
        let timeout_ms = client.endpoint.config().resolve_timeout_ms;
        client
            .endpoint
            .fabric()
            .resolve_addr(id, &addr, timeout_ms)
            .op("rdma_resolve_addr")?;
        client.state = ClientState::AddrResolving;
        Ok(client)
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        self.state
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[inline]
    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    pub fn set_connection_established_callback<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_established = Some(Box::new(callback));
    }

    /// Drives the state machine until the connection is established.
    pub fn wait_until_connected(&mut self) -> Result<()> {
        match self.state {
            ClientState::Established => return Ok(()),
            ClientState::Disconnected => return Err(Error::NotConnected(self.state.as_str())),
            _ => {}
        }
        tracing::info!("Waiting RDMA connection to server...");
        self.run_event_loop()?;
        tracing::info!("RDMA connection established");
        Ok(())
    }

    /// Starts an orderly disconnect; both sides then observe `DISCONNECTED`.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.state != ClientState::Established {
            return Err(Error::NotConnected(self.state.as_str()));
        }
        // gone if the endpoint was destroyed underneath the connection
        let id = self.endpoint.cm_id().ok_or(Error::Destroyed)?;
        self.endpoint
            .fabric()
            .disconnect(id)
            .op("rdma_disconnect")
    }

    /// Drives the state machine until the connection is gone and its resources are released.
    pub fn wait_for_disconnect(&mut self) -> Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.run_event_loop()
    }

    fn unexpected(&self, event: &CmEvent) -> Error {
        Error::UnexpectedEvent {
            state: self.state.as_str(),
            event: event.kind,
        }
    }
}

impl EventLoop for Client {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn on_event(&mut self, event: &CmEvent) -> Result<Flow> {
        use ClientState::*;

        match (self.state, event.kind) {
            (AddrResolving, CmEventKind::AddrResolved) => {
                tracing::info!("RDMA connection address resolved");
                prepare_data_path(&mut self.endpoint, event.id)?;
                let timeout_ms = self.endpoint.config().resolve_timeout_ms;
                self.endpoint
                    .fabric()
                    .resolve_route(event.id, timeout_ms)
                    .op("rdma_resolve_route")?;
                self.state = RouteResolving;
                Ok(Flow::Continue)
            }
            (RouteResolving, CmEventKind::RouteResolved) => {
                tracing::info!("RDMA route resolved");
                self.endpoint
                    .fabric()
                    .connect(event.id)
                    .op("rdma_connect")?;
                self.state = Connecting;
                Ok(Flow::Continue)
            }
            (Connecting, CmEventKind::Established) => {
                self.state = Established;
                if let Some(callback) = self.on_established.as_mut() {
                    callback();
                }
                Ok(Flow::Stop)
            }
            (Connecting | Established, CmEventKind::Disconnected) => {
                tracing::info!("RDMA connection disconnected");
                let was = self.state;
                teardown(&mut self.endpoint, event.id)?;
                self.state = Disconnected;
                if was != Established {
                    return Err(Error::NotConnected(was.as_str()));
                }
                Ok(Flow::Stop)
            }
            _ => Err(self.unexpected(event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::next_event;
    use rdma::SimFabric;

    fn client(fabric: &Arc<SimFabric>) -> Client {
        let fabric: Arc<dyn Fabric> = fabric.clone();
        Client::connect(fabric, "127.0.0.1", 7471, EndpointConfig::with_buffer_sizes(64, 64))
            .unwrap()
    }

    #[test]
    fn malformed_address_is_refused() {
        let fabric: Arc<dyn Fabric> = Arc::new(SimFabric::new());
        let res = Client::connect(fabric, "not-an-ip", 1, EndpointConfig::default());
        assert!(matches!(res, Err(Error::InvalidAddress { .. })));
    }

    #[test]
    fn established_before_route_is_rejected() {
        let fabric = Arc::new(SimFabric::new());
        let mut client = client(&fabric);
        let channel = client.endpoint().event_channel().unwrap();
        let id = client.endpoint().cm_id().unwrap();

        // consume ADDR_RESOLVED by hand so the route is never asked for
        let event = next_event(client.endpoint()).unwrap();
        assert_eq!(event.kind, CmEventKind::AddrResolved);
        fabric
            .inject_cm_event(channel, CmEventKind::Established, id)
            .unwrap();
        match client.wait_until_connected() {
            Err(Error::UnexpectedEvent { state, event }) => {
                assert_eq!(state, "ADDR_RESOLVING");
                assert_eq!(event, CmEventKind::Established);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejected_without_listener() {
        let fabric = Arc::new(SimFabric::new());
        let mut client = client(&fabric);
        match client.wait_until_connected() {
            Err(Error::UnexpectedEvent { state, event }) => {
                assert_eq!(state, "CONNECTING");
                assert_eq!(event, CmEventKind::Rejected);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(client.disconnect().is_err());
    }
}
