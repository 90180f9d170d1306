use std::fmt;
use std::sync::Arc;

use rdma::fabric::{CmEvent, CmEventKind, CmId, Fabric};

use super::{parse_addr, prepare_data_path, teardown, ConnectionCallback, EventLoop, Flow};
use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, ProviderResultExt, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Listening,
    ConnectRequested,
    Established,
    Disconnected,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Listening => "LISTENING",
            ServerState::ConnectRequested => "CONNECT_REQUESTED",
            ServerState::Established => "ESTABLISHED",
            ServerState::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The listening side. Serves a single connection, carried by the identity of its connect
/// request.
pub struct Server {
    endpoint: Endpoint,
    state: ServerState,
    conn_id: Option<CmId>,
    on_established: Option<ConnectionCallback>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl Server {
    /// Creates the endpoint, binds it to `addr:port` and starts listening.
    pub fn bind(
        fabric: Arc<dyn Fabric>,
        addr: &str,
        port: u16,
        config: EndpointConfig,
    ) -> Result<Self> {
        let addr = parse_addr(addr, port)?;
        let endpoint = Endpoint::create(fabric, config)?;
        tracing::info!(
            "Created RDMA server to listen on address {}, buffer sizes: send={}, recv={}",
            addr,
            endpoint.send_buf().len(),
            endpoint.recv_buf().len()
        );

        let id = endpoint
            .cm_id()
            .ok_or(Error::Destroyed)?;
        let fabric = endpoint.fabric();
        fabric.bind_addr(id, &addr).op("rdma_bind_addr")?;
        fabric
            .listen(id, endpoint.config().listen_backlog)
            .op("rdma_listen")?;
        Ok(Server {
            endpoint,
            state: ServerState::Listening,
            conn_id: None,
            on_established: None,
        })
    }

    #[inline]
    pub fn state(&self) -> ServerState {
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

    /// The identity of the accepted connection, if any.
    #[inline]
    pub fn connection_id(&self) -> Option<CmId> {
        self.conn_id
    }

    pub fn set_connection_established_callback<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_established = Some(Box::new(callback));
    }

    /// Accepts one connection and drives it until it is established.
    pub fn wait_until_connected(&mut self) -> Result<()> {
        match self.state {
            ServerState::Established => return Ok(()),
            ServerState::Disconnected => return Err(Error::NotConnected(self.state.as_str())),
            _ => {}
        }
        tracing::info!("Waiting incoming RDMA connection...");
        self.run_event_loop()?;
        tracing::info!("RDMA connection established");
        Ok(())
    }

    /// Starts an orderly disconnect of the accepted connection.
    pub fn disconnect(&mut self) -> Result<()> {
        match (self.state, self.conn_id) {
            // the endpoint may have been destroyed underneath the connection
            (ServerState::Established, Some(id)) if !self.endpoint.owns_id(id) => {
                Err(Error::Destroyed)
            }
            (ServerState::Established, Some(id)) => self
                .endpoint
                .fabric()
                .disconnect(id)
                .op("rdma_disconnect"),
            _ => Err(Error::NotConnected(self.state.as_str())),
        }
    }

    /// Drives the state machine until the connection is gone and its resources are released.
    pub fn wait_for_disconnect(&mut self) -> Result<()> {
        if self.state == ServerState::Disconnected {
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

impl EventLoop for Server {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn on_event(&mut self, event: &CmEvent) -> Result<Flow> {
        use ServerState::*;

        match (self.state, event.kind) {
            (Listening, CmEventKind::ConnectRequest) => {
                tracing::info!("Received RDMA connection request");
                self.endpoint.adopt_id(event.id);
                self.conn_id = Some(event.id);
                prepare_data_path(&mut self.endpoint, event.id)?;
                self.endpoint
                    .fabric()
                    .accept(event.id)
                    .op("rdma_accept")?;
                self.state = ConnectRequested;
                Ok(Flow::Continue)
            }
            (ConnectRequested, CmEventKind::Established) if self.conn_id == Some(event.id) => {
                self.state = Established;
                if let Some(callback) = self.on_established.as_mut() {
                    callback();
                }
                Ok(Flow::Stop)
            }
            (ConnectRequested | Established, CmEventKind::Disconnected)
                if self.conn_id == Some(event.id) =>
            {
                tracing::info!("RDMA connection disconnected");
                let was = self.state;
                self.conn_id = None;
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
    use rdma::SimFabric;

    #[test]
    fn one_listener_per_address() {
        let fabric: Arc<dyn Fabric> = Arc::new(SimFabric::new());
        let config = EndpointConfig::with_buffer_sizes(16, 16);
        let first = Server::bind(Arc::clone(&fabric), "0.0.0.0", 7472, config.clone()).unwrap();
        assert_eq!(first.state(), ServerState::Listening);
        let second = Server::bind(Arc::clone(&fabric), "0.0.0.0", 7472, config.clone());
        assert!(matches!(
            second,
            Err(Error::Provider {
                op: "rdma_listen",
                ..
            })
        ));
        drop(first);
        Server::bind(fabric, "0.0.0.0", 7472, config).unwrap();
    }

    #[test]
    fn disconnect_requires_a_connection() {
        let fabric: Arc<dyn Fabric> = Arc::new(SimFabric::new());
        let mut server =
            Server::bind(fabric, "127.0.0.1", 7473, EndpointConfig::with_buffer_sizes(16, 16))
                .unwrap();
        assert!(matches!(
            server.disconnect(),
            Err(Error::NotConnected("LISTENING"))
        ));
    }
}
