//! A zero-copy message channel between one client and one server over a reliable-connection
//! queue pair.
//!
//! An [`Endpoint`] owns the pinned send and receive buffers and everything the provider
//! allocates for them. [`Client`] and [`Server`] drive connection establishment on top of it, and
//! [`Messaging`] implements request/response and one-sided transfers.
pub mod buffer;
pub mod cm;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fatal;
pub mod msg;
pub mod region;
pub(crate) mod resource;

pub use rdma;

pub use cm::{Client, ClientState, ConnectionCallback, Server, ServerState};
pub use config::{EndpointConfig, WaitMode};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use fatal::{abort, OrAbort};
pub use msg::Messaging;
pub use region::RemoteRegion;
