//! RDMA provider layer: the [`Fabric`](fabric::Fabric) abstraction over the connection manager
//! and verbs, a software provider, and (with the `verbs` feature) the librdmacm/libibverbs
//! provider.
pub mod fabric;
pub mod sim;

#[cfg(feature = "verbs")]
#[allow(non_upper_case_globals)]
#[allow(non_camel_case_types)]
#[allow(non_snake_case)]
#[allow(deref_nullptr)]
#[allow(clippy::all)]
pub mod ffi {
    include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
}

#[cfg(feature = "verbs")]
pub mod verbs;

pub use fabric::Fabric;
pub use sim::SimFabric;
