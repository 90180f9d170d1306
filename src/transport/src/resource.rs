//! Ownership table of provider resources.
//!
//! Every object obtained from the provider is recorded here right after its creation and
//! released exactly once, either on request or, for whatever is left, in reverse creation
//! order when the table is drained.
use std::sync::Arc;

use rdma::fabric::{
    CmId, CompChannel, CompletionQueue, EventChannel, Fabric, MemoryRegion, ProtectionDomain,
};

use crate::error::{ProviderResultExt, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resource {
    EventChannel(EventChannel),
    Id(CmId),
    Pd(ProtectionDomain),
    CompChannel(CompChannel),
    Cq(CompletionQueue),
    Mr(MemoryRegion),
    /// The queue pair of the identity.
    Qp(CmId),
}

impl Resource {
    fn release(&self, fabric: &dyn Fabric) -> Result<()> {
        tracing::debug!("releasing {:?}", self);
        match self {
            Resource::EventChannel(channel) => fabric
                .destroy_event_channel(*channel)
                .op("rdma_destroy_event_channel"),
            Resource::Id(id) => fabric.destroy_id(*id).op("rdma_destroy_id"),
            Resource::Pd(pd) => fabric.dealloc_pd(*pd).op("ibv_dealloc_pd"),
            Resource::CompChannel(channel) => fabric
                .destroy_comp_channel(*channel)
                .op("ibv_destroy_comp_channel"),
            Resource::Cq(cq) => fabric.destroy_cq(*cq).op("ibv_destroy_cq"),
            Resource::Mr(mr) => fabric.dereg_mr(mr).op("ibv_dereg_mr"),
            Resource::Qp(id) => fabric.destroy_qp(*id).op("rdma_destroy_qp"),
        }
    }
}

pub(crate) struct ResourceTable {
    fabric: Arc<dyn Fabric>,
    entries: Vec<Resource>,
}

impl ResourceTable {
    pub(crate) fn new(fabric: Arc<dyn Fabric>) -> Self {
        ResourceTable {
            fabric,
            entries: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, resource: Resource) {
        debug_assert!(!self.entries.contains(&resource), "{:?} tracked twice", resource);
        self.entries.push(resource);
    }

    #[inline]
    pub(crate) fn contains(&self, resource: &Resource) -> bool {
        self.entries.contains(resource)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Releases `resource` if it is still held. Releasing twice is a no-op.
    pub(crate) fn release(&mut self, resource: &Resource) -> Result<()> {
        match self.entries.iter().position(|r| r == resource) {
            Some(pos) => {
                let resource = self.entries.remove(pos);
                resource.release(self.fabric.as_ref())
            }
            None => Ok(()),
        }
    }

    /// Releases everything still held, newest first. Keeps going after a failure and reports the
    /// first one.
    pub(crate) fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(resource) = self.entries.pop() {
            if let Err(e) = resource.release(self.fabric.as_ref()) {
                tracing::warn!("failed to release {:?}: {}", resource, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ResourceTable {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            tracing::warn!("error while dropping the resource table: {}", e);
        }
    }
}
