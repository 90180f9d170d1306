//! The transport endpoint: pinned buffers, their registrations, the completion queue and the
//! queue pair, plus the blocking primitives to post work and reap completions.
use std::sync::Arc;

use rdma::fabric::{
    AccessFlags, CmId, CompChannel, CompletionQueue, EventChannel, Fabric, MemoryRegion,
    ProtectionDomain, QpCapability, QpInitAttr, QueuePair, RecvWorkRequest, RemoteKey, SendFlags,
    SendWorkRequest, Sge, VerbsContext, WcOpcode, WorkCompletion, WrOpcode,
};

use crate::buffer::PinnedBuffer;
use crate::config::{EndpointConfig, WaitMode};
use crate::error::{Error, ProviderResultExt, Result};
use crate::region::RemoteRegion;
use crate::resource::{Resource, ResourceTable};

/// Protection domain, completion channel, completion queue and the two registrations. At most
/// one per endpoint, bound to a single device.
#[derive(Debug)]
struct SharedContext {
    verbs: VerbsContext,
    pd: ProtectionDomain,
    comp_channel: CompChannel,
    cq: CompletionQueue,
    send_mr: MemoryRegion,
    recv_mr: MemoryRegion,
}

pub struct Endpoint {
    fabric: Arc<dyn Fabric>,
    config: EndpointConfig,
    // Declared before the buffers so that registrations go before the memory does.
    resources: ResourceTable,
    send_buf: PinnedBuffer,
    recv_buf: PinnedBuffer,
    channel: Option<EventChannel>,
    id: Option<CmId>,
    ctx: Option<SharedContext>,
    qp: Option<(CmId, QueuePair)>,
    next_wr_id: u64,
    outstanding_sends: usize,
    posted_recvs: usize,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("fabric", &self.fabric.name())
            .field("send_buf", &self.send_buf)
            .field("recv_buf", &self.recv_buf)
            .field("id", &self.id)
            .field("ctx", &self.ctx)
            .field("qp", &self.qp)
            .field("resources", &self.resources.len())
            .finish()
    }
}

impl Endpoint {
    /// Allocates both buffers, the event channel and the top-level connection identity.
    pub fn create(fabric: Arc<dyn Fabric>, config: EndpointConfig) -> Result<Self> {
        config.validate()?;
        let send_buf = PinnedBuffer::new(config.send_buffer_size)?;
        let recv_buf = PinnedBuffer::new(config.recv_buffer_size)?;
        let mut resources = ResourceTable::new(Arc::clone(&fabric));

        let channel = fabric
            .create_event_channel()
            .op("rdma_create_event_channel")?;
        resources.track(Resource::EventChannel(channel));
        let id = fabric.create_id(channel).op("rdma_create_id")?;
        resources.track(Resource::Id(id));

        tracing::debug!(
            "endpoint created on {} fabric: send {} bytes, recv {} bytes",
            fabric.name(),
            send_buf.len(),
            recv_buf.len()
        );
        Ok(Endpoint {
            fabric,
            config,
            resources,
            send_buf,
            recv_buf,
            channel: Some(channel),
            id: Some(id),
            ctx: None,
            qp: None,
            next_wr_id: 0,
            outstanding_sends: 0,
            posted_recvs: 0,
        })
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    #[inline]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn event_channel(&self) -> Result<EventChannel> {
        self.channel.ok_or(Error::Destroyed)
    }

    /// The top-level connection identity, `None` once it has been torn down.
    #[inline]
    pub fn cm_id(&self) -> Option<CmId> {
        self.id
    }

    #[inline]
    pub fn queue_pair(&self) -> Option<QueuePair> {
        self.qp.map(|(_, qp)| qp)
    }

    #[inline]
    pub fn verbs_context(&self) -> Option<VerbsContext> {
        self.ctx.as_ref().map(|ctx| ctx.verbs)
    }

    /// Takes ownership of an identity handed out by the provider, e.g. for a connect request.
    pub(crate) fn adopt_id(&mut self, id: CmId) {
        let resource = Resource::Id(id);
        if !self.resources.contains(&resource) {
            self.resources.track(resource);
        }
    }

    /// Whether `id` is still alive and owned by this endpoint.
    pub(crate) fn owns_id(&self, id: CmId) -> bool {
        self.resources.contains(&Resource::Id(id))
    }

    /// Destroys an identity owned by this endpoint. No-op if it is already gone.
    pub(crate) fn release_id(&mut self, id: CmId) -> Result<()> {
        if self.id == Some(id) {
            self.id = None;
        }
        self.resources.release(&Resource::Id(id))
    }

    pub fn setup_shared_context(&mut self, verbs: VerbsContext) -> Result<()> {
        if let Some(ctx) = &self.ctx {
            if ctx.verbs != verbs {
                return Err(Error::ContextConflict);
            }
            return Ok(());
        }

        let fabric = Arc::clone(&self.fabric);
        let pd = fabric.alloc_pd(verbs).op("ibv_alloc_pd")?;
        self.resources.track(Resource::Pd(pd));
        let comp_channel = fabric
            .create_comp_channel(verbs)
            .op("ibv_create_comp_channel")?;
        self.resources.track(Resource::CompChannel(comp_channel));
        let cq = fabric
            .create_cq(verbs, self.config.cq_depth, Some(comp_channel))
            .op("ibv_create_cq")?;
        self.resources.track(Resource::Cq(cq));
        fabric.req_notify_cq(cq, false).op("ibv_req_notify_cq")?;

        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        let send_mr = unsafe {
            fabric.reg_mr(pd, self.send_buf.as_mut_ptr(), self.send_buf.len(), access)
        }
        .op("ibv_reg_mr")?;
        self.resources.track(Resource::Mr(send_mr.clone()));
        let recv_mr = unsafe {
            fabric.reg_mr(pd, self.recv_buf.as_mut_ptr(), self.recv_buf.len(), access)
        }
        .op("ibv_reg_mr")?;
        self.resources.track(Resource::Mr(recv_mr.clone()));

        tracing::debug!(
            "shared context ready: pd {:?}, cq {:?}, send lkey {:#x}, recv rkey {:#x}",
            pd,
            cq,
            send_mr.lkey,
            recv_mr.rkey
        );
        self.ctx = Some(SharedContext {
            verbs,
            pd,
            comp_channel,
            cq,
            send_mr,
            recv_mr,
        });
        Ok(())
    }

    /// Creates the queue pair of `id` on the shared completion queue.
    pub fn create_qp(&mut self, id: CmId) -> Result<QueuePair> {
        if self.qp.is_some() {
            return Err(Error::QueuePairExists);
        }
        let ctx = self.ctx.as_ref().ok_or(Error::NoContext("create_qp"))?;
        let attr = QpInitAttr {
            send_cq: ctx.cq,
            recv_cq: ctx.cq,
            cap: QpCapability {
                max_send_wr: self.config.max_send_wr,
                max_recv_wr: self.config.max_recv_wr,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            sq_sig_all: false,
        };
        let qp = self
            .fabric
            .create_qp(id, ctx.pd, &attr)
            .op("rdma_create_qp")?;
        self.resources.track(Resource::Qp(id));
        self.qp = Some((id, qp));
        Ok(qp)
    }

    /// Destroys the queue pair. Work still in flight on it is abandoned.
    pub(crate) fn destroy_qp(&mut self) -> Result<()> {
        if let Some((id, _)) = self.qp.take() {
            self.outstanding_sends = 0;
            self.posted_recvs = 0;
            self.resources.release(&Resource::Qp(id))?;
        }
        Ok(())
    }

    fn data_path(&self, op: &'static str) -> Result<(QueuePair, &SharedContext)> {
        let (_, qp) = self.qp.ok_or(Error::NoQueuePair(op))?;
        let ctx = self.ctx.as_ref().ok_or(Error::NoContext(op))?;
        Ok((qp, ctx))
    }

    fn alloc_wr_id(&mut self) -> u64 {
        self.next_wr_id = self.next_wr_id.wrapping_add(1);
        self.next_wr_id
    }

    fn check_len(len: usize, capacity: usize) -> Result<u32> {
        if len > capacity {
            return Err(Error::SizeOverflow {
                size: len,
                capacity,
            });
        }
        u32::try_from(len).map_err(|_| Error::SizeOverflow {
            size: len,
            capacity: u32::MAX as usize,
        })
    }

    /// Posts a receive of the whole receive buffer.
    ///
    /// # Safety
    ///
    /// The peer writes into the receive buffer until the receive completes. Its contents can only
    /// be relied upon after a completion for this receive has been reaped with one of the `wait_*`
    /// calls.
    pub unsafe fn post_receive(&mut self) -> Result<()> {
        let wr_id = self.alloc_wr_id();
        let (qp, ctx) = self.data_path("post_receive")?;
        let wr = RecvWorkRequest {
            wr_id,
            sge: Sge {
                addr: self.recv_buf.addr(),
                length: self.recv_buf.len() as u32,
                lkey: ctx.recv_mr.lkey,
            },
        };
        self.fabric.post_recv(qp, &wr).op("ibv_post_recv")?;
        self.posted_recvs += 1;
        Ok(())
    }

    /// Posts a send of the first `size` bytes of the send buffer.
    ///
    /// # Safety
    ///
    /// The send buffer is read by the provider until the request is fully executed. It must not
    /// be modified before a completion for this send has been reaped, which requires `signaled`.
    /// An unsignaled send leaves the buffer in use until a later signaled request on the same
    /// queue pair completes.
    pub unsafe fn post_send(&mut self, size: usize, signaled: bool) -> Result<()> {
        let length = Self::check_len(size, self.send_buf.len())?;
        self.post_send_wr(WrOpcode::Send, length, signaled)
    }

    /// Writes the whole send buffer into the peer's region. Generates no completion locally.
    ///
    /// # Safety
    ///
    /// Same as [`post_send`](Self::post_send) for an unsignaled request. The peer region must
    /// also have been advertised for remote writes.
    pub unsafe fn post_write(&mut self, remote_addr: u64, rkey: u32) -> Result<()> {
        let remote = RemoteKey {
            addr: remote_addr,
            rkey,
        };
        self.post_write_bytes(self.send_buf.len(), remote, None, false)
    }

    /// Like [`post_write`](Self::post_write), and the peer's next receive completes with
    /// `payload` as its immediate value.
    ///
    /// # Safety
    ///
    /// See [`post_write`](Self::post_write).
    pub unsafe fn post_write_with_payload(
        &mut self,
        remote_addr: u64,
        rkey: u32,
        payload: u32,
    ) -> Result<()> {
        let remote = RemoteKey {
            addr: remote_addr,
            rkey,
        };
        self.post_write_bytes(self.send_buf.len(), remote, Some(payload), false)
    }

    /// Writes the first `len` bytes of the send buffer into the peer's region.
    ///
    /// # Safety
    ///
    /// See [`post_send`](Self::post_send).
    pub unsafe fn post_write_bytes(
        &mut self,
        len: usize,
        remote: RemoteKey,
        payload: Option<u32>,
        signaled: bool,
    ) -> Result<()> {
        let length = Self::check_len(len, self.send_buf.len())?;
        let opcode = match payload {
            Some(imm) => WrOpcode::RdmaWriteWithImm(remote, imm),
            None => WrOpcode::RdmaWrite(remote),
        };
        self.post_send_wr(opcode, length, signaled)
    }

    unsafe fn post_send_wr(
        &mut self,
        opcode: WrOpcode,
        length: u32,
        signaled: bool,
    ) -> Result<()> {
        let wr_id = self.alloc_wr_id();
        let (qp, ctx) = self.data_path("post_send")?;
        let wr = SendWorkRequest {
            wr_id,
            opcode,
            flags: if signaled {
                SendFlags::SIGNALED
            } else {
                SendFlags::empty()
            },
            sge: Sge {
                addr: self.send_buf.addr(),
                length,
                lkey: ctx.send_mr.lkey,
            },
        };
        self.fabric.post_send(qp, &wr).op("ibv_post_send")?;
        if signaled {
            self.outstanding_sends += 1;
        }
        Ok(())
    }

    /// Blocks until one completion is available and returns it. Consumes exactly one entry; a
    /// failed entry is consumed too and reported as an error.
    pub fn wait_completion(&mut self) -> Result<WorkCompletion> {
        let (cq, comp_channel) = {
            let ctx = self.ctx.as_ref().ok_or(Error::NoContext("wait_completion"))?;
            (ctx.cq, ctx.comp_channel)
        };
        let wc = match self.config.wait_mode {
            WaitMode::Notify => self.wait_notified(cq, comp_channel)?,
            WaitMode::Spin => self.wait_spinning(cq)?,
        };

        match wc.opcode {
            WcOpcode::Send | WcOpcode::RdmaWrite | WcOpcode::RdmaRead => {
                self.outstanding_sends = self.outstanding_sends.saturating_sub(1);
            }
            WcOpcode::Recv | WcOpcode::RecvRdmaWithImm => {
                self.posted_recvs = self.posted_recvs.saturating_sub(1);
            }
            WcOpcode::Invalid => {}
        }
        if !wc.status.is_success() {
            return Err(Error::CompletionFailed {
                status: wc.status,
                wr_id: wc.wr_id,
            });
        }
        Ok(wc)
    }

    fn poll_one(&self, cq: CompletionQueue) -> Result<Option<WorkCompletion>> {
        let mut wc = [WorkCompletion::default()];
        let n = self.fabric.poll_cq(cq, &mut wc).op("ibv_poll_cq")?;
        let [wc] = wc;
        Ok((n == 1).then_some(wc))
    }

    // An armed CQ only notifies for completions that arrive after arming, so the queue is
    // polled again after every re-arm before going to sleep.
    fn wait_notified(
        &self,
        cq: CompletionQueue,
        comp_channel: CompChannel,
    ) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.poll_one(cq)? {
                return Ok(wc);
            }
            self.fabric
                .req_notify_cq(cq, false)
                .op("ibv_req_notify_cq")?;
            if let Some(wc) = self.poll_one(cq)? {
                return Ok(wc);
            }
            let ev_cq = self
                .fabric
                .get_cq_event(comp_channel)
                .op("ibv_get_cq_event")?;
            self.fabric.ack_cq_events(ev_cq, 1).op("ibv_ack_cq_events")?;
        }
    }

    fn wait_spinning(&self, cq: CompletionQueue) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.poll_one(cq)? {
                return Ok(wc);
            }
            std::hint::spin_loop();
        }
    }

    /// A receive can't report more bytes than the buffer it was posted with.
    fn received_len(&self, wc: &WorkCompletion) -> Result<usize> {
        let size = wc.byte_len as usize;
        if size > self.recv_buf.len() {
            return Err(Error::SizeOverflow {
                size,
                capacity: self.recv_buf.len(),
            });
        }
        Ok(size)
    }

    pub fn wait_for_send(&mut self) -> Result<()> {
        let wc = self.wait_completion()?;
        if wc.opcode != WcOpcode::Send {
            return Err(Error::UnexpectedCompletion {
                expected: "a send",
                opcode: wc.opcode,
                wr_id: wc.wr_id,
            });
        }
        Ok(())
    }

    /// Waits for a receive and returns the number of bytes received.
    pub fn wait_for_receive(&mut self) -> Result<usize> {
        let wc = self.wait_completion()?;
        if !matches!(wc.opcode, WcOpcode::Recv | WcOpcode::RecvRdmaWithImm) {
            return Err(Error::UnexpectedCompletion {
                expected: "a receive",
                opcode: wc.opcode,
                wr_id: wc.wr_id,
            });
        }
        self.received_len(&wc)
    }

    /// Waits for a receive carrying an immediate value. Any other completion is an error.
    pub fn wait_for_receive_with_payload(&mut self) -> Result<(usize, u32)> {
        let wc = self.wait_completion()?;
        let is_recv = matches!(wc.opcode, WcOpcode::Recv | WcOpcode::RecvRdmaWithImm);
        match wc.imm() {
            Some(payload) if is_recv => Ok((self.received_len(&wc)?, payload)),
            _ => Err(Error::UnexpectedCompletion {
                expected: "a receive with immediate data",
                opcode: wc.opcode,
                wr_id: wc.wr_id,
            }),
        }
    }

    /// Waits for exactly two completions, in any order, that must be one send and one receive.
    /// Returns the number of bytes received.
    pub fn wait_for_one_send_and_one_receive(&mut self) -> Result<usize> {
        let mut sends = 0;
        let mut recvs = 0;
        let mut size = 0;
        for _ in 0..2 {
            let wc = self.wait_completion()?;
            match wc.opcode {
                WcOpcode::Send => sends += 1,
                WcOpcode::Recv | WcOpcode::RecvRdmaWithImm => {
                    recvs += 1;
                    size = self.received_len(&wc)?;
                }
                opcode => {
                    return Err(Error::UnexpectedCompletion {
                        expected: "a send or a receive",
                        opcode,
                        wr_id: wc.wr_id,
                    })
                }
            }
        }
        if sends != 1 || recvs != 1 {
            return Err(Error::CompletionTally { sends, recvs });
        }
        Ok(size)
    }

    #[inline]
    pub fn send_buf(&self) -> &[u8] {
        &self.send_buf
    }

    #[inline]
    pub fn send_buf_mut(&mut self) -> &mut [u8] {
        &mut self.send_buf
    }

    #[inline]
    pub fn recv_buf(&self) -> &[u8] {
        &self.recv_buf
    }

    /// The receive buffer to read from and the send buffer to write into, at once.
    #[inline]
    pub fn buffers_mut(&mut self) -> (&[u8], &mut [u8]) {
        (&self.recv_buf, &mut self.send_buf)
    }

    /// The receive buffer as a region the peer may write into.
    pub fn recv_region(&self) -> Result<RemoteRegion> {
        let ctx = self.ctx.as_ref().ok_or(Error::NoContext("recv_region"))?;
        Ok(RemoteRegion {
            addr: ctx.recv_mr.addr,
            rkey: ctx.recv_mr.rkey,
            len: self.recv_buf.len() as u32,
        })
    }

    /// Receives posted and not completed yet.
    #[inline]
    pub fn posted_receives(&self) -> usize {
        self.posted_recvs
    }

    /// Signaled sends and writes posted and not completed yet.
    #[inline]
    pub fn outstanding_sends(&self) -> usize {
        self.outstanding_sends
    }

    /// Releases every provider resource. Safe to call more than once and on a partially set up
    /// endpoint. Refused while a signaled send is still in flight on a live queue pair.
    pub fn destroy(&mut self) -> Result<()> {
        if self.qp.is_some() && self.outstanding_sends > 0 {
            return Err(Error::InFlight(self.outstanding_sends));
        }
        self.release_everything()
    }

    fn release_everything(&mut self) -> Result<()> {
        self.qp = None;
        self.ctx = None;
        self.id = None;
        self.channel = None;
        self.outstanding_sends = 0;
        self.posted_recvs = 0;
        self.resources.release_all()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.qp.is_some() && self.outstanding_sends > 0 {
            tracing::warn!(
                "dropping an endpoint with {} send(s) in flight",
                self.outstanding_sends
            );
        }
        if let Err(e) = self.release_everything() {
            tracing::warn!("error while dropping the endpoint: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdma::SimFabric;

    fn endpoint(fabric: &Arc<SimFabric>) -> Endpoint {
        let fabric: Arc<dyn Fabric> = fabric.clone();
        Endpoint::create(fabric, EndpointConfig::with_buffer_sizes(64, 32)).unwrap()
    }

    #[test]
    fn posting_requires_queue_pair() {
        let fabric = Arc::new(SimFabric::new());
        let mut ep = endpoint(&fabric);
        unsafe {
            assert!(matches!(ep.post_receive(), Err(Error::NoQueuePair(_))));
            assert!(matches!(ep.post_send(1, true), Err(Error::NoQueuePair(_))));
        }
        assert!(matches!(ep.wait_completion(), Err(Error::NoContext(_))));
    }

    #[test]
    fn shared_context_is_bound_to_one_device() {
        let fabric = Arc::new(SimFabric::with_devices(2));
        let mut ep = endpoint(&fabric);
        let first = fabric.device(0).unwrap();
        ep.setup_shared_context(first).unwrap();
        let objects = fabric.live_objects();

        ep.setup_shared_context(first).unwrap();
        assert_eq!(fabric.live_objects(), objects, "same context is a no-op");
        assert!(matches!(
            ep.setup_shared_context(fabric.device(1).unwrap()),
            Err(Error::ContextConflict)
        ));

        let region = ep.recv_region().unwrap();
        assert_eq!(region.len, 32);
        assert_eq!(region.addr, ep.recv_buf().as_ptr() as u64);
    }

    #[test]
    fn destroy_is_idempotent() {
        let fabric = Arc::new(SimFabric::new());
        let mut ep = endpoint(&fabric);
        ep.setup_shared_context(fabric.device(0).unwrap()).unwrap();
        assert!(fabric.live_objects() > 0);
        ep.destroy().unwrap();
        assert_eq!(fabric.live_objects(), 0);
        ep.destroy().unwrap();
        assert!(matches!(ep.event_channel(), Err(Error::Destroyed)));
        drop(ep);
        assert_eq!(fabric.live_objects(), 0);
    }

    #[test]
    fn oversized_send_is_refused() {
        let fabric = Arc::new(SimFabric::new());
        let mut ep = endpoint(&fabric);
        assert!(matches!(
            unsafe { ep.post_send(65, true) },
            Err(Error::SizeOverflow {
                size: 65,
                capacity: 64
            })
        ));
    }
}
