//! The librdmacm/libibverbs provider. Handles carry the provider's object pointers.
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use socket2::SockAddr;
use static_assertions::const_assert_eq;

use crate::fabric::*;
use crate::ffi;

const_assert_eq!(
    AccessFlags::LOCAL_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0
);
const_assert_eq!(
    AccessFlags::REMOTE_WRITE.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0
);
const_assert_eq!(
    AccessFlags::REMOTE_READ.bits(),
    ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ.0
);
const_assert_eq!(SendFlags::FENCE.bits(), ffi::ibv_send_flags::IBV_SEND_FENCE.0);
const_assert_eq!(SendFlags::SIGNALED.bits(), ffi::ibv_send_flags::IBV_SEND_SIGNALED.0);
const_assert_eq!(SendFlags::SOLICITED.bits(), ffi::ibv_send_flags::IBV_SEND_SOLICITED.0);
const_assert_eq!(SendFlags::INLINE.bits(), ffi::ibv_send_flags::IBV_SEND_INLINE.0);
const_assert_eq!(WcFlags::GRH.bits(), ffi::ibv_wc_flags::IBV_WC_GRH.0);
const_assert_eq!(WcFlags::WITH_IMM.bits(), ffi::ibv_wc_flags::IBV_WC_WITH_IMM.0);

/// Completions moved out of the provider per `poll_cq` call at most.
const POLL_BATCH: usize = 32;

#[inline]
fn as_ptr<T>(handle: Handle) -> *mut T {
    handle.0 as usize as *mut T
}

#[inline]
fn as_handle<T>(ptr: *mut T) -> Handle {
    Handle(ptr as usize as u64)
}

#[inline]
fn check_rc(rc: i32) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// For the verbs that report failures through their return value instead of `errno`.
#[inline]
fn check_errno(rc: i32) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

fn event_kind(event: ffi::rdma_cm_event_type::Type) -> CmEventKind {
    use ffi::rdma_cm_event_type::*;
    match event {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        other => CmEventKind::Other(other as u32),
    }
}

fn work_completion(wc: &ffi::ibv_wc) -> WorkCompletion {
    use ffi::ibv_wc_opcode::*;
    let opcode = match wc.opcode {
        IBV_WC_SEND => WcOpcode::Send,
        IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        IBV_WC_RECV => WcOpcode::Recv,
        IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        _ => WcOpcode::Invalid,
    };
    WorkCompletion {
        wr_id: wc.wr_id,
        status: WcStatus::from_code(wc.status as u32),
        opcode,
        vendor_err: wc.vendor_err,
        byte_len: wc.byte_len,
        imm_data: u32::from_be(unsafe { wc.__bindgen_anon_1.imm_data }),
        wc_flags: WcFlags::from_bits_truncate(wc.wc_flags as u32),
    }
}

fn conn_param() -> ffi::rdma_conn_param {
    ffi::rdma_conn_param {
        responder_resources: 1,
        initiator_depth: 1,
        retry_count: 7,
        // 7 means retry forever on receiver-not-ready
        rnr_retry_count: 7,
        ..Default::default()
    }
}

/// The hardware provider.
#[derive(Debug, Default)]
pub struct VerbsFabric {
    _private: (),
}

impl VerbsFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fabric for VerbsFabric {
    fn name(&self) -> &'static str {
        "verbs"
    }

    fn create_event_channel(&self) -> io::Result<EventChannel> {
        let channel = unsafe { ffi::rdma_create_event_channel() };
        if channel.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventChannel(as_handle(channel)))
        }
    }

    fn destroy_event_channel(&self, channel: EventChannel) -> io::Result<()> {
        unsafe { ffi::rdma_destroy_event_channel(as_ptr(channel.0)) };
        Ok(())
    }

    fn get_cm_event(&self, channel: EventChannel) -> io::Result<CmEvent> {
        let mut event = ptr::null_mut();
        let rc = unsafe { ffi::rdma_get_cm_event(as_ptr(channel.0), &mut event) };
        check_rc(rc)?;
        assert!(!event.is_null());
        let e: &ffi::rdma_cm_event = unsafe { &*event };
        Ok(CmEvent {
            kind: event_kind(e.event),
            status: e.status,
            id: CmId(as_handle(e.id)),
            listen_id: (!e.listen_id.is_null()).then(|| CmId(as_handle(e.listen_id))),
            token: as_handle(event),
        })
    }

    fn ack_cm_event(&self, event: &CmEvent) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_ack_cm_event(as_ptr(event.token)) };
        check_rc(rc)
    }

    fn create_id(&self, channel: EventChannel) -> io::Result<CmId> {
        let mut cm_id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            ffi::rdma_create_id(
                as_ptr(channel.0),
                &mut cm_id,
                ptr::null_mut(),
                ffi::rdma_port_space::RDMA_PS_TCP,
            )
        };
        check_rc(rc)?;
        assert!(!cm_id.is_null());
        Ok(CmId(as_handle(cm_id)))
    }

    fn destroy_id(&self, id: CmId) -> io::Result<()> {
        log::debug!("destroying CmId {:?}", id);
        let rc = unsafe { ffi::rdma_destroy_id(as_ptr(id.0)) };
        check_rc(rc)
    }

    fn bind_addr(&self, id: CmId, addr: &SocketAddr) -> io::Result<()> {
        let addr = SockAddr::from(*addr);
        let rc = unsafe { ffi::rdma_bind_addr(as_ptr(id.0), addr.as_ptr() as *mut _) };
        check_rc(rc)
    }

    fn listen(&self, id: CmId, backlog: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_listen(as_ptr(id.0), backlog) };
        check_rc(rc)
    }

    fn resolve_addr(&self, id: CmId, dst: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        let dst = SockAddr::from(*dst);
        let rc = unsafe {
            ffi::rdma_resolve_addr(
                as_ptr(id.0),
                ptr::null_mut(),
                dst.as_ptr() as *mut _,
                timeout_ms,
            )
        };
        check_rc(rc)
    }

    fn resolve_route(&self, id: CmId, timeout_ms: i32) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_resolve_route(as_ptr(id.0), timeout_ms) };
        check_rc(rc)
    }

    fn connect(&self, id: CmId) -> io::Result<()> {
        let mut param = conn_param();
        let rc = unsafe { ffi::rdma_connect(as_ptr(id.0), &mut param) };
        check_rc(rc)
    }

    fn accept(&self, id: CmId) -> io::Result<()> {
        let mut param = conn_param();
        let rc = unsafe { ffi::rdma_accept(as_ptr(id.0), &mut param) };
        check_rc(rc)
    }

    fn disconnect(&self, id: CmId) -> io::Result<()> {
        let rc = unsafe { ffi::rdma_disconnect(as_ptr(id.0)) };
        check_rc(rc)
    }

    fn verbs_context(&self, id: CmId) -> io::Result<VerbsContext> {
        let cm_id: *mut ffi::rdma_cm_id = as_ptr(id.0);
        assert!(!cm_id.is_null());
        let verbs = unsafe { &*cm_id }.verbs;
        if verbs.is_null() {
            return Err(io::Error::from_raw_os_error(libc::ENODEV));
        }
        Ok(VerbsContext(as_handle(verbs)))
    }

    fn alloc_pd(&self, ctx: VerbsContext) -> io::Result<ProtectionDomain> {
        let pd = unsafe { ffi::ibv_alloc_pd(as_ptr(ctx.0)) };
        if pd.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ProtectionDomain(as_handle(pd)))
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> io::Result<()> {
        check_errno(unsafe { ffi::ibv_dealloc_pd(as_ptr(pd.0)) })
    }

    fn create_comp_channel(&self, ctx: VerbsContext) -> io::Result<CompChannel> {
        let channel = unsafe { ffi::ibv_create_comp_channel(as_ptr(ctx.0)) };
        if channel.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(CompChannel(as_handle(channel)))
    }

    fn destroy_comp_channel(&self, channel: CompChannel) -> io::Result<()> {
        check_errno(unsafe { ffi::ibv_destroy_comp_channel(as_ptr(channel.0)) })
    }

    fn create_cq(
        &self,
        ctx: VerbsContext,
        cqe: i32,
        channel: Option<CompChannel>,
    ) -> io::Result<CompletionQueue> {
        let channel = channel.map_or(ptr::null_mut(), |c| as_ptr(c.0));
        let cq =
            unsafe { ffi::ibv_create_cq(as_ptr(ctx.0), cqe, ptr::null_mut(), channel, 0) };
        if cq.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionQueue(as_handle(cq)))
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> io::Result<()> {
        check_errno(unsafe { ffi::ibv_destroy_cq(as_ptr(cq.0)) })
    }

    fn req_notify_cq(&self, cq: CompletionQueue, solicited_only: bool) -> io::Result<()> {
        check_errno(unsafe { ffi::ibv_req_notify_cq_real(as_ptr(cq.0), solicited_only as i32) })
    }

    fn get_cq_event(&self, channel: CompChannel) -> io::Result<CompletionQueue> {
        let mut cq = ptr::null_mut();
        let mut cq_context = ptr::null_mut();
        let rc = unsafe { ffi::ibv_get_cq_event(as_ptr(channel.0), &mut cq, &mut cq_context) };
        check_rc(rc)?;
        Ok(CompletionQueue(as_handle(cq)))
    }

    fn ack_cq_events(&self, cq: CompletionQueue, nevents: u32) -> io::Result<()> {
        unsafe { ffi::ibv_ack_cq_events(as_ptr(cq.0), nevents) };
        Ok(())
    }

    fn poll_cq(&self, cq: CompletionQueue, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut raw: [ffi::ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        let n = wc.len().min(POLL_BATCH);
        let rc = unsafe { ffi::ibv_poll_cq_real(as_ptr(cq.0), n as i32, raw.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let polled = rc as usize;
        for (slot, raw) in wc.iter_mut().zip(&raw[..polled]) {
            *slot = work_completion(raw);
        }
        Ok(polled)
    }

    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let mr = ffi::ibv_reg_mr_real(as_ptr(pd.0), addr.cast(), length as _, access.bits() as i32);
        if mr.is_null() {
            return Err(io::Error::last_os_error());
        }
        let m = &*mr;
        Ok(MemoryRegion {
            handle: as_handle(mr),
            addr: m.addr as u64,
            length: m.length as usize,
            lkey: m.lkey,
            rkey: m.rkey,
        })
    }

    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()> {
        check_errno(unsafe { ffi::ibv_dereg_mr(as_ptr(mr.handle)) })
    }

    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        let cm_id: *mut ffi::rdma_cm_id = as_ptr(id.0);
        assert!(!cm_id.is_null());
        let mut init_attr = ffi::ibv_qp_init_attr {
            send_cq: as_ptr(attr.send_cq.0),
            recv_cq: as_ptr(attr.recv_cq.0),
            cap: ffi::ibv_qp_cap {
                max_send_wr: attr.cap.max_send_wr,
                max_recv_wr: attr.cap.max_recv_wr,
                max_send_sge: attr.cap.max_send_sge,
                max_recv_sge: attr.cap.max_recv_sge,
                max_inline_data: attr.cap.max_inline_data,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: attr.sq_sig_all as i32,
            ..Default::default()
        };
        let rc = unsafe { ffi::rdma_create_qp(cm_id, as_ptr(pd.0), &mut init_attr) };
        check_rc(rc)?;
        Ok(QueuePair(as_handle(unsafe { &*cm_id }.qp)))
    }

    fn destroy_qp(&self, id: CmId) -> io::Result<()> {
        unsafe { ffi::rdma_destroy_qp(as_ptr(id.0)) };
        Ok(())
    }

    unsafe fn post_recv(&self, qp: QueuePair, wr: &RecvWorkRequest) -> io::Result<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw = ffi::ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad_wr = ptr::null_mut();
        check_errno(ffi::ibv_post_recv_real(as_ptr(qp.0), &mut raw, &mut bad_wr))
    }

    unsafe fn post_send(&self, qp: QueuePair, wr: &SendWorkRequest) -> io::Result<()> {
        use ffi::ibv_wr_opcode::*;
        let (opcode, imm, remote) = match wr.opcode {
            WrOpcode::Send => (IBV_WR_SEND, 0, None),
            WrOpcode::SendWithImm(imm) => (IBV_WR_SEND_WITH_IMM, imm, None),
            WrOpcode::RdmaWrite(key) => (IBV_WR_RDMA_WRITE, 0, Some(key)),
            WrOpcode::RdmaWriteWithImm(key, imm) => (IBV_WR_RDMA_WRITE_WITH_IMM, imm, Some(key)),
        };
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw = ffi::ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
            opcode,
            send_flags: wr.flags.bits(),
            __bindgen_anon_1: ffi::ibv_send_wr__bindgen_ty_1 {
                imm_data: imm.to_be(),
            },
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_2: Default::default(),
        };
        if let Some(key) = remote {
            raw.wr.rdma = ffi::ibv_send_wr__bindgen_ty_2__bindgen_ty_1 {
                remote_addr: key.addr,
                rkey: key.rkey,
            };
        }
        let mut bad_wr = ptr::null_mut();
        check_errno(ffi::ibv_post_send_real(as_ptr(qp.0), &mut raw, &mut bad_wr))
    }
}
