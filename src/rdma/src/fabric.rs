//! Provider-neutral view of the RDMA connection manager and verbs.
//!
//! Every resource a provider hands out is named by a typed [`Handle`]. A provider never owns
//! the memory behind a registration: the caller keeps the buffer alive until the registration
//! is released.
use std::fmt;
use std::io;
use std::net::SocketAddr;

use bitflags::bitflags;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl Handle {
    pub const INVALID: Handle = Handle(u64::MAX);
}

pub trait AsHandle {
    #[must_use]
    fn as_handle(&self) -> Handle;
}

macro_rules! handle_types {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub Handle);

            impl AsHandle for $name {
                #[inline]
                fn as_handle(&self) -> Handle {
                    self.0
                }
            }
        )*
    };
}

handle_types!(
    /// A channel on which connection manager events are reported.
    EventChannel,
    /// Identity of one connection attempt, or of a listener.
    CmId,
    /// An opened device.
    VerbsContext,
    ProtectionDomain,
    /// A channel on which completion queue notifications are reported.
    CompChannel,
    CompletionQueue,
    QueuePair,
);

bitflags! {
    /// Access rights of a memory registration.
    #[derive(Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b00000001;
        const REMOTE_WRITE = 0b00000010;
        const REMOTE_READ = 0b00000100;
    }

    /// Flags of the WR properties.
    #[derive(Default)]
    pub struct SendFlags: u32 {
        /// Set the fence indicator.
        const FENCE = 0b00000001;
        /// Generate a work completion for this WR.
        const SIGNALED = 0b00000010;
        /// Set the solicited event indicator.
        const SOLICITED = 0b00000100;
        /// Send data in given gather list as inline data.
        const INLINE = 0b00001000;
    }

    /// Flags of the completed WR.
    #[derive(Default)]
    pub struct WcFlags: u32 {
        /// GRH is present (valid only for UD QPs).
        const GRH = 0b00000001;
        /// Immediate data value is valid.
        const WITH_IMM = 0b00000010;
    }
}

/// A registered memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub handle: Handle,
    pub addr: u64,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

impl AsHandle for MemoryRegion {
    #[inline]
    fn as_handle(&self) -> Handle {
        self.handle
    }
}

/// Address and key of a region on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    pub addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error(u32),
}

impl WcStatus {
    pub const LOC_LEN_ERR: WcStatus = WcStatus::Error(1);
    pub const LOC_QP_OP_ERR: WcStatus = WcStatus::Error(2);
    pub const LOC_PROT_ERR: WcStatus = WcStatus::Error(4);
    pub const WR_FLUSH_ERR: WcStatus = WcStatus::Error(5);
    pub const REM_INV_REQ_ERR: WcStatus = WcStatus::Error(9);
    pub const REM_ACCESS_ERR: WcStatus = WcStatus::Error(10);
    pub const RNR_RETRY_EXC_ERR: WcStatus = WcStatus::Error(13);

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WcStatus::Success)
    }

    pub fn code(&self) -> u32 {
        match *self {
            WcStatus::Success => 0,
            WcStatus::Error(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        if code == 0 {
            WcStatus::Success
        } else {
            WcStatus::Error(code)
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.code() {
            0 => "success",
            1 => "local length error",
            2 => "local QP operation error",
            3 => "local EE context operation error",
            4 => "local protection error",
            5 => "Work Request Flushed Error",
            6 => "memory management operation error",
            7 => "bad response error",
            8 => "local access error",
            9 => "remote invalid request error",
            10 => "remote access error",
            11 => "remote operation error",
            12 => "transport retry counter exceeded",
            13 => "RNR retry counter exceeded",
            _ => "unknown",
        };
        write!(f, "{} ({})", msg, self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
    Invalid,
}

/// A structure represent completion of some work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub wc_flags: WcFlags,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        WorkCompletion {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Invalid,
            vendor_err: 0,
            byte_len: 0,
            imm_data: 0,
            wc_flags: WcFlags::empty(),
        }
    }
}

impl WorkCompletion {
    /// The immediate payload, if the completion carries one.
    #[inline]
    pub fn imm(&self) -> Option<u32> {
        self.wc_flags.contains(WcFlags::WITH_IMM).then_some(self.imm_data)
    }
}

/// Connection manager event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    Other(u32),
}

impl fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
            CmEventKind::Other(code) => return write!(f, "RDMA_CM_EVENT_UNKNOWN({})", code),
        };
        f.write_str(name)
    }
}

/// A copy of a connection manager event.
///
/// The provider keeps the original until it is handed back through [`Fabric::ack_cm_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    pub status: i32,
    pub id: CmId,
    /// Set for connect requests: the listener the request arrived on.
    pub listen_id: Option<CmId>,
    pub(crate) token: Handle,
}

impl CmEvent {
    #[inline]
    pub fn token(&self) -> Handle {
        self.token
    }
}

impl fmt::Display for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.status != 0 {
            write!(f, " (status {})", self.status)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCapability {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Creation attributes of a reliable-connection queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CompletionQueue,
    pub recv_cq: CompletionQueue,
    pub cap: QpCapability,
    pub sq_sig_all: bool,
}

/// A single scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWorkRequest {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    SendWithImm(u32),
    RdmaWrite(RemoteKey),
    RdmaWriteWithImm(RemoteKey, u32),
}

impl WrOpcode {
    /// Whether the operation consumes a receive posted on the remote side.
    #[inline]
    pub fn consumes_recv(&self) -> bool {
        !matches!(self, WrOpcode::RdmaWrite(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWorkRequest {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub flags: SendFlags,
    pub sge: Sge,
}

/// The primitives of an RDMA provider: the connection manager plus the subset of verbs a
/// reliable-connection endpoint needs.
///
/// Blocking calls ([`get_cm_event`](Fabric::get_cm_event), [`get_cq_event`](Fabric::get_cq_event))
/// park the calling thread until the provider has something to report.
pub trait Fabric: Send + Sync {
    /// A short name of the provider used in diagnostics.
    fn name(&self) -> &'static str;

    fn create_event_channel(&self) -> io::Result<EventChannel>;
    fn destroy_event_channel(&self, channel: EventChannel) -> io::Result<()>;
    /// Blocks until the next event on `channel` and returns a copy of it.
    fn get_cm_event(&self, channel: EventChannel) -> io::Result<CmEvent>;
    /// Releases an event returned by [`get_cm_event`](Fabric::get_cm_event).
    fn ack_cm_event(&self, event: &CmEvent) -> io::Result<()>;

    fn create_id(&self, channel: EventChannel) -> io::Result<CmId>;
    fn destroy_id(&self, id: CmId) -> io::Result<()>;
    fn bind_addr(&self, id: CmId, addr: &SocketAddr) -> io::Result<()>;
    fn listen(&self, id: CmId, backlog: i32) -> io::Result<()>;
    fn resolve_addr(&self, id: CmId, dst: &SocketAddr, timeout_ms: i32) -> io::Result<()>;
    fn resolve_route(&self, id: CmId, timeout_ms: i32) -> io::Result<()>;
    fn connect(&self, id: CmId) -> io::Result<()>;
    fn accept(&self, id: CmId) -> io::Result<()>;
    fn disconnect(&self, id: CmId) -> io::Result<()>;
    /// The device an identity is bound to, available once its address is resolved.
    fn verbs_context(&self, id: CmId) -> io::Result<VerbsContext>;

    fn alloc_pd(&self, ctx: VerbsContext) -> io::Result<ProtectionDomain>;
    fn dealloc_pd(&self, pd: ProtectionDomain) -> io::Result<()>;
    fn create_comp_channel(&self, ctx: VerbsContext) -> io::Result<CompChannel>;
    fn destroy_comp_channel(&self, channel: CompChannel) -> io::Result<()>;
    fn create_cq(
        &self,
        ctx: VerbsContext,
        cqe: i32,
        channel: Option<CompChannel>,
    ) -> io::Result<CompletionQueue>;
    fn destroy_cq(&self, cq: CompletionQueue) -> io::Result<()>;
    /// Arms `cq` so that the next completion raises one notification on its channel.
    fn req_notify_cq(&self, cq: CompletionQueue, solicited_only: bool) -> io::Result<()>;
    /// Blocks until a notification arrives on `channel`.
    fn get_cq_event(&self, channel: CompChannel) -> io::Result<CompletionQueue>;
    fn ack_cq_events(&self, cq: CompletionQueue, nevents: u32) -> io::Result<()>;
    /// Moves up to `wc.len()` completions into `wc` and returns how many were moved.
    fn poll_cq(&self, cq: CompletionQueue, wc: &mut [WorkCompletion]) -> io::Result<usize>;

    /// # Safety
    ///
    /// `addr..addr + length` must stay valid and must not be freed until the registration is
    /// released with [`dereg_mr`](Fabric::dereg_mr).
    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion>;
    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()>;

    /// Creates the queue pair of `id`. The protection domain must belong to the device `id`
    /// is bound to.
    fn create_qp(&self, id: CmId, pd: ProtectionDomain, attr: &QpInitAttr)
        -> io::Result<QueuePair>;
    fn destroy_qp(&self, id: CmId) -> io::Result<()>;

    /// # Safety
    ///
    /// The memory referenced by the request can only be reused or released after its work
    /// completion has been polled.
    unsafe fn post_recv(&self, qp: QueuePair, wr: &RecvWorkRequest) -> io::Result<()>;

    /// # Safety
    ///
    /// The memory referenced by the request can only be reused or released after its work
    /// completion has been polled.
    unsafe fn post_send(&self, qp: QueuePair, wr: &SendWorkRequest) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_names_flush() {
        assert_eq!(
            WcStatus::WR_FLUSH_ERR.to_string(),
            "Work Request Flushed Error (5)"
        );
        assert!(WcStatus::from_code(0).is_success());
    }

    #[test]
    fn imm_requires_flag() {
        let mut wc = WorkCompletion {
            imm_data: 7,
            ..Default::default()
        };
        assert_eq!(wc.imm(), None);
        wc.wc_flags |= WcFlags::WITH_IMM;
        assert_eq!(wc.imm(), Some(7));
    }

    #[test]
    fn only_plain_write_skips_remote_recv() {
        let key = RemoteKey { addr: 0, rkey: 1 };
        assert!(WrOpcode::Send.consumes_recv());
        assert!(WrOpcode::SendWithImm(1).consumes_recv());
        assert!(WrOpcode::RdmaWriteWithImm(key, 1).consumes_recv());
        assert!(!WrOpcode::RdmaWrite(key).consumes_recv());
    }
}
