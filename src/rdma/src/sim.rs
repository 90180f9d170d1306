//! An in-process software provider.
//!
//! `SimFabric` implements the connection manager and the reliable-connection verbs entirely in
//! memory, so that two endpoints in the same process (typically on two threads) can connect and
//! move data without an RDMA device. Transfers are reliable and in order: a send waits at the
//! head of its queue until the peer posts a receive, as with an infinite RNR retry count.
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use fnv::FnvHashMap as HashMap;

use crate::fabric::*;

const FIRST_OBJECT_HANDLE: u64 = 0x1000;

fn error(code: i32, what: &str) -> io::Error {
    let err = io::Error::from_raw_os_error(code);
    log::debug!("sim fabric: {}: {}", what, err);
    err
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdPhase {
    Idle,
    Bound,
    Listening,
    AddrResolved,
    RouteResolved,
    Connecting,
    Requested,
    Connected,
    Closed,
}

#[derive(Debug)]
struct IdState {
    channel: EventChannel,
    ctx: Option<VerbsContext>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    phase: IdPhase,
    qp: Option<QueuePair>,
    peer: Option<CmId>,
    listener: Option<CmId>,
    backlog: usize,
    pending: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    events: VecDeque<CmEvent>,
    unacked: Option<Handle>,
}

#[derive(Debug)]
struct CompChannelState {
    ctx: VerbsContext,
    ready: VecDeque<CompletionQueue>,
}

#[derive(Debug)]
struct CqState {
    ctx: VerbsContext,
    depth: usize,
    channel: Option<CompChannel>,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    unacked_events: u32,
}

#[derive(Debug)]
struct MrState {
    handle: Handle,
    pd: ProtectionDomain,
    addr: u64,
    length: usize,
    access: AccessFlags,
}

impl MrState {
    fn covers(&self, addr: u64, length: u64) -> bool {
        addr >= self.addr
            && addr
                .checked_add(length)
                .map_or(false, |end| end <= self.addr + self.length as u64)
    }
}

#[derive(Debug)]
struct QpState {
    id: CmId,
    pd: ProtectionDomain,
    send_cq: CompletionQueue,
    recv_cq: CompletionQueue,
    cap: QpCapability,
    sq_sig_all: bool,
    recvs: VecDeque<RecvWorkRequest>,
    sends: VecDeque<SendWorkRequest>,
    peer: Option<QueuePair>,
    flushed: bool,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    next_key: u32,
    channels: HashMap<EventChannel, ChannelState>,
    ids: HashMap<CmId, IdState>,
    listeners: HashMap<SocketAddr, CmId>,
    pds: HashMap<ProtectionDomain, VerbsContext>,
    comp_channels: HashMap<CompChannel, CompChannelState>,
    cqs: HashMap<CompletionQueue, CqState>,
    mrs: HashMap<u32, MrState>,
    qps: HashMap<QueuePair, QpState>,
}

impl State {
    fn alloc_handle(&mut self) -> Handle {
        if self.next_handle < FIRST_OBJECT_HANDLE {
            self.next_handle = FIRST_OBJECT_HANDLE;
        }
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn alloc_key(&mut self) -> u32 {
        self.next_key = self.next_key.wrapping_add(1).max(1);
        self.next_key
    }

    fn id(&self, id: CmId) -> io::Result<&IdState> {
        self.ids.get(&id).ok_or_else(|| error(libc::EINVAL, "unknown cm_id"))
    }

    fn id_mut(&mut self, id: CmId) -> io::Result<&mut IdState> {
        self.ids
            .get_mut(&id)
            .ok_or_else(|| error(libc::EINVAL, "unknown cm_id"))
    }

    fn qp_mut(&mut self, qp: QueuePair) -> io::Result<&mut QpState> {
        self.qps
            .get_mut(&qp)
            .ok_or_else(|| error(libc::EINVAL, "unknown queue pair"))
    }

    fn push_cm_event(
        &mut self,
        channel: EventChannel,
        kind: CmEventKind,
        status: i32,
        id: CmId,
        listen_id: Option<CmId>,
    ) {
        let token = self.alloc_handle();
        match self.channels.get_mut(&channel) {
            Some(ch) => ch.events.push_back(CmEvent {
                kind,
                status,
                id,
                listen_id,
                token,
            }),
            None => log::warn!("sim fabric: dropping {} for a closed channel", kind),
        }
    }

    fn push_event_for(&mut self, id: CmId, kind: CmEventKind, status: i32) {
        if let Some(channel) = self.ids.get(&id).map(|s| s.channel) {
            self.push_cm_event(channel, kind, status, id, None);
        }
    }

    fn push_completion(&mut self, cq: CompletionQueue, wc: WorkCompletion) {
        let Some(state) = self.cqs.get_mut(&cq) else {
            log::warn!("sim fabric: dropping a completion for a destroyed CQ");
            return;
        };
        if state.entries.len() >= state.depth {
            log::warn!("sim fabric: CQ {:?} overrun (depth {})", cq, state.depth);
        }
        state.entries.push_back(wc);
        if state.armed {
            if let Some(channel) = state.channel {
                state.armed = false;
                if let Some(ch) = self.comp_channels.get_mut(&channel) {
                    ch.ready.push_back(cq);
                }
            }
        }
    }

    fn check_local(
        &self,
        pd: ProtectionDomain,
        sge: &Sge,
        access: AccessFlags,
    ) -> io::Result<()> {
        let mr = self
            .mrs
            .get(&sge.lkey)
            .ok_or_else(|| error(libc::EINVAL, "unknown lkey"))?;
        if mr.pd != pd {
            return Err(error(libc::EINVAL, "lkey belongs to another protection domain"));
        }
        if !mr.access.contains(access) {
            return Err(error(libc::EACCES, "registration lacks local access"));
        }
        if !mr.covers(sge.addr, sge.length as u64) {
            return Err(error(libc::EINVAL, "sge is out of the registered range"));
        }
        Ok(())
    }

    fn check_remote(&self, pd: ProtectionDomain, remote: &RemoteKey, length: u32) -> bool {
        self.mrs.get(&remote.rkey).map_or(false, |mr| {
            mr.pd == pd
                && mr.access.contains(AccessFlags::REMOTE_WRITE)
                && mr.covers(remote.addr, length as u64)
        })
    }

    /// Moves every request at the head of `qp`'s send queue that can make progress.
    fn progress(&mut self, qp: QueuePair) {
        loop {
            let Some(sender) = self.qps.get(&qp) else {
                return;
            };
            let Some(peer) = sender.peer else {
                return;
            };
            let Some(wr) = sender.sends.front().copied() else {
                return;
            };
            let signaled = sender.sq_sig_all || wr.flags.contains(SendFlags::SIGNALED);
            let send_cq = sender.send_cq;
            let Some(receiver) = self.qps.get(&peer) else {
                return;
            };
            let (peer_pd, peer_recv_cq) = (receiver.pd, receiver.recv_cq);

            let remote = match wr.opcode {
                WrOpcode::RdmaWrite(key) | WrOpcode::RdmaWriteWithImm(key, _) => Some(key),
                _ => None,
            };
            if let Some(key) = remote {
                if !self.check_remote(peer_pd, &key, wr.sge.length) {
                    if let Some(s) = self.qps.get_mut(&qp) {
                        s.sends.pop_front();
                    }
                    self.push_completion(
                        send_cq,
                        WorkCompletion {
                            wr_id: wr.wr_id,
                            status: WcStatus::REM_ACCESS_ERR,
                            opcode: WcOpcode::RdmaWrite,
                            ..Default::default()
                        },
                    );
                    continue;
                }
            }

            let recv = if wr.opcode.consumes_recv() {
                match self.qps.get_mut(&peer).and_then(|r| r.recvs.pop_front()) {
                    Some(recv) => Some(recv),
                    None => return,
                }
            } else {
                None
            };
            if let Some(s) = self.qps.get_mut(&qp) {
                s.sends.pop_front();
            }
            self.execute(&wr, signaled, send_cq, recv, peer_recv_cq);
        }
    }

    fn execute(
        &mut self,
        wr: &SendWorkRequest,
        signaled: bool,
        send_cq: CompletionQueue,
        recv: Option<RecvWorkRequest>,
        recv_cq: CompletionQueue,
    ) {
        let len = wr.sge.length;
        let (dst, send_opcode, recv_opcode, imm) = match wr.opcode {
            WrOpcode::Send => (None, WcOpcode::Send, WcOpcode::Recv, None),
            WrOpcode::SendWithImm(imm) => (None, WcOpcode::Send, WcOpcode::Recv, Some(imm)),
            WrOpcode::RdmaWrite(key) => (Some(key.addr), WcOpcode::RdmaWrite, WcOpcode::Invalid, None),
            WrOpcode::RdmaWriteWithImm(key, imm) => (
                Some(key.addr),
                WcOpcode::RdmaWrite,
                WcOpcode::RecvRdmaWithImm,
                Some(imm),
            ),
        };

        let dst = match (dst, recv) {
            (Some(addr), _) => addr,
            (None, Some(recv)) if len > recv.sge.length => {
                self.push_completion(
                    recv_cq,
                    WorkCompletion {
                        wr_id: recv.wr_id,
                        status: WcStatus::LOC_LEN_ERR,
                        opcode: WcOpcode::Recv,
                        ..Default::default()
                    },
                );
                self.push_completion(
                    send_cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status: WcStatus::REM_INV_REQ_ERR,
                        opcode: WcOpcode::Send,
                        ..Default::default()
                    },
                );
                return;
            }
            (None, Some(recv)) => recv.sge.addr,
            (None, None) => return,
        };

        if len > 0 {
            // SAFETY: both ranges were checked against live registrations, and the owners keep
            // them valid until the completions below are polled.
            unsafe { ptr::copy(wr.sge.addr as *const u8, dst as *mut u8, len as usize) };
        }

        if signaled {
            self.push_completion(
                send_cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    opcode: send_opcode,
                    byte_len: len,
                    ..Default::default()
                },
            );
        }
        if let Some(recv) = recv {
            let mut wc = WorkCompletion {
                wr_id: recv.wr_id,
                opcode: recv_opcode,
                byte_len: len,
                ..Default::default()
            };
            if let Some(imm) = imm {
                wc.imm_data = imm;
                wc.wc_flags |= WcFlags::WITH_IMM;
            }
            self.push_completion(recv_cq, wc);
        }
    }

    /// Moves `qp` to the error state and completes everything outstanding with a flush error.
    fn flush(&mut self, qp: QueuePair) {
        let Some(state) = self.qps.get_mut(&qp) else {
            return;
        };
        state.flushed = true;
        state.peer = None;
        let recvs: Vec<_> = state.recvs.drain(..).collect();
        let sends: Vec<_> = state.sends.drain(..).collect();
        let (send_cq, recv_cq) = (state.send_cq, state.recv_cq);
        for recv in recvs {
            self.push_completion(recv_cq, flushed(recv.wr_id, WcOpcode::Recv));
        }
        for send in sends {
            self.push_completion(send_cq, flushed(send.wr_id, WcOpcode::Send));
        }
    }

    /// Breaks the connection `id` takes part in and reports it to the peer.
    fn tear_down_peer(&mut self, id: CmId) {
        let Some((phase, peer, qp)) = self.ids.get(&id).map(|s| (s.phase, s.peer, s.qp)) else {
            return;
        };
        match phase {
            IdPhase::Connected => {
                if let Some(qp) = qp {
                    self.flush(qp);
                }
                if let Some(peer) = peer {
                    if let Some(peer_qp) = self.ids.get(&peer).and_then(|s| s.qp) {
                        self.flush(peer_qp);
                    }
                    if let Some(state) = self.ids.get_mut(&peer) {
                        state.phase = IdPhase::Closed;
                        state.peer = None;
                    }
                    self.push_event_for(peer, CmEventKind::Disconnected, 0);
                }
            }
            IdPhase::Requested => {
                if let Some(peer) = peer {
                    if let Some(state) = self.ids.get_mut(&peer) {
                        state.phase = IdPhase::Closed;
                        state.peer = None;
                    }
                    self.push_event_for(peer, CmEventKind::Rejected, libc::ECONNREFUSED);
                }
                self.release_backlog(id);
            }
            IdPhase::Connecting => {
                if let Some(peer) = peer {
                    if let Some(state) = self.ids.get_mut(&peer) {
                        state.peer = None;
                    }
                }
            }
            _ => {}
        }
        if let Some(state) = self.ids.get_mut(&id) {
            state.peer = None;
        }
    }

    fn release_backlog(&mut self, child: CmId) {
        let listener = self.ids.get(&child).and_then(|s| s.listener);
        if let Some(listener) = listener.and_then(|l| self.ids.get_mut(&l)) {
            listener.pending = listener.pending.saturating_sub(1);
        }
    }

    fn find_listener(&self, dst: &SocketAddr) -> Option<CmId> {
        self.listeners.get(dst).copied().or_else(|| {
            let any = match dst.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            self.listeners.get(&SocketAddr::new(any, dst.port())).copied()
        })
    }
}

fn flushed(wr_id: u64, opcode: WcOpcode) -> WorkCompletion {
    WorkCompletion {
        wr_id,
        status: WcStatus::WR_FLUSH_ERR,
        opcode,
        ..Default::default()
    }
}

/// The software provider. Share one instance (behind an `Arc`) between all endpoints that should
/// be able to reach each other.
#[derive(Debug)]
pub struct SimFabric {
    state: Mutex<State>,
    cond: Condvar,
    num_devices: u64,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    /// A fabric with a single simulated device.
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// A fabric with `num_devices` devices. Identities are always bound to the first one; the
    /// others exist so that resources can be opened against a different device.
    pub fn with_devices(num_devices: u64) -> Self {
        SimFabric {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            num_devices: num_devices.max(1),
        }
    }

    /// The context of the `index`-th device (starting from 0).
    pub fn device(&self, index: u64) -> Option<VerbsContext> {
        (index < self.num_devices).then_some(VerbsContext(Handle(index + 1)))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn check_device(&self, ctx: VerbsContext) -> io::Result<()> {
        if ctx.0 .0 >= 1 && ctx.0 .0 <= self.num_devices {
            Ok(())
        } else {
            Err(error(libc::ENODEV, "unknown device"))
        }
    }

    /// Delivers an arbitrary event on `channel`, as if the provider had generated it.
    pub fn inject_cm_event(
        &self,
        channel: EventChannel,
        kind: CmEventKind,
        id: CmId,
    ) -> io::Result<()> {
        let mut state = self.lock();
        if !state.channels.contains_key(&channel) {
            return Err(error(libc::EINVAL, "unknown event channel"));
        }
        state.push_cm_event(channel, kind, 0, id, None);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Number of receives posted on `qp` that have not been consumed yet.
    pub fn posted_recvs(&self, qp: QueuePair) -> Option<usize> {
        self.lock().qps.get(&qp).map(|s| s.recvs.len())
    }

    /// Number of live provider objects (identities, queue pairs, CQs, registrations, ...).
    pub fn live_objects(&self) -> usize {
        let state = self.lock();
        state.channels.len()
            + state.ids.len()
            + state.pds.len()
            + state.comp_channels.len()
            + state.cqs.len()
            + state.mrs.len()
            + state.qps.len()
    }
}

impl Fabric for SimFabric {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn create_event_channel(&self) -> io::Result<EventChannel> {
        let mut state = self.lock();
        let channel = EventChannel(state.alloc_handle());
        state.channels.insert(channel, ChannelState::default());
        Ok(channel)
    }

    fn destroy_event_channel(&self, channel: EventChannel) -> io::Result<()> {
        let mut state = self.lock();
        if state.ids.values().any(|s| s.channel == channel) {
            return Err(error(libc::EBUSY, "event channel still has identities"));
        }
        state
            .channels
            .remove(&channel)
            .ok_or_else(|| error(libc::EINVAL, "unknown event channel"))?;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn get_cm_event(&self, channel: EventChannel) -> io::Result<CmEvent> {
        let mut state = self.lock();
        loop {
            let ch = state
                .channels
                .get_mut(&channel)
                .ok_or_else(|| error(libc::EINVAL, "unknown event channel"))?;
            if ch.unacked.is_some() {
                return Err(error(libc::EBUSY, "previous event is not acknowledged"));
            }
            if let Some(event) = ch.events.pop_front() {
                ch.unacked = Some(event.token);
                return Ok(event);
            }
            state = self.wait(state);
        }
    }

    fn ack_cm_event(&self, event: &CmEvent) -> io::Result<()> {
        let mut state = self.lock();
        let ch = state
            .channels
            .values_mut()
            .find(|ch| ch.unacked == Some(event.token))
            .ok_or_else(|| error(libc::EINVAL, "event is not outstanding"))?;
        ch.unacked = None;
        Ok(())
    }

    fn create_id(&self, channel: EventChannel) -> io::Result<CmId> {
        let mut state = self.lock();
        if !state.channels.contains_key(&channel) {
            return Err(error(libc::EINVAL, "unknown event channel"));
        }
        let id = CmId(state.alloc_handle());
        state.ids.insert(
            id,
            IdState {
                channel,
                ctx: None,
                local: None,
                remote: None,
                phase: IdPhase::Idle,
                qp: None,
                peer: None,
                listener: None,
                backlog: 0,
                pending: 0,
            },
        );
        Ok(id)
    }

    fn destroy_id(&self, id: CmId) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id(id)?;
        if s.qp.is_some() {
            return Err(error(libc::EBUSY, "cm_id still owns a queue pair"));
        }
        if let (IdPhase::Listening, Some(local)) = (s.phase, s.local) {
            state.listeners.remove(&local);
        }
        state.tear_down_peer(id);
        state.ids.remove(&id);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn bind_addr(&self, id: CmId, addr: &SocketAddr) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id_mut(id)?;
        if s.phase != IdPhase::Idle {
            return Err(error(libc::EINVAL, "cm_id is already bound"));
        }
        s.local = Some(*addr);
        s.phase = IdPhase::Bound;
        Ok(())
    }

    fn listen(&self, id: CmId, backlog: i32) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id(id)?;
        let local = match (s.phase, s.local) {
            (IdPhase::Bound, Some(local)) => local,
            _ => return Err(error(libc::EINVAL, "cm_id is not bound")),
        };
        if state.listeners.contains_key(&local) {
            return Err(error(libc::EADDRINUSE, "address is already listened on"));
        }
        state.listeners.insert(local, id);
        let s = state.id_mut(id)?;
        s.phase = IdPhase::Listening;
        s.backlog = backlog.max(1) as usize;
        Ok(())
    }

    fn resolve_addr(&self, id: CmId, dst: &SocketAddr, _timeout_ms: i32) -> io::Result<()> {
        let ctx = self.device(0);
        let mut state = self.lock();
        let s = state.id_mut(id)?;
        if !matches!(s.phase, IdPhase::Idle | IdPhase::Bound) {
            return Err(error(libc::EINVAL, "address already resolved"));
        }
        s.remote = Some(*dst);
        s.ctx = ctx;
        s.phase = IdPhase::AddrResolved;
        state.push_event_for(id, CmEventKind::AddrResolved, 0);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn resolve_route(&self, id: CmId, _timeout_ms: i32) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id_mut(id)?;
        if s.phase != IdPhase::AddrResolved {
            return Err(error(libc::EINVAL, "address is not resolved"));
        }
        s.phase = IdPhase::RouteResolved;
        state.push_event_for(id, CmEventKind::RouteResolved, 0);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn connect(&self, id: CmId) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id(id)?;
        if s.phase != IdPhase::RouteResolved {
            return Err(error(libc::EINVAL, "route is not resolved"));
        }
        if s.qp.is_none() {
            return Err(error(libc::EINVAL, "cm_id has no queue pair"));
        }
        let (remote, ctx) = (s.remote, s.ctx);

        let listener = remote.and_then(|dst| state.find_listener(&dst));
        let accepted = listener.and_then(|l| {
            let ls = state.ids.get(&l)?;
            (ls.pending < ls.backlog).then_some((l, ls.channel, ls.local))
        });
        let Some((listener, channel, local)) = accepted else {
            log::debug!("sim fabric: no listener accepts {:?}", remote);
            state.id_mut(id)?.phase = IdPhase::Closed;
            state.push_event_for(id, CmEventKind::Rejected, libc::ECONNREFUSED);
            drop(state);
            self.cond.notify_all();
            return Ok(());
        };

        let child = CmId(state.alloc_handle());
        state.ids.insert(
            child,
            IdState {
                channel,
                ctx,
                local,
                remote: None,
                phase: IdPhase::Requested,
                qp: None,
                peer: Some(id),
                listener: Some(listener),
                backlog: 0,
                pending: 0,
            },
        );
        state.id_mut(listener)?.pending += 1;
        let s = state.id_mut(id)?;
        s.phase = IdPhase::Connecting;
        s.peer = Some(child);
        state.push_cm_event(channel, CmEventKind::ConnectRequest, 0, child, Some(listener));
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn accept(&self, id: CmId) -> io::Result<()> {
        let mut state = self.lock();
        let s = state.id(id)?;
        if s.phase != IdPhase::Requested {
            return Err(error(libc::EINVAL, "no connect request to accept"));
        }
        let qp = s
            .qp
            .ok_or_else(|| error(libc::EINVAL, "cm_id has no queue pair"))?;
        let peer = s
            .peer
            .ok_or_else(|| error(libc::ECONNRESET, "the connecting side is gone"))?;
        let peer_state = state.id(peer)?;
        if peer_state.phase != IdPhase::Connecting {
            return Err(error(libc::ECONNRESET, "the connecting side is gone"));
        }
        let peer_qp = peer_state
            .qp
            .ok_or_else(|| error(libc::ECONNRESET, "the connecting side has no queue pair"))?;

        state.release_backlog(id);
        state.id_mut(id)?.phase = IdPhase::Connected;
        state.id_mut(peer)?.phase = IdPhase::Connected;
        state.qp_mut(qp)?.peer = Some(peer_qp);
        state.qp_mut(peer_qp)?.peer = Some(qp);
        state.push_event_for(id, CmEventKind::Established, 0);
        state.push_event_for(peer, CmEventKind::Established, 0);
        state.progress(qp);
        state.progress(peer_qp);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn disconnect(&self, id: CmId) -> io::Result<()> {
        let mut state = self.lock();
        if state.id(id)?.phase != IdPhase::Connected {
            return Err(error(libc::EINVAL, "cm_id is not connected"));
        }
        state.tear_down_peer(id);
        state.id_mut(id)?.phase = IdPhase::Closed;
        state.push_event_for(id, CmEventKind::Disconnected, 0);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn verbs_context(&self, id: CmId) -> io::Result<VerbsContext> {
        self.lock()
            .id(id)?
            .ctx
            .ok_or_else(|| error(libc::ENODEV, "cm_id is not bound to a device"))
    }

    fn alloc_pd(&self, ctx: VerbsContext) -> io::Result<ProtectionDomain> {
        self.check_device(ctx)?;
        let mut state = self.lock();
        let pd = ProtectionDomain(state.alloc_handle());
        state.pds.insert(pd, ctx);
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: ProtectionDomain) -> io::Result<()> {
        let mut state = self.lock();
        if state.mrs.values().any(|mr| mr.pd == pd) || state.qps.values().any(|qp| qp.pd == pd)
        {
            return Err(error(libc::EBUSY, "protection domain is in use"));
        }
        state
            .pds
            .remove(&pd)
            .map(|_| ())
            .ok_or_else(|| error(libc::EINVAL, "unknown protection domain"))
    }

    fn create_comp_channel(&self, ctx: VerbsContext) -> io::Result<CompChannel> {
        self.check_device(ctx)?;
        let mut state = self.lock();
        let channel = CompChannel(state.alloc_handle());
        state.comp_channels.insert(
            channel,
            CompChannelState {
                ctx,
                ready: VecDeque::new(),
            },
        );
        Ok(channel)
    }

    fn destroy_comp_channel(&self, channel: CompChannel) -> io::Result<()> {
        let mut state = self.lock();
        if state.cqs.values().any(|cq| cq.channel == Some(channel)) {
            return Err(error(libc::EBUSY, "completion channel is in use"));
        }
        state
            .comp_channels
            .remove(&channel)
            .map(|_| ())
            .ok_or_else(|| error(libc::EINVAL, "unknown completion channel"))
    }

    fn create_cq(
        &self,
        ctx: VerbsContext,
        cqe: i32,
        channel: Option<CompChannel>,
    ) -> io::Result<CompletionQueue> {
        self.check_device(ctx)?;
        if cqe <= 0 {
            return Err(error(libc::EINVAL, "invalid CQ depth"));
        }
        let mut state = self.lock();
        if let Some(channel) = channel {
            match state.comp_channels.get(&channel) {
                Some(ch) if ch.ctx == ctx => {}
                Some(_) => return Err(error(libc::EINVAL, "channel belongs to another device")),
                None => return Err(error(libc::EINVAL, "unknown completion channel")),
            }
        }
        let cq = CompletionQueue(state.alloc_handle());
        state.cqs.insert(
            cq,
            CqState {
                ctx,
                depth: cqe as usize,
                channel,
                entries: VecDeque::new(),
                armed: false,
                unacked_events: 0,
            },
        );
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CompletionQueue) -> io::Result<()> {
        let mut state = self.lock();
        let s = state
            .cqs
            .get(&cq)
            .ok_or_else(|| error(libc::EINVAL, "unknown CQ"))?;
        if s.unacked_events > 0 {
            return Err(error(libc::EBUSY, "CQ has unacknowledged events"));
        }
        if state
            .qps
            .values()
            .any(|qp| qp.send_cq == cq || qp.recv_cq == cq)
        {
            return Err(error(libc::EBUSY, "CQ is in use by a queue pair"));
        }
        state.cqs.remove(&cq);
        for ch in state.comp_channels.values_mut() {
            ch.ready.retain(|c| *c != cq);
        }
        Ok(())
    }

    fn req_notify_cq(&self, cq: CompletionQueue, _solicited_only: bool) -> io::Result<()> {
        let mut state = self.lock();
        let s = state
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| error(libc::EINVAL, "unknown CQ"))?;
        if s.channel.is_none() {
            return Err(error(libc::EINVAL, "CQ has no completion channel"));
        }
        s.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, channel: CompChannel) -> io::Result<CompletionQueue> {
        let mut state = self.lock();
        loop {
            let ch = state
                .comp_channels
                .get_mut(&channel)
                .ok_or_else(|| error(libc::EINVAL, "unknown completion channel"))?;
            if let Some(cq) = ch.ready.pop_front() {
                if let Some(s) = state.cqs.get_mut(&cq) {
                    s.unacked_events += 1;
                }
                return Ok(cq);
            }
            state = self.wait(state);
        }
    }

    fn ack_cq_events(&self, cq: CompletionQueue, nevents: u32) -> io::Result<()> {
        let mut state = self.lock();
        let s = state
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| error(libc::EINVAL, "unknown CQ"))?;
        s.unacked_events = s
            .unacked_events
            .checked_sub(nevents)
            .ok_or_else(|| error(libc::EINVAL, "more events acknowledged than received"))?;
        Ok(())
    }

    fn poll_cq(&self, cq: CompletionQueue, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut state = self.lock();
        let s = state
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| error(libc::EINVAL, "unknown CQ"))?;
        let n = wc.len().min(s.entries.len());
        for (slot, entry) in wc.iter_mut().zip(s.entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }

    unsafe fn reg_mr(
        &self,
        pd: ProtectionDomain,
        addr: *mut u8,
        length: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        if addr.is_null() || length == 0 {
            return Err(error(libc::EINVAL, "empty memory registration"));
        }
        let mut state = self.lock();
        if !state.pds.contains_key(&pd) {
            return Err(error(libc::EINVAL, "unknown protection domain"));
        }
        let handle = state.alloc_handle();
        let key = state.alloc_key();
        state.mrs.insert(
            key,
            MrState {
                handle,
                pd,
                addr: addr as u64,
                length,
                access,
            },
        );
        Ok(MemoryRegion {
            handle,
            addr: addr as u64,
            length,
            lkey: key,
            rkey: key,
        })
    }

    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()> {
        let mut state = self.lock();
        match state.mrs.get(&mr.lkey) {
            Some(s) if s.handle == mr.handle => {
                state.mrs.remove(&mr.lkey);
                Ok(())
            }
            _ => Err(error(libc::EINVAL, "unknown memory region")),
        }
    }

    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        let mut state = self.lock();
        let s = state.id(id)?;
        if s.qp.is_some() {
            return Err(error(libc::EEXIST, "cm_id already has a queue pair"));
        }
        let ctx = s
            .ctx
            .ok_or_else(|| error(libc::EINVAL, "cm_id is not bound to a device"))?;
        match state.pds.get(&pd) {
            Some(pd_ctx) if *pd_ctx == ctx => {}
            Some(_) => return Err(error(libc::EINVAL, "protection domain of another device")),
            None => return Err(error(libc::EINVAL, "unknown protection domain")),
        }
        for cq in [attr.send_cq, attr.recv_cq] {
            match state.cqs.get(&cq) {
                Some(s) if s.ctx == ctx => {}
                _ => return Err(error(libc::EINVAL, "invalid CQ for the queue pair")),
            }
        }
        let cap = attr.cap;
        if cap.max_send_sge > 1 || cap.max_recv_sge > 1 {
            return Err(error(libc::EINVAL, "only one sge per request is supported"));
        }
        if cap.max_send_wr == 0 || cap.max_recv_wr == 0 {
            return Err(error(libc::EINVAL, "empty work queue"));
        }

        let qp = QueuePair(state.alloc_handle());
        state.qps.insert(
            qp,
            QpState {
                id,
                pd,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                cap,
                sq_sig_all: attr.sq_sig_all,
                recvs: VecDeque::new(),
                sends: VecDeque::new(),
                peer: None,
                flushed: false,
            },
        );
        state.id_mut(id)?.qp = Some(qp);
        Ok(qp)
    }

    fn destroy_qp(&self, id: CmId) -> io::Result<()> {
        let mut state = self.lock();
        let qp = state
            .id_mut(id)?
            .qp
            .take()
            .ok_or_else(|| error(libc::EINVAL, "cm_id has no queue pair"))?;
        if let Some(removed) = state.qps.remove(&qp) {
            debug_assert_eq!(removed.id, id);
            if let Some(peer) = removed.peer.and_then(|p| state.qps.get_mut(&p)) {
                peer.peer = None;
            }
        }
        Ok(())
    }

    unsafe fn post_recv(&self, qp: QueuePair, wr: &RecvWorkRequest) -> io::Result<()> {
        let mut state = self.lock();
        let s = state
            .qps
            .get(&qp)
            .ok_or_else(|| error(libc::EINVAL, "unknown queue pair"))?;
        state.check_local(s.pd, &wr.sge, AccessFlags::LOCAL_WRITE)?;
        let (flushed_qp, peer, full, recv_cq) = (
            s.flushed,
            s.peer,
            s.recvs.len() >= s.cap.max_recv_wr as usize,
            s.recv_cq,
        );
        if full {
            return Err(error(libc::ENOMEM, "receive queue is full"));
        }
        if flushed_qp {
            state.push_completion(recv_cq, flushed(wr.wr_id, WcOpcode::Recv));
        } else {
            state.qp_mut(qp)?.recvs.push_back(*wr);
            if let Some(peer) = peer {
                state.progress(peer);
            }
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    unsafe fn post_send(&self, qp: QueuePair, wr: &SendWorkRequest) -> io::Result<()> {
        let mut state = self.lock();
        let s = state
            .qps
            .get(&qp)
            .ok_or_else(|| error(libc::EINVAL, "unknown queue pair"))?;
        if !wr.flags.contains(SendFlags::INLINE) {
            state.check_local(s.pd, &wr.sge, AccessFlags::empty())?;
        }
        let (flushed_qp, connected, full, send_cq) = (
            s.flushed,
            s.peer.is_some(),
            s.sends.len() >= s.cap.max_send_wr as usize,
            s.send_cq,
        );
        if full {
            return Err(error(libc::ENOMEM, "send queue is full"));
        }
        if flushed_qp {
            state.push_completion(send_cq, flushed(wr.wr_id, WcOpcode::Send));
        } else if !connected {
            return Err(error(libc::EINVAL, "queue pair is not connected"));
        } else {
            state.qp_mut(qp)?.sends.push_back(*wr);
            state.progress(qp);
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }
}
