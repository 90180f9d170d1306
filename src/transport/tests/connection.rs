use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::thread;

use rdma_transport::rdma::fabric::*;
use rdma_transport::rdma::SimFabric;
use rdma_transport::{
    Client, ClientState, EndpointConfig, Error, Messaging, Server, ServerState,
};

const ADDR: &str = "127.0.0.1";
const PORT: u16 = 6000;

/// Forwards to a shared simulated fabric and records the connection-level calls one role makes.
/// Can also misreport the size of incoming messages.
struct Recorder {
    inner: Arc<SimFabric>,
    calls: Mutex<Vec<&'static str>>,
    recv_len: AtomicU32,
}

impl Recorder {
    fn new(inner: Arc<SimFabric>) -> Arc<Self> {
        Arc::new(Recorder {
            inner,
            calls: Mutex::new(Vec::new()),
            recv_len: AtomicU32::new(0),
        })
    }

    /// Every receive completion polled from now on claims `len` bytes.
    fn report_receives_as(&self, len: u32) {
        self.recv_len.store(len, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn position(&self, call: &str) -> usize {
        self.calls()
            .iter()
            .position(|c| *c == call)
            .unwrap_or_else(|| panic!("{} was never called", call))
    }
}

impl Fabric for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }
    fn create_event_channel(&self) -> io::Result<EventChannel> {
        self.inner.create_event_channel()
    }
    fn destroy_event_channel(&self, channel: EventChannel) -> io::Result<()> {
        self.inner.destroy_event_channel(channel)
    }
    fn get_cm_event(&self, channel: EventChannel) -> io::Result<CmEvent> {
        let event = self.inner.get_cm_event(channel)?;
        self.record(match event.kind {
            CmEventKind::AddrResolved => "ADDR_RESOLVED",
            CmEventKind::RouteResolved => "ROUTE_RESOLVED",
            CmEventKind::ConnectRequest => "CONNECT_REQUEST",
            CmEventKind::Established => "ESTABLISHED",
            CmEventKind::Disconnected => "DISCONNECTED",
            _ => "OTHER_EVENT",
        });
        Ok(event)
    }
    fn ack_cm_event(&self, event: &CmEvent) -> io::Result<()> {
        self.inner.ack_cm_event(event)
    }
    fn create_id(&self, channel: EventChannel) -> io::Result<CmId> {
        self.inner.create_id(channel)
    }
    fn destroy_id(&self, id: CmId) -> io::Result<()> {
        self.record("destroy_id");
        self.inner.destroy_id(id)
    }
    fn bind_addr(&self, id: CmId, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind_addr(id, addr)
    }
    fn listen(&self, id: CmId, backlog: i32) -> io::Result<()> {
        self.inner.listen(id, backlog)
    }
    fn resolve_addr(&self, id: CmId, dst: &SocketAddr, timeout_ms: i32) -> io::Result<()> {
        self.record("resolve_addr");
        self.inner.resolve_addr(id, dst, timeout_ms)
    }
    fn resolve_route(&self, id: CmId, timeout_ms: i32) -> io::Result<()> {
        self.record("resolve_route");
        self.inner.resolve_route(id, timeout_ms)
    }
    fn connect(&self, id: CmId) -> io::Result<()> {
        self.record("connect");
        self.inner.connect(id)
    }
    fn accept(&self, id: CmId) -> io::Result<()> {
        self.record("accept");
        self.inner.accept(id)
    }
    fn disconnect(&self, id: CmId) -> io::Result<()> {
        self.inner.disconnect(id)
    }
    fn verbs_context(&self, id: CmId) -> io::Result<VerbsContext> {
        self.inner.verbs_context(id)
    }
    fn alloc_pd(&self, ctx: VerbsContext) -> io::Result<ProtectionDomain> {
        self.inner.alloc_pd(ctx)
    }
    fn dealloc_pd(&self, pd: ProtectionDomain) -> io::Result<()> {
        self.inner.dealloc_pd(pd)
    }
    fn create_comp_channel(&self, ctx: VerbsContext) -> io::Result<CompChannel> {
        self.inner.create_comp_channel(ctx)
    }
    fn destroy_comp_channel(&self, channel: CompChannel) -> io::Result<()> {
        self.inner.destroy_comp_channel(channel)
    }
    fn create_cq(
        &self,
        ctx: VerbsContext,
        cqe: i32,
        channel: Option<CompChannel>,
    ) -> io::Result<CompletionQueue> {
        self.inner.create_cq(ctx, cqe, channel)
    }
    fn destroy_cq(&self, cq: CompletionQueue) -> io::Result<()> {
        self.inner.destroy_cq(cq)
    }
    fn req_notify_cq(&self, cq: CompletionQueue, solicited_only: bool) -> io::Result<()> {
        self.inner.req_notify_cq(cq, solicited_only)
    }
    fn get_cq_event(&self, channel: CompChannel) -> io::Result<CompletionQueue> {
        self.inner.get_cq_event(channel)
    }
    fn ack_cq_events(&self, cq: CompletionQueue, nevents: u32) -> io::Result<()> {
        self.inner.ack_cq_events(cq, nevents)
    }
    fn poll_cq(&self, cq: CompletionQueue, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let n = self.inner.poll_cq(cq, wc)?;
        let len = self.recv_len.load(Ordering::SeqCst);
        if len > 0 {
            for wc in wc[..n]
                .iter_mut()
                .filter(|wc| matches!(wc.opcode, WcOpcode::Recv | WcOpcode::RecvRdmaWithImm))
            {
                wc.byte_len = len;
            }
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
        self.inner.reg_mr(pd, addr, length, access)
    }
    fn dereg_mr(&self, mr: &MemoryRegion) -> io::Result<()> {
        self.inner.dereg_mr(mr)
    }
    fn create_qp(
        &self,
        id: CmId,
        pd: ProtectionDomain,
        attr: &QpInitAttr,
    ) -> io::Result<QueuePair> {
        self.record("create_qp");
        self.inner.create_qp(id, pd, attr)
    }
    fn destroy_qp(&self, id: CmId) -> io::Result<()> {
        self.record("destroy_qp");
        self.inner.destroy_qp(id)
    }
    unsafe fn post_recv(&self, qp: QueuePair, wr: &RecvWorkRequest) -> io::Result<()> {
        self.record("post_recv");
        self.inner.post_recv(qp, wr)
    }
    unsafe fn post_send(&self, qp: QueuePair, wr: &SendWorkRequest) -> io::Result<()> {
        self.record("post_send");
        self.inner.post_send(qp, wr)
    }
}

fn config() -> EndpointConfig {
    EndpointConfig::with_buffer_sizes(128, 128)
}

fn connect_pair(sim: &Arc<SimFabric>) -> (Client, Server) {
    let fabric: Arc<dyn Fabric> = sim.clone();
    let mut server = Server::bind(Arc::clone(&fabric), ADDR, PORT, config()).unwrap();
    let mut client = Client::connect(fabric, ADDR, PORT, config()).unwrap();
    thread::scope(|s| {
        s.spawn(|_| server.wait_until_connected().unwrap());
        client.wait_until_connected().unwrap();
    })
    .unwrap();
    (client, server)
}

#[test]
fn establishment_follows_the_state_machines() {
    let sim = Arc::new(SimFabric::new());
    let server_fabric = Recorder::new(Arc::clone(&sim));
    let client_fabric = Recorder::new(Arc::clone(&sim));

    let mut server = Server::bind(server_fabric.clone(), ADDR, PORT, config()).unwrap();
    let mut client = Client::connect(client_fabric.clone(), ADDR, PORT, config()).unwrap();
    assert_eq!(client.state(), ClientState::AddrResolving);
    thread::scope(|s| {
        s.spawn(|_| server.wait_until_connected().unwrap());
        client.wait_until_connected().unwrap();
    })
    .unwrap();

    assert_eq!(
        client_fabric.calls(),
        [
            "resolve_addr",
            "ADDR_RESOLVED",
            "create_qp",
            "post_recv",
            "resolve_route",
            "ROUTE_RESOLVED",
            "connect",
            "ESTABLISHED",
        ]
    );
    // the queue pair exists and holds a receive before the request is accepted
    assert!(server_fabric.position("CONNECT_REQUEST") < server_fabric.position("create_qp"));
    assert!(server_fabric.position("create_qp") < server_fabric.position("post_recv"));
    assert!(server_fabric.position("post_recv") < server_fabric.position("accept"));
    assert!(server_fabric.position("accept") < server_fabric.position("ESTABLISHED"));

    let qp = server.endpoint().queue_pair().unwrap();
    assert_eq!(sim.posted_recvs(qp), Some(1));
    // the connection runs on the identity of the request, not on the listener
    assert!(server.connection_id().is_some());
    assert_ne!(server.connection_id(), server.endpoint().cm_id());
}

#[test]
fn client_rejects_out_of_order_events() {
    let sim = Arc::new(SimFabric::new());
    let fabric: Arc<dyn Fabric> = sim.clone();
    let _server = Server::bind(Arc::clone(&fabric), ADDR, PORT, config()).unwrap();
    let mut client = Client::connect(fabric, ADDR, PORT, config()).unwrap();
    let channel = client.endpoint().event_channel().unwrap();
    let id = client.endpoint().cm_id().unwrap();

    // an ESTABLISHED queued behind ADDR_RESOLVED arrives while the route is still unresolved
    sim.inject_cm_event(channel, CmEventKind::Established, id)
        .unwrap();
    match client.wait_until_connected() {
        Err(Error::UnexpectedEvent { state, event }) => {
            assert_eq!(state, "ROUTE_RESOLVING");
            assert_eq!(event, CmEventKind::Established);
        }
        other => panic!("expected an unexpected-event error, got {:?}", other),
    }
    assert_ne!(client.state(), ClientState::Established);
}

#[test]
fn server_rejects_unexpected_events() {
    let sim = Arc::new(SimFabric::new());
    let fabric: Arc<dyn Fabric> = sim.clone();
    let mut server = Server::bind(fabric, ADDR, PORT, config()).unwrap();
    let channel = server.endpoint().event_channel().unwrap();
    let id = server.endpoint().cm_id().unwrap();

    sim.inject_cm_event(channel, CmEventKind::RouteResolved, id)
        .unwrap();
    assert!(matches!(
        server.wait_until_connected(),
        Err(Error::UnexpectedEvent {
            state: "LISTENING",
            event: CmEventKind::RouteResolved,
        })
    ));
    assert_eq!(server.state(), ServerState::Listening);
}

#[test]
fn tally_requires_one_send_and_one_receive() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, mut server) = connect_pair(&sim);

    // two sends and no receive
    unsafe { server.endpoint_mut().post_receive() }.unwrap();
    let ep = client.endpoint_mut();
    unsafe {
        ep.post_send(4, true).unwrap();
        ep.post_send(4, true).unwrap();
    }
    assert!(matches!(
        ep.wait_for_one_send_and_one_receive(),
        Err(Error::CompletionTally { sends: 2, recvs: 0 })
    ));
    let server_ep = server.endpoint_mut();
    assert_eq!(server_ep.wait_for_receive().unwrap(), 4);
    assert_eq!(server_ep.wait_for_receive().unwrap(), 4);
    assert_eq!(server_ep.posted_receives(), 0);
}

#[test]
fn tally_accepts_either_order() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, mut server) = connect_pair(&sim);

    // receive completes first
    unsafe { server.endpoint_mut().post_send(3, true) }.unwrap();
    server.endpoint_mut().wait_for_send().unwrap();
    unsafe { client.endpoint_mut().post_receive() }.unwrap();
    unsafe { client.endpoint_mut().post_send(5, true) }.unwrap();
    assert_eq!(
        client.endpoint_mut().wait_for_one_send_and_one_receive().unwrap(),
        3
    );
    assert_eq!(server.endpoint_mut().wait_for_receive().unwrap(), 5);

    // send completes first
    unsafe { server.endpoint_mut().post_receive() }.unwrap();
    unsafe { client.endpoint_mut().post_receive() }.unwrap();
    unsafe { client.endpoint_mut().post_send(7, true) }.unwrap();
    unsafe { server.endpoint_mut().post_send(2, true) }.unwrap();
    assert_eq!(
        client.endpoint_mut().wait_for_one_send_and_one_receive().unwrap(),
        2
    );
    assert_eq!(server.endpoint_mut().wait_for_receive().unwrap(), 7);
    server.endpoint_mut().wait_for_send().unwrap();

    assert_eq!(client.endpoint().posted_receives(), 1);
    assert_eq!(client.endpoint().outstanding_sends(), 0);
}

#[test]
fn unmatched_completion_fails_fast() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, mut server) = connect_pair(&sim);

    unsafe { server.endpoint_mut().post_send(1, true) }.unwrap();
    server.endpoint_mut().wait_for_send().unwrap();
    // a plain receive carries no payload
    assert!(matches!(
        client.endpoint_mut().wait_for_receive_with_payload(),
        Err(Error::UnexpectedCompletion { .. })
    ));
    assert_eq!(client.endpoint().posted_receives(), 0);
}

#[test]
fn destroy_refuses_inflight_sends() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, _server) = connect_pair(&sim);

    unsafe { client.endpoint_mut().post_send(8, true) }.unwrap();
    assert!(matches!(
        client.endpoint_mut().destroy(),
        Err(Error::InFlight(1))
    ));
    client.endpoint_mut().wait_for_send().unwrap();
    client.endpoint_mut().destroy().unwrap();
}

#[test]
fn teardown_after_disconnect_is_idempotent() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, mut server) = connect_pair(&sim);

    client.disconnect().unwrap();
    thread::scope(|s| {
        s.spawn(|_| server.wait_for_disconnect().unwrap());
        client.wait_for_disconnect().unwrap();
    })
    .unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(server.state(), ServerState::Disconnected);
    assert!(client.endpoint().queue_pair().is_none());
    assert!(server.endpoint().queue_pair().is_none());
    assert!(server.connection_id().is_none());

    // the pre-posted receives are gone with their queue pairs
    assert!(matches!(
        unsafe { client.endpoint_mut().post_receive() },
        Err(Error::NoQueuePair(_))
    ));
    client.wait_for_disconnect().unwrap();
    assert!(client.disconnect().is_err());

    client.endpoint_mut().destroy().unwrap();
    client.endpoint_mut().destroy().unwrap();
    server.endpoint_mut().destroy().unwrap();
    assert_eq!(sim.live_objects(), 0);
    drop(client);
    drop(server);
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn dropping_connected_roles_releases_everything() {
    let sim = Arc::new(SimFabric::new());
    let (client, server) = connect_pair(&sim);
    assert!(sim.live_objects() > 0);
    drop(server);
    drop(client);
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn oversized_receive_is_refused() {
    let sim = Arc::new(SimFabric::new());
    let client_fabric = Recorder::new(Arc::clone(&sim));
    let mut server = Server::bind(sim.clone(), ADDR, PORT, config()).unwrap();
    let mut client = Client::connect(client_fabric.clone(), ADDR, PORT, config()).unwrap();
    thread::scope(|s| {
        s.spawn(|_| server.wait_until_connected().unwrap());
        client.wait_until_connected().unwrap();
    })
    .unwrap();

    client_fabric.report_receives_as(1_000_000);
    thread::scope(|s| {
        s.spawn(|_| assert_eq!(server.receive_message(|_, _| 1).unwrap(), 4));
        match client.send_message(4) {
            Err(Error::SizeOverflow { size, capacity }) => {
                assert_eq!(size, 1_000_000);
                assert_eq!(capacity, 128);
            }
            other => panic!("expected a size overflow, got {:?}", other),
        }
    })
    .unwrap();
}

#[test]
fn destroyed_endpoints_refuse_to_disconnect() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, mut server) = connect_pair(&sim);
    let conn_id = server.connection_id().unwrap();

    server.endpoint_mut().destroy().unwrap();
    assert_eq!(server.connection_id(), Some(conn_id));
    assert!(matches!(server.disconnect(), Err(Error::Destroyed)));
    assert!(matches!(server.wait_for_disconnect(), Err(Error::Destroyed)));

    client.endpoint_mut().destroy().unwrap();
    assert!(matches!(client.disconnect(), Err(Error::Destroyed)));
    assert!(matches!(client.send_message(1), Err(Error::NoQueuePair(_))));
    assert_eq!(sim.live_objects(), 0);
}

#[test]
fn second_queue_pair_is_refused() {
    let sim = Arc::new(SimFabric::new());
    let (mut client, _server) = connect_pair(&sim);
    let id = client.endpoint().cm_id().unwrap();
    assert!(matches!(
        client.endpoint_mut().create_qp(id),
        Err(Error::QueuePairExists)
    ));
}
