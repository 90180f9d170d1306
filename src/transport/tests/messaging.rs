use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::thread;
use rand::prelude::*;
use rand::{rngs::StdRng, SeedableRng};

use rdma_transport::rdma::{Fabric, SimFabric};
use rdma_transport::{
    Client, ClientState, EndpointConfig, Messaging, RemoteRegion, Server, ServerState, WaitMode,
};

const SEED: u64 = 999;
const ADDR: &str = "127.0.0.1";
const PORT: u16 = 5000;

fn connect_pair(config: EndpointConfig) -> (Arc<SimFabric>, Client, Server) {
    let sim = Arc::new(SimFabric::new());
    let fabric: Arc<dyn Fabric> = sim.clone();
    let mut server = Server::bind(Arc::clone(&fabric), ADDR, PORT, config.clone()).unwrap();
    let mut client = Client::connect(fabric, ADDR, PORT, config).unwrap();
    thread::scope(|s| {
        let server = s.spawn(|_| server.wait_until_connected().unwrap());
        client.wait_until_connected().unwrap();
        server.join().unwrap();
    })
    .unwrap();
    assert_eq!(client.state(), ClientState::Established);
    assert_eq!(server.state(), ServerState::Established);
    (sim, client, server)
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn sizes_and_contents_are_preserved() {
    const NUM_ITERS: usize = 200;
    const BUF_SIZE: usize = 8192;

    let (_sim, mut client, mut server) =
        connect_pair(EndpointConfig::with_buffer_sizes(BUF_SIZE, BUF_SIZE));
    assert_eq!(client.endpoint().posted_receives(), 1);
    assert_eq!(server.endpoint().posted_receives(), 1);

    thread::scope(|s| {
        let client = s.spawn(|_| {
            // both sides draw the same sizes from the same seed
            let mut rng = StdRng::seed_from_u64(SEED);
            for i in 0..NUM_ITERS {
                let n = rng.gen_range(0..=BUF_SIZE);
                let m = rng.gen_range(0..=BUF_SIZE);
                let request = pattern(i as u64, n);
                client.endpoint_mut().send_buf_mut()[..n].copy_from_slice(&request);

                let response = client.send_message(n).unwrap();
                assert_eq!(response.len(), m);
                assert_eq!(response, &pattern(!(i as u64), m)[..]);
                assert_eq!(client.endpoint().posted_receives(), 1);
                assert_eq!(client.endpoint().outstanding_sends(), 0);
            }
        });
        let server = s.spawn(|_| {
            let mut rng = StdRng::seed_from_u64(SEED);
            for i in 0..NUM_ITERS {
                let n = rng.gen_range(0..=BUF_SIZE);
                let m = rng.gen_range(0..=BUF_SIZE);
                let size = server
                    .receive_message(|request, response| {
                        assert_eq!(request, &pattern(i as u64, n)[..]);
                        response[..m].copy_from_slice(&pattern(!(i as u64), m));
                        m
                    })
                    .unwrap();
                assert_eq!(size, n);
                assert_eq!(server.endpoint().posted_receives(), 1);
            }
        });
        client.join().unwrap();
        server.join().unwrap();
    })
    .unwrap();
}

#[test]
fn empty_request_is_a_zero_byte_message() {
    let (_sim, mut client, mut server) = connect_pair(EndpointConfig::with_buffer_sizes(64, 64));
    client.endpoint_mut().send_buf_mut().fill(0xab);

    thread::scope(|s| {
        let server = s.spawn(|_| {
            server
                .receive_message(|request, response| {
                    assert!(request.is_empty());
                    response[0] = 7;
                    1
                })
                .unwrap()
        });
        assert_eq!(client.send_message(0).unwrap(), &[7]);
        assert_eq!(server.join().unwrap(), 0);
    })
    .unwrap();
}

#[test]
fn bulk_round_trips() {
    const NUM_TRIALS: usize = 1000;
    const BUF_SIZE: usize = 4_000_000;

    let (_sim, mut client, mut server) = connect_pair(EndpointConfig::default());
    assert_eq!(client.endpoint().send_buf().len(), BUF_SIZE);
    let request = pattern(SEED, BUF_SIZE);
    client
        .endpoint_mut()
        .send_buf_mut()
        .copy_from_slice(&request);

    thread::scope(|s| {
        let server = s.spawn(|_| {
            for i in 0..NUM_TRIALS {
                server
                    .receive_message(|req, resp| {
                        assert_eq!(req.len(), BUF_SIZE);
                        if i == 0 {
                            assert_eq!(req, &request[..]);
                        }
                        resp[0] = i as u8;
                        1
                    })
                    .unwrap();
            }
        });
        for i in 0..NUM_TRIALS {
            let response = client.send_message(BUF_SIZE).unwrap();
            assert_eq!(response, &[i as u8]);
        }
        server.join().unwrap();
    })
    .unwrap();
    assert_eq!(client.endpoint().posted_receives(), 1);
    assert_eq!(server.endpoint().posted_receives(), 1);
}

#[test]
fn spin_waiting_round_trips() {
    let mut config = EndpointConfig::with_buffer_sizes(1024, 1024);
    config.wait_mode = WaitMode::Spin;
    let (_sim, mut client, mut server) = connect_pair(config);

    thread::scope(|s| {
        let server = s.spawn(|_| {
            for _ in 0..100 {
                server
                    .receive_message(|req, resp| {
                        resp[..req.len()].copy_from_slice(req);
                        req.len()
                    })
                    .unwrap();
            }
        });
        for i in 0..100 {
            client.endpoint_mut().send_buf_mut()[..i].fill(i as u8);
            let response = client.send_message(i).unwrap();
            assert_eq!(response.len(), i);
            assert!(response.iter().all(|b| *b == i as u8));
        }
        server.join().unwrap();
    })
    .unwrap();
}

#[test]
fn one_way_streaming() {
    const NUM_ITERS: usize = 500;
    let (_sim, mut client, mut server) = connect_pair(EndpointConfig::with_buffer_sizes(256, 256));

    thread::scope(|s| {
        let server = s.spawn(|_| {
            let mut total = 0;
            for i in 0..NUM_ITERS {
                let size = server.receive_oneway().unwrap();
                assert_eq!(size, i % 256);
                total += size;
            }
            total
        });
        for i in 0..NUM_ITERS {
            client.send_oneway(i % 256).unwrap();
        }
        let expected: usize = (0..NUM_ITERS).map(|i| i % 256).sum();
        assert_eq!(server.join().unwrap(), expected);
    })
    .unwrap();
    assert_eq!(server.endpoint().posted_receives(), 1);
}

#[test]
fn write_into_advertised_region() {
    let (_sim, mut client, mut server) = connect_pair(EndpointConfig::with_buffer_sizes(4096, 4096));

    thread::scope(|s| {
        let server = s.spawn(|_| {
            let region = server.endpoint().recv_region().unwrap();
            server
                .receive_message(|_, resp| {
                    resp[..RemoteRegion::ENCODED_LEN].copy_from_slice(&region.to_bytes());
                    RemoteRegion::ENCODED_LEN
                })
                .unwrap();
            let (size, payload) = server.wait_for_write().unwrap();
            assert_eq!(payload, 0xdead_beef);
            assert_eq!(&server.endpoint().recv_buf()[..size], &pattern(SEED, size)[..]);
            size
        });

        let region = RemoteRegion::from_bytes(client.send_message(0).unwrap()).unwrap();
        assert_eq!(region.len, 4096);
        client
            .endpoint_mut()
            .send_buf_mut()
            .copy_from_slice(&pattern(SEED, 4096));
        client.write_with_payload(3000, &region, 0xdead_beef).unwrap();
        assert_eq!(server.join().unwrap(), 3000);
    })
    .unwrap();
    assert_eq!(server.endpoint().posted_receives(), 1);
}

#[test]
fn write_past_the_region_is_refused() {
    let (_sim, mut client, _server) = connect_pair(EndpointConfig::with_buffer_sizes(4096, 4096));
    let region = RemoteRegion {
        addr: 0x1000,
        rkey: 1,
        len: 100,
    };
    assert!(client.write_with_payload(101, &region, 0).is_err());
    assert_eq!(client.endpoint().outstanding_sends(), 0);
}

#[test]
fn callbacks_fire_once_connected() {
    let sim = Arc::new(SimFabric::new());
    let fabric: Arc<dyn Fabric> = sim.clone();
    let config = EndpointConfig::with_buffer_sizes(64, 64);
    let fired = Arc::new(AtomicUsize::new(0));

    let mut server = Server::bind(Arc::clone(&fabric), ADDR, PORT, config.clone()).unwrap();
    let mut client = Client::connect(fabric, ADDR, PORT, config).unwrap();
    let counter = Arc::clone(&fired);
    server.set_connection_established_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = Arc::clone(&fired);
    client.set_connection_established_callback(move || {
        counter.fetch_add(10, Ordering::SeqCst);
    });

    thread::scope(|s| {
        s.spawn(|_| server.wait_until_connected().unwrap());
        client.wait_until_connected().unwrap();
    })
    .unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 11);

    client.wait_until_connected().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 11);
}
