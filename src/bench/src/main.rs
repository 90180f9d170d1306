use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use rdma_transport::rdma::{Fabric, SimFabric};
use rdma_transport::{Client, EndpointConfig, Messaging, OrAbort, Server};

pub(crate) mod config;
pub(crate) mod logging;

use config::BenchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Request/response: every request is answered with a 1-byte response.
    Msg,
    /// One-way sends, each waiting for its own completion.
    Send,
}

#[derive(Debug, Clone, Args)]
struct BenchArgs {
    #[arg(long, value_enum, default_value_t = Mode::Msg)]
    mode: Mode,

    /// The address to listen on or to connect to.
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,

    /// The port number to use.
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Request size, and the size of both buffers.
    #[arg(short, long, default_value = "4000000")]
    size: usize,

    /// Number of round trips.
    #[arg(short = 'n', long, default_value = "1000")]
    trials: usize,
}

#[derive(Debug, Clone, Subcommand)]
enum Role {
    /// Accept one connection and serve it until the client disconnects.
    Server(BenchArgs),
    /// Connect to a server and measure the bandwidth.
    Client(BenchArgs),
    /// Run both roles in this process over the simulated fabric.
    Loopback(BenchArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "rdma-bench", about = "Zero-copy message channel bandwidth.")]
struct Opts {
    /// Config path
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    no_ansi: bool,
    #[command(subcommand)]
    role: Role,
}

#[cfg(feature = "verbs")]
fn hardware_fabric() -> Result<Arc<dyn Fabric>> {
    Ok(Arc::new(rdma_transport::rdma::verbs::VerbsFabric::new()))
}

#[cfg(not(feature = "verbs"))]
fn hardware_fabric() -> Result<Arc<dyn Fabric>> {
    anyhow::bail!("built without the `verbs` feature, only `loopback` is available")
}

fn serve(mut server: Server, args: &BenchArgs) {
    server.wait_until_connected().or_abort();
    for _ in 0..args.trials {
        match args.mode {
            Mode::Msg => {
                server.receive_message(|_, _| 1).or_abort();
            }
            Mode::Send => {
                server.receive_oneway().or_abort();
            }
        }
    }
    server.wait_for_disconnect().or_abort();
}

fn run_client(fabric: Arc<dyn Fabric>, args: &BenchArgs, config: EndpointConfig) -> Duration {
    let mut client = Client::connect(fabric, &args.address, args.port, config).or_abort();
    client.wait_until_connected().or_abort();
    client.endpoint_mut().send_buf_mut().fill(b'x');

    let start = Instant::now();
    for _ in 0..args.trials {
        match args.mode {
            Mode::Msg => {
                client.send_message(args.size).or_abort();
            }
            Mode::Send => client.send_oneway(args.size).or_abort(),
        }
    }
    let elapsed = start.elapsed();

    client.disconnect().or_abort();
    client.wait_for_disconnect().or_abort();
    elapsed
}

fn report(args: &BenchArgs, elapsed: Duration) {
    let bits = (args.trials * args.size) as f64 * 8.0;
    let gbps = bits / elapsed.as_secs_f64() / 1e9;
    println!(
        "{} trials of {} bytes ({:?} mode) in {:.3} s: {:.3} Gbit/s",
        args.trials,
        args.size,
        args.mode,
        elapsed.as_secs_f64(),
        gbps
    );
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = match &opts.config {
        Some(path) => BenchConfig::from_path(path)?,
        None => BenchConfig::default(),
    };
    logging::init_log(&config, !opts.no_ansi)?;

    let args = match &opts.role {
        Role::Server(args) | Role::Client(args) | Role::Loopback(args) => args,
    };
    config.endpoint.send_buffer_size = args.size;
    config.endpoint.recv_buffer_size = args.size;
    config.endpoint.validate()?;
    let endpoint = config.endpoint;

    match &opts.role {
        Role::Server(args) => {
            let server =
                Server::bind(hardware_fabric()?, &args.address, args.port, endpoint).or_abort();
            serve(server, args);
        }
        Role::Client(args) => {
            let elapsed = run_client(hardware_fabric()?, args, endpoint);
            report(args, elapsed);
        }
        Role::Loopback(args) => {
            let fabric: Arc<dyn Fabric> = Arc::new(SimFabric::new());
            // bound before the client starts so that its connect finds the listener
            let server =
                Server::bind(Arc::clone(&fabric), &args.address, args.port, endpoint.clone())
                    .or_abort();
            // named after their role, which is what the log lines show
            let elapsed = thread::scope(|s| -> Result<Duration> {
                thread::Builder::new()
                    .name("server".to_owned())
                    .spawn_scoped(s, move || serve(server, args))?;
                let client = thread::Builder::new()
                    .name("client".to_owned())
                    .spawn_scoped(s, move || run_client(fabric, args, endpoint))?;
                client
                    .join()
                    .map_err(|_| anyhow::anyhow!("client thread panicked"))
            })?;
            report(args, elapsed);
        }
    }
    Ok(())
}
