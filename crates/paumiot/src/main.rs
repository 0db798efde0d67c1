use std::{
    net::IpAddr,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use clap::Parser;
use paumiot::{Config, Gateway, GatewayEvent, InternalMessage};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Set by SIGINT/SIGTERM; the event loop checks it every iteration.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Protocol-agnostic IoT gateway", long_about = None)]
struct Args {
    /// Address both the TCP listener and the UDP socket bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Port shared by TCP and UDP
    #[arg(short, long, default_value_t = paumiot_core::constants::DEFAULT_PORT)]
    port: u16,

    /// Maximum simultaneous TCP connections
    #[arg(long, default_value_t = paumiot_core::constants::MAX_CLIENTS)]
    max_connections: usize,

    /// Also recognise TLS records and QUIC long headers
    #[arg(long)]
    detect_encrypted: bool,

    /// Dispatch worker threads; with 0, decoded messages are logged from the event stream
    #[arg(long, default_value_t = 0)]
    dispatch_workers: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            bind_address: self.bind,
            port: self.port,
            max_connections: self.max_connections,
            detect_encrypted: self.detect_encrypted,
            dispatch_workers: self.dispatch_workers,
            ..Config::default()
        }
    }
}

fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn log_message(message: &InternalMessage) {
    info!(
        "[DISPATCH] {} message for {:?}, {} bytes",
        message.protocol,
        message.destination,
        message.payload_len()
    );
}

fn run(args: &Args) -> paumiot::Result<()> {
    let mut gateway = Gateway::bind(args.config())?;
    if args.dispatch_workers > 0 {
        gateway = gateway
            .with_message_handler(Arc::new(|message: InternalMessage| log_message(&message)))?;
    }

    // Without a dispatch pool, decoded messages arrive on this stream
    let events = gateway.get_event_receiver();
    let logger = thread::Builder::new().name("paumiot-events".into()).spawn(move || {
        for event in events.iter() {
            match event {
                GatewayEvent::Message(message) => log_message(&message),
                other => debug!("[SESSION] {:?}", other),
            }
        }
    })?;

    let port = gateway.local_addr()?.port();
    info!("PaumIoT gateway v{} on port {}", env!("CARGO_PKG_VERSION"), port);
    let result = gateway.run(&SHUTDOWN);
    drop(gateway);
    if logger.join().is_err() {
        error!("event logger panicked");
    }
    result?;
    info!("gateway stopped");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    install_signal_handlers();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("gateway failed: {}", err);
            ExitCode::FAILURE
        }
    }
}
