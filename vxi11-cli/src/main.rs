//! # VXI-11 Command Line Tool
//!
//! Sends commands to a VXI-11 instrument and prints its responses. Built on
//! [`vxi11_client`](https://docs.rs/vxi11-client/).
//!
//! ```text
//! vxi11 192.168.1.20 query '*IDN?'
//! vxi11 192.168.1.20 --device gpib0,5 write 'VOLT 1.5'
//! vxi11 192.168.1.20 stb
//! ```
mod interrupt;

use std::error::Error;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::Env;
use vxi11_client::{Builder, LockState, Session, Transfer, rpc::TcpTransport};

use crate::interrupt::INTERRUPTED;

#[derive(Subcommand, Eq, PartialEq, Clone)]
enum Command {
    /// Send a command without reading a response
    Write { command: String },
    /// Send a command and print the response
    Query {
        command: String,
        #[arg(short, long, default_value = "65536", help = "Maximum response length in bytes")]
        max_len: usize,
    },
    /// Print the status byte
    Stb,
    /// Clear the device
    Clear,
    /// Send a group execute trigger
    Trigger,
    /// Return the device to front panel control
    Local,
}

#[derive(Parser)]
#[command(about = "Send commands to VXI-11 instruments", long_about = None)]
struct Args {
    /// Host name or IP address of the instrument
    address: String,

    #[arg(short, long, default_value = "inst0", help = "Logical device name on the instrument")]
    device: String,

    #[arg(short, long, help = "Core channel port; asks the portmapper if omitted")]
    port: Option<u16>,

    #[arg(
        short,
        long,
        default_value = "10000",
        help = "Read and write timeout in milliseconds, 0 waits forever"
    )]
    timeout_ms: u64,

    #[arg(long, help = "Lock the device for the duration of the session")]
    lock: bool,

    #[arg(long, help = "Connect the abort channel so Ctrl-C cancels transfers")]
    abortable: bool,

    #[arg(long, help = "Do not append a newline to commands")]
    raw: bool,

    #[clap(subcommand)]
    command: Command,
}

fn connect(args: &Args) -> Result<TcpTransport, Box<dyn Error>> {
    match args.port {
        Some(port) => {
            let addr: SocketAddr = (args.address.as_str(), port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| format!("Cannot resolve {}", args.address))?;
            log::debug!("Connecting to core channel at {}", addr);
            Ok(TcpTransport::connect_to(addr)?)
        }
        None => Ok(TcpTransport::connect(&args.address)?),
    }
}

fn payload(args: &Args, command: &str) -> Vec<u8> {
    let mut data = command.as_bytes().to_vec();
    if !args.raw && !command.ends_with('\n') {
        data.push(b'\n');
    }
    data
}

fn report(transfer: Transfer, what: &str) {
    match transfer {
        Transfer::Complete(_) => {}
        Transfer::TimedOut(n) => eprintln!("{} timed out after {} bytes", what, n),
        Transfer::Cancelled(n) => eprintln!("{} cancelled after {} bytes", what, n),
    }
}

fn run(
    args: &Args,
    session: &mut Session<TcpTransport, &'static AtomicBool>,
) -> Result<(), Box<dyn Error>> {
    match &args.command {
        Command::Write { command } => {
            let transfer = session.write(&payload(args, command), args.abortable)?;
            report(transfer, "Write");
        }
        Command::Query { command, max_len } => {
            let (transfer, response) =
                session.query(&payload(args, command), *max_len, args.abortable)?;
            std::io::stdout().write_all(&response)?;
            report(transfer, "Query");
        }
        Command::Stb => println!("0x{:02x}", session.read_status_byte()?),
        Command::Clear => session.clear()?,
        Command::Trigger => session.trigger()?,
        Command::Local => session.set_lock_state(LockState::Local)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!(
        "Parsed arguments: address={}, device={}, port={:?}",
        args.address,
        args.device,
        args.port
    );

    if args.abortable {
        interrupt::install()?;
    }

    let transport = connect(&args)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut session = Builder::new()
        .remote_service(args.device.clone())
        .lock_device(args.lock)
        .async_channel(args.abortable)
        .read_timeout(timeout)
        .write_timeout(timeout)
        .open(transport, &INTERRUPTED, &args.device, &args.address)?;
    log::info!("Connected to {} on {}", args.device, args.address);

    let result = run(&args, &mut session);
    session.close()?;
    result
}
