//! # VXI-11 Client
//!
//! A Rust client library for controlling laboratory instruments over the VXI-11
//! protocol (LAN instruments, LAN/GPIB gateways).
//!
//! ## Overview
//!
//! VXI-11 moves bytes through remote procedure calls that are limited in size and
//! bounded in time. This crate turns them into a reliable byte stream:
//!
//! - **[`Session`]**: opens and closes the links to a device
//! - **Transfers**: [`Session::write`] splits data into chunks the device accepts,
//!   [`Session::read`] collects a response across several calls, both under one timeout
//! - **Control calls**: status byte, remote/local lock-out, device clear and trigger
//! - **Cancellation**: abortable transfers poll a [`Host`] between chunks and abort the
//!   device through the abort channel
//!
//! The remote calls go through the [`Transport`] trait. [`rpc::TcpTransport`] implements it
//! over ONC RPC; see the [`vxi11_protocol`](https://docs.rs/vxi11-protocol/) crate for the
//! wire format.
//!
//! ## Basic Usage
//!
//! ### Opening a Session
//!
//! ```ignore
//! use vxi11_client::Builder;
//!
//! let mut session = Builder::new().connect("dmm", "192.168.1.20")?;
//! ```
//!
//! ### Querying a Device
//!
//! ```ignore
//! let (transfer, response) = session.query(b"*IDN?\n", 256, false)?;
//! if transfer.is_complete() {
//!     println!("{}", String::from_utf8_lossy(&response));
//! }
//! ```
//!
//! ### Interruptible Transfers
//!
//! ```ignore
//! use std::sync::{Arc, atomic::AtomicBool};
//!
//! let interrupt = Arc::new(AtomicBool::new(false));
//! let mut session = Builder::new()
//!     .async_channel(true)
//!     .connect_with_host("scope", "192.168.1.21", interrupt.clone())?;
//! // set `interrupt` from a signal handler to cancel
//! let mut waveform = vec![0u8; 1 << 20];
//! match session.read(&mut waveform, true)? {
//!     Transfer::Complete(n) => println!("{} bytes", n),
//!     Transfer::TimedOut(n) => println!("timed out after {} bytes", n),
//!     Transfer::Cancelled(n) => println!("cancelled after {} bytes", n),
//! }
//! ```
//!
//! ## Error Handling
//!
//! Failures are reported as [`Error`]; they carry the number of bytes transferred before
//! the failure and a description of the device error code. Timeouts of a read and
//! cancellation are regular outcomes, see [`Transfer`].
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Remote calls are logged at `debug` level, transferred
//! data at `trace` level.
//!
//! ## Thread Model
//!
//! All calls block the calling thread; the crate starts no threads. A session must be used
//! by one caller at a time.
pub mod abort;
pub mod control;
pub mod error;
pub mod rpc;
pub mod session;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod fake;

pub use abort::{Host, Unattended};
pub use control::LockState;
pub use error::{Error, Result};
pub use session::{Builder, Config, Session};
pub use transfer::Transfer;
pub use transport::Transport;
