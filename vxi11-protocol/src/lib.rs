//! # VXI-11 Protocol Library
//!
//! This crate provides the wire format of the [VXI-11](https://www.vxibus.org/specifications.html)
//! instrument control protocol, which carries byte-stream command/response traffic
//! to laboratory instruments over ONC RPC.
//!
//! ## Overview
//!
//! VXI-11 is layered on top of ONC RPC (RFC 5531) and XDR (RFC 4506). A client talks
//! to two RPC programs on the instrument:
//!
//! - **Core channel** (`DEVICE_CORE`): link management, reads, writes and control calls
//! - **Abort channel** (`DEVICE_ASYNC`): aborts an operation in flight on the core channel
//!
//! This library implements:
//!
//! - The request and response messages of both channels ([`protocol`])
//! - Their XDR encoding and decoding ([`codec::Xdr`])
//! - RPC call and reply headers and TCP record marking ([`rpc`])
//! - The error codes a device may report, with human readable descriptions ([`error`])
//!
//! ## Basic Usage
//!
//! ### Encoding a Request
//!
//! ```
//! use vxi11_protocol::{DeviceWriteParms, Flags, LinkId, codec::Xdr};
//!
//! let parms = DeviceWriteParms {
//!     lid: LinkId(1),
//!     io_timeout: 1000,
//!     lock_timeout: 0,
//!     flags: Flags::END,
//!     data: b"*IDN?\n".to_vec(),
//! };
//! let mut buffer = Vec::new();
//! parms.write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//! // 5 words of fields and length, 6 bytes of data, 2 bytes of padding
//! assert_eq!(buffer.len(), 28);
//! ```
//!
//! ### Decoding a Response
//!
//! ```
//! use vxi11_protocol::{DeviceWriteResp, codec::Xdr, error::ErrorCode};
//! use std::io::Cursor;
//!
//! let data = b"\x00\x00\x00\x0f\x00\x00\x00\x04";
//! let resp = DeviceWriteResp::from_reader(&mut Cursor::new(data)).expect("Response should parse");
//! assert_eq!(resp.error, ErrorCode::IO_TIMEOUT);
//! assert_eq!(resp.error.to_string(), "I/O timeout");
//! assert_eq!(resp.size, 4);
//! ```
//!
//! ## Error Handling
//!
//! Decoding failures are reported as [`error::ReadError`]. Error codes reported by the
//! device are plain values of type [`error::ErrorCode`]; [`error::describe`] maps them
//! to text.
//!
//! ## Record Marking
//!
//! On TCP every RPC message travels as one record. [`rpc::write_record`] always sends a
//! single fragment; [`rpc::read_record`] reassembles records of any number of fragments up to
//! [`rpc::MAX_RECORD_LEN`] bytes.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
pub mod rpc;
