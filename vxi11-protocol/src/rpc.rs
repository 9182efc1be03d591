//! ONC RPC (RFC 5531) message headers and TCP record marking.
use std::io::{self, Read, Write};

use crate::{codec::Xdr, error::ReadError};

pub const RPC_VERSION: u32 = 2;

/// Portmapper program, queried for the port of the core channel.
pub const PMAP_PROGRAM: u32 = 100000;
pub const PMAP_VERSION: u32 = 2;
pub const PMAP_PORT: u16 = 111;
pub const PMAPPROC_GETPORT: u32 = 3;

const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;
const AUTH_NONE: u32 = 0;
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest record this crate reads or writes.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Header of an RPC call, using `AUTH_NONE` credentials.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl CallHeader {
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.xid.write_to(writer)?;
        MSG_CALL.write_to(writer)?;
        RPC_VERSION.write_to(writer)?;
        self.program.write_to(writer)?;
        self.version.write_to(writer)?;
        self.procedure.write_to(writer)?;
        // credentials and verifier
        write_auth_none(writer)?;
        write_auth_none(writer)
    }

    pub fn from_reader(reader: &mut impl Read) -> Result<CallHeader, ReadError> {
        let xid = u32::from_reader(reader)?;
        let msg_type = u32::from_reader(reader)?;
        if msg_type != MSG_CALL {
            return Err(ReadError::InvalidFormat(format!(
                "Expected call, got message type {}",
                msg_type
            )));
        }
        let rpc_version = u32::from_reader(reader)?;
        if rpc_version != RPC_VERSION {
            return Err(ReadError::InvalidFormat(format!(
                "Unsupported RPC version {}",
                rpc_version
            )));
        }
        let program = u32::from_reader(reader)?;
        let version = u32::from_reader(reader)?;
        let procedure = u32::from_reader(reader)?;
        skip_auth(reader)?;
        skip_auth(reader)?;
        Ok(CallHeader {
            xid,
            program,
            version,
            procedure,
        })
    }
}

fn write_auth_none(writer: &mut impl Write) -> io::Result<()> {
    AUTH_NONE.write_to(writer)?;
    Vec::<u8>::new().write_to(writer)
}

fn skip_auth(reader: &mut impl Read) -> Result<(), ReadError> {
    let _flavor = u32::from_reader(reader)?;
    let _body = Vec::<u8>::from_reader(reader)?;
    Ok(())
}

/// Status of an accepted call (`accept_stat`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

impl AcceptStat {
    fn code(&self) -> u32 {
        match self {
            AcceptStat::Success => 0,
            AcceptStat::ProgUnavail => 1,
            AcceptStat::ProgMismatch { .. } => 2,
            AcceptStat::ProcUnavail => 3,
            AcceptStat::GarbageArgs => 4,
            AcceptStat::SystemErr => 5,
        }
    }
}

/// Writes the header of an accepted reply. For [`AcceptStat::Success`], the
/// result must follow.
pub fn write_reply_header(xid: u32, stat: AcceptStat, writer: &mut impl Write) -> io::Result<()> {
    xid.write_to(writer)?;
    MSG_REPLY.write_to(writer)?;
    MSG_ACCEPTED.write_to(writer)?;
    write_auth_none(writer)?;
    stat.code().write_to(writer)?;
    if let AcceptStat::ProgMismatch { low, high } = stat {
        low.write_to(writer)?;
        high.write_to(writer)?;
    }
    Ok(())
}

/// Reads a reply header and checks that the call with `expected_xid` succeeded.
/// On success, the reader is positioned at the start of the result.
pub fn read_reply_header(reader: &mut impl Read, expected_xid: u32) -> Result<(), ReadError> {
    let xid = u32::from_reader(reader)?;
    if xid != expected_xid {
        return Err(ReadError::XidMismatch {
            expected: expected_xid,
            got: xid,
        });
    }
    let msg_type = u32::from_reader(reader)?;
    if msg_type != MSG_REPLY {
        return Err(ReadError::InvalidFormat(format!(
            "Expected reply, got message type {}",
            msg_type
        )));
    }
    match u32::from_reader(reader)? {
        MSG_ACCEPTED => {
            skip_auth(reader)?;
            match u32::from_reader(reader)? {
                0 => Ok(()),
                1 => Err(ReadError::Rejected("program unavailable".to_string())),
                2 => {
                    let low = u32::from_reader(reader)?;
                    let high = u32::from_reader(reader)?;
                    Err(ReadError::Rejected(format!(
                        "program version mismatch (supported {}..={})",
                        low, high
                    )))
                }
                3 => Err(ReadError::Rejected("procedure unavailable".to_string())),
                4 => Err(ReadError::Rejected("garbage arguments".to_string())),
                5 => Err(ReadError::Rejected("system error".to_string())),
                other => Err(ReadError::InvalidFormat(format!(
                    "Invalid accept status {}",
                    other
                ))),
            }
        }
        MSG_DENIED => match u32::from_reader(reader)? {
            0 => {
                let low = u32::from_reader(reader)?;
                let high = u32::from_reader(reader)?;
                Err(ReadError::Rejected(format!(
                    "RPC version mismatch (supported {}..={})",
                    low, high
                )))
            }
            1 => {
                let stat = u32::from_reader(reader)?;
                Err(ReadError::Rejected(format!(
                    "authentication error {}",
                    stat
                )))
            }
            other => Err(ReadError::InvalidFormat(format!(
                "Invalid reject status {}",
                other
            ))),
        },
        other => Err(ReadError::InvalidFormat(format!(
            "Invalid reply status {}",
            other
        ))),
    }
}

/// Sends `payload` as a single-fragment record.
pub fn write_record(writer: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::other("Record exceeds maximum length"));
    }
    let marker = LAST_FRAGMENT | payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&marker.to_be_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()
}

/// Reads one record, joining all of its fragments.
pub fn read_record(reader: &mut impl Read) -> Result<Vec<u8>, ReadError> {
    let mut record = Vec::new();
    loop {
        let marker = u32::from_reader(reader)?;
        let len = (marker & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD_LEN {
            return Err(ReadError::TooManyBytes {
                max: MAX_RECORD_LEN,
                got: record.len() + len,
            });
        }
        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..])?;
        if marker & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}
