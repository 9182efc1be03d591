//! [`Transport`] over ONC RPC and TCP, as spoken by VXI-11 instruments.
use std::{
    io::{self, Cursor},
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use vxi11_protocol::{
    CreateLinkParms, CreateLinkResp, DEVICE_ASYNC, DEVICE_ASYNC_VERSION, DEVICE_CORE,
    DEVICE_CORE_VERSION, DeviceError, DeviceGenericParms, DeviceReadParms, DeviceReadResp,
    DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, LinkId, Mapping, Procedure,
    codec::Xdr,
    error::ReadError,
    rpc::{
        CallHeader, PMAP_PORT, PMAP_PROGRAM, PMAP_VERSION, PMAPPROC_GETPORT, read_record,
        read_reply_header, write_record,
    },
};

use crate::transport::{RpcResult, Transport};

/// Time granted on top of the protocol timeout of a call before the socket gives up.
const CALL_MARGIN: Duration = Duration::from_secs(2);
/// Timeout of calls that carry no timeout of their own.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection to one RPC program.
pub struct RpcClient {
    tcp: TcpStream,
    program: u32,
    version: u32,
    xid: u32,
}

impl RpcClient {
    pub fn connect(addr: SocketAddr, program: u32, version: u32) -> io::Result<RpcClient> {
        log::debug!("Connecting to program 0x{:x} at {}", program, addr);
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        tcp.set_nodelay(true)?;
        Ok(RpcClient {
            tcp,
            program,
            version,
            xid: std::process::id().rotate_left(16),
        })
    }

    /// Issues one call and waits up to `timeout` for its reply.
    pub fn call<A: Xdr, R: Xdr>(
        &mut self,
        procedure: u32,
        args: &A,
        timeout: Duration,
    ) -> Result<R, ReadError> {
        self.xid = self.xid.wrapping_add(1);
        let header = CallHeader {
            xid: self.xid,
            program: self.program,
            version: self.version,
            procedure,
        };
        let mut payload = Vec::new();
        header.write_to(&mut payload)?;
        args.write_to(&mut payload)?;

        self.tcp.set_read_timeout(Some(timeout))?;
        self.tcp.set_write_timeout(Some(timeout))?;
        write_record(&mut self.tcp, &payload)?;

        loop {
            let record = read_record(&mut self.tcp)?;
            let mut reader = Cursor::new(record);
            match read_reply_header(&mut reader, self.xid) {
                Ok(()) => return R::from_reader(&mut reader),
                // a late reply to an earlier call that timed out
                Err(ReadError::XidMismatch { got, .. }) => {
                    log::warn!("Discarding stale reply with xid {}", got);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

fn call_timeout(millis: u32) -> Duration {
    Duration::from_millis(u64::from(millis)).saturating_add(CALL_MARGIN)
}

/// Asks the portmapper at `portmapper` (usually port 111 of the instrument) for the TCP port
/// of `program`.
pub fn lookup_port(portmapper: SocketAddr, program: u32, version: u32) -> Result<u16, ReadError> {
    let mut portmapper = RpcClient::connect(portmapper, PMAP_PROGRAM, PMAP_VERSION)?;
    let mapping = Mapping {
        program,
        version,
        protocol: Mapping::IPPROTO_TCP,
        port: 0,
    };
    let port: u32 = portmapper.call(PMAPPROC_GETPORT, &mapping, DEFAULT_CALL_TIMEOUT)?;
    match u16::try_from(port) {
        Ok(0) => Err(ReadError::Rejected(format!(
            "program 0x{:x} is not registered with the portmapper",
            program
        ))),
        Ok(port) => Ok(port),
        Err(_) => Err(ReadError::InvalidFormat(format!("Invalid port {}", port))),
    }
}

/// VXI-11 transport over TCP.
///
/// The core channel is connected right away; the abort channel only when the session asks
/// for it, on the port the instrument announced when the core link was created.
pub struct TcpTransport {
    ip: IpAddr,
    core: RpcClient,
    abort: Option<RpcClient>,
}

impl TcpTransport {
    /// Connect to the core channel of the instrument at `host`, using the portmapper to find it.
    pub fn connect(host: &str) -> Result<TcpTransport, ReadError> {
        let ip = resolve(host)?;
        let port = lookup_port(SocketAddr::new(ip, PMAP_PORT), DEVICE_CORE, DEVICE_CORE_VERSION)?;
        log::debug!("Portmapper of {} reports core channel on port {}", host, port);
        Self::connect_to(SocketAddr::new(ip, port))
    }

    /// Connect to the core channel at a known address, bypassing the portmapper.
    pub fn connect_to(addr: SocketAddr) -> Result<TcpTransport, ReadError> {
        Ok(TcpTransport {
            ip: addr.ip(),
            core: RpcClient::connect(addr, DEVICE_CORE, DEVICE_CORE_VERSION)?,
            abort: None,
        })
    }

    fn core_call<A: Xdr, R: Xdr>(
        &mut self,
        procedure: Procedure,
        args: &A,
        timeout: Duration,
    ) -> RpcResult<R> {
        self.core.call(procedure.number(), args, timeout)
    }
}

fn resolve(host: &str) -> io::Result<IpAddr> {
    (host, PMAP_PORT)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("Cannot resolve {}", host)))
}

impl Transport for TcpTransport {
    fn create_link(&mut self, parms: &CreateLinkParms) -> RpcResult<CreateLinkResp> {
        let timeout = if parms.lock_device {
            call_timeout(parms.lock_timeout)
        } else {
            DEFAULT_CALL_TIMEOUT
        };
        self.core_call(Procedure::CreateLink, parms, timeout)
    }

    fn destroy_link(&mut self, lid: LinkId) -> RpcResult<DeviceError> {
        self.core_call(Procedure::DestroyLink, &lid, DEFAULT_CALL_TIMEOUT)
    }

    fn device_write(&mut self, parms: &DeviceWriteParms) -> RpcResult<DeviceWriteResp> {
        self.core_call(Procedure::DeviceWrite, parms, call_timeout(parms.io_timeout))
    }

    fn device_read(&mut self, parms: &DeviceReadParms) -> RpcResult<DeviceReadResp> {
        self.core_call(Procedure::DeviceRead, parms, call_timeout(parms.io_timeout))
    }

    fn device_readstb(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceReadStbResp> {
        self.core_call(Procedure::DeviceReadStb, parms, call_timeout(parms.io_timeout))
    }

    fn device_trigger(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        self.core_call(Procedure::DeviceTrigger, parms, call_timeout(parms.io_timeout))
    }

    fn device_clear(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        self.core_call(Procedure::DeviceClear, parms, call_timeout(parms.io_timeout))
    }

    fn device_remote(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        self.core_call(Procedure::DeviceRemote, parms, call_timeout(parms.io_timeout))
    }

    fn device_local(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        self.core_call(Procedure::DeviceLocal, parms, call_timeout(parms.io_timeout))
    }

    fn open_abort_channel(&mut self, abort_port: u16) -> RpcResult<()> {
        let addr = SocketAddr::new(self.ip, abort_port);
        self.abort = Some(RpcClient::connect(addr, DEVICE_ASYNC, DEVICE_ASYNC_VERSION)?);
        Ok(())
    }

    fn close_abort_channel(&mut self) -> RpcResult<()> {
        self.abort = None;
        Ok(())
    }

    fn device_abort(&mut self, lid: LinkId) -> RpcResult<DeviceError> {
        let abort = self.abort.as_mut().ok_or_else(|| {
            ReadError::IoError(io::Error::new(
                io::ErrorKind::NotConnected,
                "Abort channel is not connected",
            ))
        })?;
        abort.call(Procedure::DeviceAbort.number(), &lid, DEFAULT_CALL_TIMEOUT)
    }
}

#[test]
fn call_timeout_adds_margin_without_overflow() {
    assert_eq!(call_timeout(1000), Duration::from_secs(3));
    assert_eq!(
        call_timeout(u32::MAX),
        Duration::from_millis(u64::from(u32::MAX)) + CALL_MARGIN
    );
}

#[test]
fn resolve_numeric_address() {
    assert_eq!(resolve("127.0.0.1").unwrap(), IpAddr::from([127, 0, 0, 1]));
}
