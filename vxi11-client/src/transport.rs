//! The remote calls a [`Session`](crate::Session) is built on.
use vxi11_protocol::{
    CreateLinkParms, CreateLinkResp, DeviceError, DeviceGenericParms, DeviceReadParms,
    DeviceReadResp, DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, LinkId,
    error::ReadError,
};

/// Result of a remote call. `Err` means the call did not complete at the RPC level;
/// errors reported by the device are part of the `Ok` value.
pub type RpcResult<T> = Result<T, ReadError>;

/// Remote procedures of the VXI-11 core and abort channels.
///
/// [`TcpTransport`](crate::rpc::TcpTransport) implements this trait over ONC RPC. The session
/// layer only relies on the trait, so any other transport (or a test double) can be used instead.
///
/// All timeouts are whole milliseconds, exactly as they are sent to the device.
pub trait Transport {
    fn create_link(&mut self, parms: &CreateLinkParms) -> RpcResult<CreateLinkResp>;

    fn destroy_link(&mut self, lid: LinkId) -> RpcResult<DeviceError>;

    fn device_write(&mut self, parms: &DeviceWriteParms) -> RpcResult<DeviceWriteResp>;

    fn device_read(&mut self, parms: &DeviceReadParms) -> RpcResult<DeviceReadResp>;

    fn device_readstb(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceReadStbResp>;

    fn device_trigger(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError>;

    fn device_clear(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError>;

    fn device_remote(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError>;

    fn device_local(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError>;

    /// Connects the abort channel on the port announced by `create_link`.
    fn open_abort_channel(&mut self, abort_port: u16) -> RpcResult<()>;

    fn close_abort_channel(&mut self) -> RpcResult<()>;

    /// Asks the device to abort the operation in progress on link `lid`.
    /// Issued on the abort channel.
    fn device_abort(&mut self, lid: LinkId) -> RpcResult<DeviceError>;
}
