//! Single round trip device actions on the core link.
use vxi11_protocol::{DeviceGenericParms, Flags, error::ErrorCode};

use crate::{
    Session,
    abort::Host,
    error::{Error, Result},
    session::timeout_millis,
    transport::{RpcResult, Transport},
};

/// Whether the front panel of the device is locked out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockState {
    /// Remote lock-out, front panel disabled.
    Remote,
    /// Front panel control.
    Local,
}

/// Response types of control calls that carry an error code.
trait Status {
    fn error(&self) -> ErrorCode;
}

impl Status for vxi11_protocol::DeviceError {
    fn error(&self) -> ErrorCode {
        self.error
    }
}

impl Status for vxi11_protocol::DeviceReadStbResp {
    fn error(&self) -> ErrorCode {
        self.error
    }
}

impl<T: Transport, H: Host> Session<T, H> {
    /// Read the status byte of the device.
    pub fn read_status_byte(&mut self) -> Result<u8> {
        self.check_phase();
        let result = self
            .control("device_readstb", T::device_readstb)
            .map(|resp| resp.stb);
        self.record(result)
    }

    /// Put the device into remote lock-out or return it to local control.
    pub fn set_lock_state(&mut self, state: LockState) -> Result<()> {
        self.check_phase();
        let result = self.lock_state(state);
        self.record(result)
    }

    /// Clear the device (IEEE 488.1 selected device clear).
    pub fn clear(&mut self) -> Result<()> {
        self.check_phase();
        let result = self.clear_device();
        self.record(result)
    }

    /// Send a group execute trigger.
    pub fn trigger(&mut self) -> Result<()> {
        self.check_phase();
        let result = self.control("device_trigger", T::device_trigger).map(|_| ());
        self.record(result)
    }

    pub(crate) fn lock_state(&mut self, state: LockState) -> Result<()> {
        log::debug!("Setting lock state of {} to {:?}", self.device_name(), state);
        let result = match state {
            LockState::Remote => self.control("device_remote", T::device_remote),
            LockState::Local => self.control("device_local", T::device_local),
        };
        result.map(|_| ())
    }

    pub(crate) fn clear_device(&mut self) -> Result<()> {
        self.control("device_clear", T::device_clear).map(|_| ())
    }

    /// Issues one control call with the current write timeout. Calls that time out are
    /// re-issued up to `control_retries` times.
    fn control<R: Status>(
        &mut self,
        operation: &'static str,
        call: impl Fn(&mut T, &DeviceGenericParms) -> RpcResult<R>,
    ) -> Result<R> {
        let parms = DeviceGenericParms {
            lid: self.core_link()?.id,
            flags: Flags::NONE,
            lock_timeout: timeout_millis(self.config.acquire_timeout),
            io_timeout: timeout_millis(self.write_timeout),
        };
        let mut attempt = 0;
        loop {
            log::debug!("{} on link {}", operation, parms.lid);
            let resp = call(&mut self.transport, &parms).map_err(Error::rpc(operation, 0))?;
            let error = resp.error();
            if error.is_ok() {
                return Ok(resp);
            }
            if error == ErrorCode::IO_TIMEOUT && attempt < self.config.control_retries {
                attempt += 1;
                log::warn!(
                    "{} on {} timed out, retrying ({}/{})",
                    operation,
                    self.device_name(),
                    attempt,
                    self.config.control_retries
                );
                continue;
            }
            return Err(Error::Device {
                operation,
                code: error,
                transferred: 0,
            });
        }
    }
}
