//! In-memory transport for unit tests.
use std::{
    cell::{RefCell, RefMut},
    collections::{HashMap, VecDeque},
    io,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use vxi11_protocol::{
    CreateLinkParms, CreateLinkResp, DeviceError, DeviceGenericParms, DeviceReadParms,
    DeviceReadResp, DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, Flags, LinkId, Reason,
    error::{ErrorCode, ReadError},
};

use crate::transport::{RpcResult, Transport};

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Call {
    CreateLink {
        device: String,
        lock: bool,
        lock_timeout: u32,
    },
    DestroyLink(LinkId),
    Write {
        len: usize,
        end: bool,
    },
    Read {
        request_size: u32,
    },
    ReadStb,
    Trigger,
    Clear,
    Remote,
    Local,
    OpenAbort(u16),
    CloseAbort,
    Abort(LinkId),
}

#[derive(Default)]
pub(crate) struct Device {
    pub max_recv_size: u32,
    pub calls: Vec<Call>,
    /// Error codes returned by the next calls of a procedure, by name.
    pub errors: HashMap<&'static str, VecDeque<ErrorCode>>,
    /// Responses to `device_read`, in order. Once exhausted, reads return END without data.
    pub reads: VecDeque<DeviceReadResp>,
    pub reads_seen: Vec<DeviceReadParms>,
    pub read_times: Vec<Instant>,
    pub generic_timeouts: Vec<u32>,
    pub written: Vec<u8>,
    pub accept_limit: Option<u32>,
    pub over_report: u32,
    pub stb: u8,
    pub open_abort_fails: bool,
    pub call_delay: Duration,
    /// Raises the flag once this many reads completed.
    pub interrupt_after_reads: Option<(usize, Arc<AtomicBool>)>,
}

impl Device {
    fn next_error(&mut self, procedure: &'static str) -> ErrorCode {
        self.errors
            .get_mut(procedure)
            .and_then(|codes| codes.pop_front())
            .unwrap_or_default()
    }

    fn generic(
        &mut self,
        call: Call,
        procedure: &'static str,
        parms: &DeviceGenericParms,
    ) -> DeviceError {
        self.calls.push(call);
        self.generic_timeouts.push(parms.io_timeout);
        DeviceError {
            error: self.next_error(procedure),
        }
    }
}

/// Cloning yields a handle to the same device, so tests keep one to inspect the calls.
#[derive(Clone)]
pub(crate) struct FakeTransport(Rc<RefCell<Device>>);

impl FakeTransport {
    pub(crate) fn new(max_recv_size: u32) -> FakeTransport {
        FakeTransport(Rc::new(RefCell::new(Device {
            max_recv_size,
            ..Device::default()
        })))
    }

    pub(crate) fn device(&self) -> RefMut<'_, Device> {
        self.0.borrow_mut()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    /// `(length, end)` of every `device_write`.
    pub(crate) fn writes(&self) -> Vec<(usize, bool)> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Write { len, end } => Some((*len, *end)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn read_sizes(&self) -> Vec<u32> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Read { request_size } => Some(*request_size),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn fail(&self, procedure: &'static str, codes: &[ErrorCode]) {
        self.device()
            .errors
            .entry(procedure)
            .or_default()
            .extend(codes.iter().copied());
    }

    pub(crate) fn script_reads(&self, reads: Vec<DeviceReadResp>) {
        self.device().reads.extend(reads);
    }

    fn delay(&self) {
        let delay = self.0.borrow().call_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl Transport for FakeTransport {
    fn create_link(&mut self, parms: &CreateLinkParms) -> RpcResult<CreateLinkResp> {
        let mut device = self.device();
        device.calls.push(Call::CreateLink {
            device: parms.device.clone(),
            lock: parms.lock_device,
            lock_timeout: parms.lock_timeout,
        });
        Ok(CreateLinkResp {
            error: device.next_error("create_link"),
            lid: LinkId(7),
            abort_port: 4000,
            max_recv_size: device.max_recv_size,
        })
    }

    fn destroy_link(&mut self, lid: LinkId) -> RpcResult<DeviceError> {
        let mut device = self.device();
        device.calls.push(Call::DestroyLink(lid));
        Ok(DeviceError {
            error: device.next_error("destroy_link"),
        })
    }

    fn device_write(&mut self, parms: &DeviceWriteParms) -> RpcResult<DeviceWriteResp> {
        {
            let mut device = self.device();
            device.calls.push(Call::Write {
                len: parms.data.len(),
                end: parms.flags.contains(Flags::END),
            });
        }
        self.delay();
        let mut device = self.device();
        let error = device.next_error("device_write");
        if !error.is_ok() {
            return Ok(DeviceWriteResp { error, size: 0 });
        }
        let accepted = match device.accept_limit {
            Some(limit) => parms.data.len().min(limit as usize),
            None => parms.data.len(),
        };
        device.written.extend_from_slice(&parms.data[..accepted]);
        Ok(DeviceWriteResp {
            error,
            size: accepted as u32 + device.over_report,
        })
    }

    fn device_read(&mut self, parms: &DeviceReadParms) -> RpcResult<DeviceReadResp> {
        {
            let mut device = self.device();
            device.calls.push(Call::Read {
                request_size: parms.request_size,
            });
            device.reads_seen.push(parms.clone());
            device.read_times.push(Instant::now());
        }
        self.delay();
        let mut device = self.device();
        let resp = device.reads.pop_front().unwrap_or(DeviceReadResp {
            error: ErrorCode::NO_ERROR,
            reason: Reason::END,
            data: Vec::new(),
        });
        let completed = device.reads_seen.len();
        if let Some((after, flag)) = &device.interrupt_after_reads
            && *after == completed
        {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(resp)
    }

    fn device_readstb(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceReadStbResp> {
        let mut device = self.device();
        let error = device.generic(Call::ReadStb, "device_readstb", parms).error;
        Ok(DeviceReadStbResp {
            error,
            stb: device.stb,
        })
    }

    fn device_trigger(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        Ok(self.device().generic(Call::Trigger, "device_trigger", parms))
    }

    fn device_clear(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        Ok(self.device().generic(Call::Clear, "device_clear", parms))
    }

    fn device_remote(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        Ok(self.device().generic(Call::Remote, "device_remote", parms))
    }

    fn device_local(&mut self, parms: &DeviceGenericParms) -> RpcResult<DeviceError> {
        Ok(self.device().generic(Call::Local, "device_local", parms))
    }

    fn open_abort_channel(&mut self, abort_port: u16) -> RpcResult<()> {
        let mut device = self.device();
        device.calls.push(Call::OpenAbort(abort_port));
        if device.open_abort_fails {
            return Err(ReadError::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "abort channel refused",
            )));
        }
        Ok(())
    }

    fn close_abort_channel(&mut self) -> RpcResult<()> {
        self.device().calls.push(Call::CloseAbort);
        Ok(())
    }

    fn device_abort(&mut self, lid: LinkId) -> RpcResult<DeviceError> {
        let mut device = self.device();
        device.calls.push(Call::Abort(lid));
        Ok(DeviceError {
            error: device.next_error("device_abort"),
        })
    }
}
