use crate::error::ErrorCode;

/// RPC program number of the core channel (`DEVICE_CORE`).
pub const DEVICE_CORE: u32 = 0x0607AF;
/// Version of the core channel program.
pub const DEVICE_CORE_VERSION: u32 = 1;
/// RPC program number of the abort channel (`DEVICE_ASYNC`).
pub const DEVICE_ASYNC: u32 = 0x0607B0;
/// Version of the abort channel program.
pub const DEVICE_ASYNC_VERSION: u32 = 1;

/// The smallest `maxRecvSize` a VXI-11 device may advertise.
pub const MIN_MAX_RECV_SIZE: u32 = 1024;

/// Procedure numbers of the core and abort channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Procedure {
    DeviceAbort = 1,
    CreateLink = 10,
    DeviceWrite = 11,
    DeviceRead = 12,
    DeviceReadStb = 13,
    DeviceTrigger = 14,
    DeviceClear = 15,
    DeviceRemote = 16,
    DeviceLocal = 17,
    DestroyLink = 23,
}

impl Procedure {
    pub fn number(self) -> u32 {
        self as u32
    }

    pub fn from_number(program: u32, number: u32) -> Option<Procedure> {
        let procedure = match (program, number) {
            (DEVICE_ASYNC, 1) => Procedure::DeviceAbort,
            (DEVICE_CORE, 10) => Procedure::CreateLink,
            (DEVICE_CORE, 11) => Procedure::DeviceWrite,
            (DEVICE_CORE, 12) => Procedure::DeviceRead,
            (DEVICE_CORE, 13) => Procedure::DeviceReadStb,
            (DEVICE_CORE, 14) => Procedure::DeviceTrigger,
            (DEVICE_CORE, 15) => Procedure::DeviceClear,
            (DEVICE_CORE, 16) => Procedure::DeviceRemote,
            (DEVICE_CORE, 17) => Procedure::DeviceLocal,
            (DEVICE_CORE, 23) => Procedure::DestroyLink,
            _ => return None,
        };
        Some(procedure)
    }
}

/// `Device_Flags` bit field sent with most requests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Flags(pub u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Wait for the lock if the device is locked by another link.
    pub const WAIT_LOCK: Flags = Flags(0x01);
    /// The data of this write is the last of a message.
    pub const END: Flags = Flags(0x08);
    /// The `term_char` field of a read is valid.
    pub const TERM_CHAR_SET: Flags = Flags(0x80);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Self) -> Self::Output {
        Flags(self.0 | rhs.0)
    }
}

/// Reasons a device terminated a read (`reason` of `Device_ReadResp`).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Reason(pub u32);

impl Reason {
    /// The requested number of bytes was transferred.
    pub const REQUEST_COUNT: Reason = Reason(0x01);
    /// The termination character was seen.
    pub const TERM_CHAR: Reason = Reason(0x02);
    /// The device signalled the end of the message.
    pub const END: Reason = Reason(0x04);

    pub fn contains(self, other: Reason) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Reason {
    type Output = Reason;

    fn bitor(self, rhs: Self) -> Self::Output {
        Reason(self.0 | rhs.0)
    }
}

/// Identifier of a link, as assigned by the device.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct LinkId(pub u32);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arguments of `create_link`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkParms {
    pub client_id: i32,
    pub lock_device: bool,
    pub lock_timeout: u32,
    pub device: String,
}

/// Result of `create_link`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkResp {
    pub error: ErrorCode,
    pub lid: LinkId,
    pub abort_port: u16,
    pub max_recv_size: u32,
}

/// Arguments of `device_write`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceWriteParms {
    pub lid: LinkId,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: Flags,
    pub data: Vec<u8>,
}

/// Result of `device_write`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceWriteResp {
    pub error: ErrorCode,
    pub size: u32,
}

/// Arguments of `device_read`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadParms {
    pub lid: LinkId,
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: Flags,
    pub term_char: u8,
}

/// Result of `device_read`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadResp {
    pub error: ErrorCode,
    pub reason: Reason,
    pub data: Vec<u8>,
}

/// Arguments shared by `device_readstb`, `device_trigger`, `device_clear`,
/// `device_remote` and `device_local`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceGenericParms {
    pub lid: LinkId,
    pub flags: Flags,
    pub lock_timeout: u32,
    pub io_timeout: u32,
}

/// Result of `device_readstb`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceReadStbResp {
    pub error: ErrorCode,
    pub stb: u8,
}

/// Result of all calls that only report an error code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceError {
    pub error: ErrorCode,
}

/// Portmapper `mapping`, used to look up the TCP port of the core channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
    pub port: u32,
}

impl Mapping {
    pub const IPPROTO_TCP: u32 = 6;
}

#[test]
fn procedure_numbers_are_scoped_by_program() {
    assert_eq!(Procedure::from_number(DEVICE_CORE, 11), Some(Procedure::DeviceWrite));
    assert_eq!(Procedure::from_number(DEVICE_ASYNC, 1), Some(Procedure::DeviceAbort));
    assert_eq!(Procedure::from_number(DEVICE_CORE, 1), None);
    assert_eq!(Procedure::from_number(DEVICE_ASYNC, 11), None);
}

#[test]
fn flag_operations() {
    let flags = Flags::WAIT_LOCK | Flags::END;
    assert!(flags.contains(Flags::END));
    assert!(!flags.contains(Flags::TERM_CHAR_SET));
    let reason = Reason::REQUEST_COUNT | Reason::END;
    assert!(reason.contains(Reason::END));
    assert!(!reason.contains(Reason::TERM_CHAR));
}
