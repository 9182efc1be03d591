/// XDR (RFC 4506) encoding of the VXI-11 messages
use std::io::{self, Read, Write};

use crate::{
    error::{ErrorCode, ReadError},
    protocol::*,
};

/// Largest variable-length opaque or string this crate accepts while decoding.
pub const MAX_OPAQUE_LEN: usize = 64 * 1024 * 1024;

/// A value with an XDR representation.
pub trait Xdr: Sized {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()>;

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError>;

    /// Encodes the value into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)
            .expect("Writing to vector shouldn't fail");
        buf
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

impl Xdr for u32 {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }
}

impl Xdr for i32 {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }
}

impl Xdr for bool {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        u32::from(*self).write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        match u32::from_reader(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ReadError::InvalidFormat(format!(
                "Invalid boolean {}",
                other
            ))),
        }
    }
}

// `unsigned short` and `char` occupy a full XDR unit.
impl Xdr for u16 {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        u32::from(*self).write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        let value = u32::from_reader(reader)?;
        u16::try_from(value)
            .map_err(|_| ReadError::InvalidFormat(format!("Value {} overflows u16", value)))
    }
}

impl Xdr for u8 {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        u32::from(*self).write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        let value = u32::from_reader(reader)?;
        u8::try_from(value)
            .map_err(|_| ReadError::InvalidFormat(format!("Value {} overflows u8", value)))
    }
}

/// Variable-length opaque data (`opaque<>`).
impl Xdr for Vec<u8> {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| io::Error::other("Opaque data exceeds 32 bit length"))?;
        len.write_to(writer)?;
        writer.write_all(self)?;
        writer.write_all(&[0u8; 3][..padding(self.len())])
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        let len = u32::from_reader(reader)? as usize;
        if len > MAX_OPAQUE_LEN {
            return Err(ReadError::TooManyBytes {
                max: MAX_OPAQUE_LEN,
                got: len,
            });
        }
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut pad = [0u8; 3];
        reader.read_exact(&mut pad[..padding(len)])?;
        Ok(data)
    }
}

impl Xdr for String {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| io::Error::other("String exceeds 32 bit length"))?;
        len.write_to(writer)?;
        writer.write_all(self.as_bytes())?;
        writer.write_all(&[0u8; 3][..padding(self.len())])
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(String::from_utf8(Vec::<u8>::from_reader(reader)?)?)
    }
}

impl Xdr for ErrorCode {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.0.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(ErrorCode(u32::from_reader(reader)?))
    }
}

impl Xdr for LinkId {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.0.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(LinkId(u32::from_reader(reader)?))
    }
}

impl Xdr for Flags {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.0.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(Flags(u32::from_reader(reader)?))
    }
}

impl Xdr for Reason {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.0.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(Reason(u32::from_reader(reader)?))
    }
}

impl Xdr for CreateLinkParms {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.client_id.write_to(writer)?;
        self.lock_device.write_to(writer)?;
        self.lock_timeout.write_to(writer)?;
        self.device.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(CreateLinkParms {
            client_id: Xdr::from_reader(reader)?,
            lock_device: Xdr::from_reader(reader)?,
            lock_timeout: Xdr::from_reader(reader)?,
            device: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for CreateLinkResp {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.error.write_to(writer)?;
        self.lid.write_to(writer)?;
        self.abort_port.write_to(writer)?;
        self.max_recv_size.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(CreateLinkResp {
            error: Xdr::from_reader(reader)?,
            lid: Xdr::from_reader(reader)?,
            abort_port: Xdr::from_reader(reader)?,
            max_recv_size: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceWriteParms {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.lid.write_to(writer)?;
        self.io_timeout.write_to(writer)?;
        self.lock_timeout.write_to(writer)?;
        self.flags.write_to(writer)?;
        self.data.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceWriteParms {
            lid: Xdr::from_reader(reader)?,
            io_timeout: Xdr::from_reader(reader)?,
            lock_timeout: Xdr::from_reader(reader)?,
            flags: Xdr::from_reader(reader)?,
            data: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceWriteResp {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.error.write_to(writer)?;
        self.size.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceWriteResp {
            error: Xdr::from_reader(reader)?,
            size: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceReadParms {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.lid.write_to(writer)?;
        self.request_size.write_to(writer)?;
        self.io_timeout.write_to(writer)?;
        self.lock_timeout.write_to(writer)?;
        self.flags.write_to(writer)?;
        self.term_char.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceReadParms {
            lid: Xdr::from_reader(reader)?,
            request_size: Xdr::from_reader(reader)?,
            io_timeout: Xdr::from_reader(reader)?,
            lock_timeout: Xdr::from_reader(reader)?,
            flags: Xdr::from_reader(reader)?,
            term_char: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceReadResp {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.error.write_to(writer)?;
        self.reason.write_to(writer)?;
        self.data.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceReadResp {
            error: Xdr::from_reader(reader)?,
            reason: Xdr::from_reader(reader)?,
            data: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceGenericParms {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.lid.write_to(writer)?;
        self.flags.write_to(writer)?;
        self.lock_timeout.write_to(writer)?;
        self.io_timeout.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceGenericParms {
            lid: Xdr::from_reader(reader)?,
            flags: Xdr::from_reader(reader)?,
            lock_timeout: Xdr::from_reader(reader)?,
            io_timeout: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceReadStbResp {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.error.write_to(writer)?;
        self.stb.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceReadStbResp {
            error: Xdr::from_reader(reader)?,
            stb: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for DeviceError {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.error.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(DeviceError {
            error: Xdr::from_reader(reader)?,
        })
    }
}

impl Xdr for Mapping {
    fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        self.program.write_to(writer)?;
        self.version.write_to(writer)?;
        self.protocol.write_to(writer)?;
        self.port.write_to(writer)
    }

    fn from_reader(reader: &mut impl Read) -> Result<Self, ReadError> {
        Ok(Mapping {
            program: Xdr::from_reader(reader)?,
            version: Xdr::from_reader(reader)?,
            protocol: Xdr::from_reader(reader)?,
            port: Xdr::from_reader(reader)?,
        })
    }
}
