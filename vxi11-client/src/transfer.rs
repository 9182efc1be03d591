//! Chunked reads and writes on the core link.
use std::time::{Duration, Instant};

use vxi11_protocol::{DeviceReadParms, DeviceWriteParms, Flags, Reason, error::ErrorCode};

use crate::{
    Session,
    abort::Host,
    error::{Error, Result},
    session::timeout_millis,
    transport::Transport,
};

/// How a read or write ended. Each variant carries the number of bytes transferred.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transfer {
    /// A write sent everything; a read received the requested count or the end of a message.
    Complete(usize),
    /// The device reported a timeout during a read, or the read timeout was used up.
    /// The bytes received so far are valid.
    TimedOut(usize),
    /// The host asked to interrupt and the transfer was aborted.
    Cancelled(usize),
}

impl Transfer {
    pub fn bytes(&self) -> usize {
        match self {
            Transfer::Complete(n) | Transfer::TimedOut(n) | Transfer::Cancelled(n) => *n,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Transfer::Complete(_))
    }
}

/// Time left for a transfer that spans several remote calls.
pub(crate) struct Budget {
    remaining: Duration,
    last: Option<Instant>,
}

impl Budget {
    /// A zero timeout is an unlimited budget.
    pub(crate) fn new(timeout: Duration) -> Budget {
        Budget {
            remaining: Duration::from_millis(u64::from(timeout_millis(timeout))),
            last: None,
        }
    }

    /// Deducts the time elapsed since the previous call and returns the timeout for the
    /// next remote call in milliseconds, or `None` once the budget is used up.
    ///
    /// The first call gets the whole budget. Partial milliseconds round up.
    pub(crate) fn next(&mut self) -> Option<u32> {
        let now = Instant::now();
        if let Some(last) = self.last {
            self.remaining = self.remaining.saturating_sub(now - last);
        }
        self.last = Some(now);
        if self.remaining.is_zero() {
            return None;
        }
        let millis = self.remaining.as_nanos().div_ceil(1_000_000);
        Some(millis.min(u32::MAX as u128) as u32)
    }
}

impl<T: Transport, H: Host> Session<T, H> {
    /// Send `data` to the device, split into chunks of at most the link's transfer size.
    /// The last chunk carries the END indicator.
    ///
    /// If `abortable` is set and the session has an async link, the host is polled before every
    /// chunk; on interruption the device is sent an abort and [`Transfer::Cancelled`] is returned.
    /// The transfer counts as cancelled even if the abort call fails; that failure is logged.
    ///
    /// All chunks share the write timeout. Errors report the bytes written before the failure.
    pub fn write(&mut self, data: &[u8], abortable: bool) -> Result<Transfer> {
        self.check_phase();
        let result = self.write_chunks(data, abortable);
        self.record(result)
    }

    fn write_chunks(&mut self, data: &[u8], abortable: bool) -> Result<Transfer> {
        let (lid, max_transfer) = {
            let link = self.core_link()?;
            (link.id, link.max_transfer)
        };
        if data.is_empty() {
            return Ok(Transfer::Complete(0));
        }
        log::trace!("Write to {}: {:02x?}", self.device_name(), data);

        let mut budget = Budget::new(self.write_timeout);
        let mut written = 0;
        while written < data.len() {
            if self.interrupt_pending(abortable) {
                return Ok(self.abort(written));
            }
            let Some(io_timeout) = budget.next() else {
                return Err(Error::Device {
                    operation: "device_write",
                    code: ErrorCode::IO_TIMEOUT,
                    transferred: written,
                });
            };
            let chunk = &data[written..(written + max_transfer).min(data.len())];
            let last = written + chunk.len() == data.len();
            let parms = DeviceWriteParms {
                lid,
                io_timeout,
                lock_timeout: io_timeout,
                flags: if last { Flags::END } else { Flags::NONE },
                data: chunk.to_vec(),
            };
            log::debug!(
                "device_write: {} bytes, end={}, io_timeout={}ms",
                chunk.len(),
                last,
                io_timeout
            );
            let resp = self
                .transport
                .device_write(&parms)
                .map_err(Error::rpc("device_write", written))?;
            let size = resp.size as usize;
            if size > chunk.len() {
                return Err(Error::Protocol {
                    operation: "device_write",
                    detail: format!(
                        "device accepted {} bytes of a {} byte chunk",
                        size,
                        chunk.len()
                    ),
                    transferred: written,
                });
            }
            if size == 0 && resp.error.is_ok() {
                return Err(Error::Protocol {
                    operation: "device_write",
                    detail: format!("device accepted none of a {} byte chunk", chunk.len()),
                    transferred: written,
                });
            }
            written += size;
            if !resp.error.is_ok() {
                return Err(Error::Device {
                    operation: "device_write",
                    code: resp.error,
                    transferred: written,
                });
            }
        }
        Ok(Transfer::Complete(written))
    }

    /// Read up to `buf.len()` bytes from the device.
    ///
    /// The read ends when the buffer is full or the device signals the end of a message
    /// (or sends the configured termination character). A timeout reported by the device ends
    /// the read with [`Transfer::TimedOut`]; the data received until then is in `buf`.
    ///
    /// Cancellation works as for [`Session::write`].
    pub fn read(&mut self, buf: &mut [u8], abortable: bool) -> Result<Transfer> {
        self.check_phase();
        let result = self.read_chunks(buf, abortable);
        self.record(result)
    }

    fn read_chunks(&mut self, buf: &mut [u8], abortable: bool) -> Result<Transfer> {
        let lid = self.core_link()?.id;
        if buf.is_empty() {
            return Ok(Transfer::Complete(0));
        }
        let (flags, term_char) = match self.config.term_char {
            Some(c) => (Flags::TERM_CHAR_SET, c),
            None => (Flags::NONE, 0),
        };

        let mut budget = Budget::new(self.read_timeout);
        let mut received = 0;
        loop {
            if self.interrupt_pending(abortable) {
                return Ok(self.abort(received));
            }
            let Some(io_timeout) = budget.next() else {
                log::debug!("Read timeout used up after {} bytes", received);
                return Ok(Transfer::TimedOut(received));
            };
            let request_size = u32::try_from(buf.len() - received).unwrap_or(u32::MAX);
            log::debug!(
                "device_read: requesting {} bytes, io_timeout={}ms",
                request_size,
                io_timeout
            );
            let resp = self
                .transport
                .device_read(&DeviceReadParms {
                    lid,
                    request_size,
                    io_timeout,
                    lock_timeout: io_timeout,
                    flags,
                    term_char,
                })
                .map_err(Error::rpc("device_read", received))?;

            let len = resp.data.len();
            if len > request_size as usize {
                return Err(Error::Protocol {
                    operation: "device_read",
                    detail: format!(
                        "device returned {} bytes, {} were requested",
                        len, request_size
                    ),
                    transferred: received,
                });
            }
            buf[received..received + len].copy_from_slice(&resp.data);
            received += len;
            log::trace!("Read from {}: {:02x?}", self.device_name(), &resp.data[..]);

            if resp.error == ErrorCode::IO_TIMEOUT {
                log::debug!("Device timed out after {} bytes", received);
                return Ok(Transfer::TimedOut(received));
            }
            if !resp.error.is_ok() {
                return Err(Error::Device {
                    operation: "device_read",
                    code: resp.error,
                    transferred: received,
                });
            }

            let end = resp.reason.contains(Reason::END)
                || (flags.contains(Flags::TERM_CHAR_SET)
                    && resp.reason.contains(Reason::TERM_CHAR));
            if resp.reason.contains(Reason::REQUEST_COUNT) && len != request_size as usize {
                log::warn!(
                    "{} reported a satisfied request count after {} of {} bytes",
                    self.device_name(),
                    len,
                    request_size
                );
            }
            if end || received == buf.len() {
                return Ok(Transfer::Complete(received));
            }
            if len == 0 {
                return Err(Error::Protocol {
                    operation: "device_read",
                    detail: "device returned no data and no end of message".to_string(),
                    transferred: received,
                });
            }
        }
    }

    /// Write `command` and read the response, up to `max_len` bytes.
    ///
    /// The returned data holds the bytes received even if the read did not complete.
    pub fn query(
        &mut self,
        command: &[u8],
        max_len: usize,
        abortable: bool,
    ) -> Result<(Transfer, Vec<u8>)> {
        match self.write(command, abortable)? {
            Transfer::Complete(_) => {}
            other => return Ok((other, Vec::new())),
        }
        let mut buf = vec![0u8; max_len];
        let transfer = self.read(&mut buf, abortable)?;
        buf.truncate(transfer.bytes());
        Ok((transfer, buf))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        abort::Unattended,
        fake::{Call, FakeTransport},
        session::Config,
    };
    use std::sync::{Arc, atomic::AtomicBool};
    use vxi11_protocol::{DeviceReadResp, LinkId};

    fn open(transport: &FakeTransport) -> Session<FakeTransport> {
        Session::open(transport.clone(), Unattended, "scope", "10.0.0.5", Config::default())
            .unwrap()
    }

    fn chunk(data: &[u8], reason: Reason) -> DeviceReadResp {
        DeviceReadResp {
            error: ErrorCode::NO_ERROR,
            reason,
            data: data.to_vec(),
        }
    }

    #[test]
    fn write_splits_into_link_sized_chunks() {
        let transport = FakeTransport::new(1024);
        let mut session = open(&transport);
        let data: Vec<u8> = (0..3000).map(|i| i as u8).collect();
        assert_eq!(session.write(&data, false).unwrap(), Transfer::Complete(3000));
        let writes = transport.writes();
        assert_eq!(
            writes.iter().map(|w| (w.0, w.1)).collect::<Vec<_>>(),
            vec![(1024, false), (1024, false), (952, true)]
        );
        assert_eq!(transport.device().written, data);
    }

    #[test]
    fn end_only_on_last_of_three_chunks() {
        let ceiling = 2048;
        let transport = FakeTransport::new(ceiling);
        let mut session = open(&transport);
        let len = 2 * ceiling as usize + 5;
        assert_eq!(session.write(&vec![1u8; len], false).unwrap(), Transfer::Complete(len));
        let writes = transport.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes.iter().map(|w| w.0).sum::<usize>(), len);
        assert_eq!(writes.iter().filter(|w| w.1).count(), 1);
        assert!(writes[2].1);
    }

    #[test]
    fn write_reports_every_byte() {
        for len in [1, 1023, 1024, 1025, 5000] {
            let transport = FakeTransport::new(1024);
            let mut session = open(&transport);
            assert_eq!(session.write(&vec![0u8; len], false).unwrap().bytes(), len);
        }
    }

    #[test]
    fn empty_write_makes_no_call() {
        let transport = FakeTransport::new(1024);
        let mut session = open(&transport);
        let before = transport.calls().len();
        assert_eq!(session.write(&[], true).unwrap(), Transfer::Complete(0));
        assert_eq!(transport.calls().len(), before);
    }

    #[test]
    fn partially_accepted_chunk_is_resent() {
        let transport = FakeTransport::new(1024);
        transport.device().accept_limit = Some(600);
        let mut session = open(&transport);
        assert_eq!(session.write(&[7u8; 1000], false).unwrap(), Transfer::Complete(1000));
        let writes = transport.writes();
        assert_eq!(
            writes.iter().map(|w| (w.0, w.1)).collect::<Vec<_>>(),
            vec![(1000, true), (400, true)]
        );
    }

    #[test]
    fn write_failure_carries_partial_count() {
        let transport = FakeTransport::new(1024);
        let mut session = open(&transport);
        transport.fail("device_write", &[ErrorCode::NO_ERROR, ErrorCode::IO_ERROR]);
        let err = session.write(&[0u8; 3000], false).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::IO_ERROR));
        assert_eq!(err.transferred(), 1024);
        assert_eq!(err.to_string(), "device_write failed: I/O error");
        assert!(session.last_failed());
        assert_eq!(transport.writes().len(), 2);
    }

    #[test]
    fn write_over_acceptance_is_a_protocol_violation() {
        let transport = FakeTransport::new(1024);
        transport.device().over_report = 1;
        let mut session = open(&transport);
        match session.write(b"*CLS", false) {
            Err(Error::Protocol { operation, .. }) => assert_eq!(operation, "device_write"),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn short_read_with_end() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![chunk(b"KEITHLEY,2000\n", Reason::END)]);
        let mut session = open(&transport);
        let mut buf = [0u8; 256];
        let transfer = session.read(&mut buf, false).unwrap();
        assert_eq!(transfer, Transfer::Complete(14));
        assert_eq!(&buf[..14], b"KEITHLEY,2000\n");
    }

    #[test]
    fn read_accumulates_until_count() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![
            chunk(&[1; 30], Reason::default()),
            chunk(&[2; 30], Reason::default()),
            chunk(&[3; 40], Reason::REQUEST_COUNT),
        ]);
        let mut session = open(&transport);
        let mut buf = [0u8; 100];
        assert_eq!(session.read(&mut buf, false).unwrap(), Transfer::Complete(100));
        assert_eq!(transport.read_sizes(), vec![100, 70, 40]);
        assert_eq!(buf[29..31], [1, 2]);
        assert_eq!(buf[99], 3);
    }

    #[test]
    fn device_timeout_keeps_partial_data() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![DeviceReadResp {
            error: ErrorCode::IO_TIMEOUT,
            reason: Reason::default(),
            data: vec![9; 40],
        }]);
        let mut session = open(&transport);
        let mut buf = [0u8; 100];
        assert_eq!(session.read(&mut buf, false).unwrap(), Transfer::TimedOut(40));
        assert_eq!(buf[..40], [9; 40]);
        assert!(!session.last_failed());
    }

    #[test]
    fn read_error_is_failure() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![
            chunk(b"abc", Reason::default()),
            DeviceReadResp {
                error: ErrorCode::IO_ERROR,
                reason: Reason::default(),
                data: Vec::new(),
            },
        ]);
        let mut session = open(&transport);
        let mut buf = [0u8; 10];
        let err = session.read(&mut buf, false).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::IO_ERROR));
        assert_eq!(err.transferred(), 3);
    }

    #[test]
    fn excess_data_is_not_truncated() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![chunk(&[0; 11], Reason::END)]);
        let mut session = open(&transport);
        let mut buf = [0u8; 10];
        match session.read(&mut buf, false) {
            Err(Error::Protocol { operation, transferred, .. }) => {
                assert_eq!(operation, "device_read");
                assert_eq!(transferred, 0);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn term_char_ends_read() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![chunk(b"1.25\n", Reason::TERM_CHAR)]);
        let config = Config {
            term_char: Some(b'\n'),
            ..Config::default()
        };
        let mut session =
            Session::open(transport.clone(), Unattended, "scope", "10.0.0.5", config).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(session.read(&mut buf, false).unwrap(), Transfer::Complete(5));
        let read = transport.device().reads_seen.last().cloned().unwrap();
        assert_eq!(read.flags, Flags::TERM_CHAR_SET);
        assert_eq!(read.term_char, b'\n');
    }

    #[test]
    fn empty_read_makes_no_call() {
        let transport = FakeTransport::new(1024);
        let mut session = open(&transport);
        let before = transport.calls().len();
        assert_eq!(session.read(&mut [], false).unwrap(), Transfer::Complete(0));
        assert_eq!(transport.calls().len(), before);
    }

    #[test]
    fn cancelled_read_aborts_once() {
        let transport = FakeTransport::new(1024);
        transport.script_reads((0..5).map(|_| chunk(&[0; 20], Reason::default())).collect());
        let flag = Arc::new(AtomicBool::new(false));
        transport.device().interrupt_after_reads = Some((1, flag.clone()));
        let config = Config {
            async_channel: true,
            ..Config::default()
        };
        let mut session =
            Session::open(transport.clone(), flag.clone(), "scope", "10.0.0.5", config).unwrap();
        let mut buf = [0u8; 100];
        assert_eq!(session.read(&mut buf, true).unwrap(), Transfer::Cancelled(20));
        assert_eq!(transport.read_sizes().len(), 1);
        let aborts: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Abort(_)))
            .collect();
        assert_eq!(aborts, vec![Call::Abort(LinkId(7))]);
        assert!(session.is_open());
    }

    #[test]
    fn timeouts_shrink_across_chunks() {
        let transport = FakeTransport::new(1024);
        transport.device().call_delay = Duration::from_millis(5);
        transport.script_reads((0..5).map(|_| chunk(&[0; 10], Reason::default())).collect());
        let mut session = open(&transport);
        session.set_read_timeout(Duration::from_millis(1000));
        let mut buf = [0u8; 50];
        assert_eq!(session.read(&mut buf, false).unwrap(), Transfer::Complete(50));

        let device = transport.device();
        assert_eq!(device.reads_seen.len(), 5);
        let first_call = device.read_times[0];
        let first_timeout = device.reads_seen[0].io_timeout;
        assert!(first_timeout <= 1000);
        let mut previous = u32::MAX;
        for (parms, at) in device.reads_seen.iter().zip(&device.read_times) {
            assert!(parms.io_timeout < previous);
            previous = parms.io_timeout;
            // no call may wait beyond the deadline of the whole read
            let deadline = (*at - first_call) + Duration::from_millis(u64::from(parms.io_timeout));
            assert!(deadline <= Duration::from_millis(u64::from(first_timeout) + 2));
        }
    }

    #[test]
    fn used_up_read_timeout_returns_partial_data() {
        let transport = FakeTransport::new(1024);
        transport.device().call_delay = Duration::from_millis(20);
        transport.script_reads((0..10).map(|_| chunk(&[5; 10], Reason::default())).collect());
        let mut session = open(&transport);
        session.set_read_timeout(Duration::from_millis(30));
        let mut buf = [0u8; 100];
        match session.read(&mut buf, false).unwrap() {
            Transfer::TimedOut(n) => assert!(n >= 10 && n < 100 && n % 10 == 0),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn used_up_write_timeout_fails() {
        let transport = FakeTransport::new(1024);
        transport.device().call_delay = Duration::from_millis(20);
        let mut session = open(&transport);
        session.set_write_timeout(Duration::from_millis(30));
        let err = session.write(&[0u8; 10 * 1024], false).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.transferred() >= 1024 && err.transferred() < 10 * 1024);
    }

    #[test]
    fn query_writes_then_reads() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![chunk(b"+1.0E+00\n", Reason::END)]);
        let mut session = open(&transport);
        let (transfer, data) = session.query(b"MEAS:VOLT?\n", 128, false).unwrap();
        assert_eq!(transfer, Transfer::Complete(9));
        assert_eq!(data, b"+1.0E+00\n");
        assert_eq!(transport.device().written, b"MEAS:VOLT?\n");
    }

    #[test]
    fn budget_counts_down() {
        let mut budget = Budget::new(Duration::from_millis(100));
        let first = budget.next().unwrap();
        assert_eq!(first, 100);
        std::thread::sleep(Duration::from_millis(10));
        assert!(budget.next().unwrap() <= first - 10);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(budget.next(), None);
    }

    #[test]
    fn first_call_gets_whole_budget() {
        assert_eq!(Budget::new(Duration::from_millis(5)).next(), Some(5));
        assert_eq!(Budget::new(Duration::from_millis(1)).next(), Some(1));
        assert_eq!(Budget::new(Duration::from_micros(300)).next(), Some(1));
    }

    #[test]
    fn partial_milliseconds_round_up() {
        let mut budget = Budget {
            remaining: Duration::from_micros(2500),
            last: Some(Instant::now()),
        };
        let next = budget.next().unwrap();
        assert!((1..=3).contains(&next));
    }

    #[test]
    fn one_millisecond_read_reaches_device() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![chunk(b"0\n", Reason::END)]);
        let mut session = open(&transport);
        session.set_read_timeout(Duration::from_millis(1));
        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf, false).unwrap(), Transfer::Complete(2));
        assert_eq!(transport.read_sizes(), vec![16]);
        assert_eq!(transport.device().reads_seen[0].io_timeout, 1);
    }

    #[test]
    fn one_millisecond_write_reaches_device() {
        let transport = FakeTransport::new(1024);
        let mut session = open(&transport);
        session.set_write_timeout(Duration::from_millis(1));
        assert_eq!(session.write(b"*TRG\n", false).unwrap(), Transfer::Complete(5));
        assert_eq!(transport.writes(), vec![(5, true)]);
    }

    #[test]
    fn write_without_progress_is_a_protocol_violation() {
        let transport = FakeTransport::new(1024);
        transport.device().accept_limit = Some(0);
        let mut session = open(&transport);
        session.set_write_timeout(Duration::ZERO);
        match session.write(b"*TRG\n", false) {
            Err(Error::Protocol { operation, transferred, .. }) => {
                assert_eq!(operation, "device_write");
                assert_eq!(transferred, 0);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn read_without_progress_is_a_protocol_violation() {
        let transport = FakeTransport::new(1024);
        transport.script_reads(vec![
            chunk(b"12", Reason::default()),
            chunk(b"", Reason::default()),
            chunk(b"34", Reason::END),
        ]);
        let mut session = open(&transport);
        session.set_read_timeout(Duration::ZERO);
        let mut buf = [0u8; 16];
        match session.read(&mut buf, false) {
            Err(Error::Protocol { operation, transferred, .. }) => {
                assert_eq!(operation, "device_read");
                assert_eq!(transferred, 2);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(transport.read_sizes(), vec![16, 14]);
    }

    #[test]
    fn zero_timeout_budget_is_unlimited() {
        let mut budget = Budget::new(Duration::ZERO);
        assert!(budget.next().unwrap() > u32::MAX - 1000);
    }
}
