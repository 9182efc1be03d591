//! A VXI-11 instrument on the loopback interface, for end-to-end tests of the client.
//!
//! [`Instrument::start`] listens on three ephemeral ports: a portmapper, the core channel and
//! the abort channel. Every connection is served by its own thread. The instrument collects
//! the messages it receives and answers queries registered with [`Instrument::answer`].
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Cursor},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use vxi11_protocol::{
    CreateLinkParms, CreateLinkResp, DEVICE_ASYNC, DEVICE_CORE, DeviceError, DeviceGenericParms,
    DeviceReadParms, DeviceReadResp, DeviceReadStbResp, DeviceWriteParms, DeviceWriteResp, Flags,
    LinkId, Mapping, Procedure, Reason,
    codec::Xdr,
    error::{ErrorCode, ReadError},
    rpc::{
        AcceptStat, CallHeader, PMAP_PROGRAM, PMAPPROC_GETPORT, read_record, write_record,
        write_reply_header,
    },
};

/// Longest a read waits for output before reporting a timeout.
const MAX_READ_WAIT: Duration = Duration::from_millis(500);

/// Everything the instrument has seen, and the knobs tests turn.
#[derive(Default)]
pub struct State {
    /// Transfer size announced by `create_link`.
    pub max_recv_size: u32,
    /// Responses to complete messages.
    pub answers: HashMap<Vec<u8>, Vec<u8>>,
    /// Complete messages, i.e. data up to a chunk with the END flag.
    pub messages: Vec<Vec<u8>>,
    /// Length of every `device_write` chunk.
    pub chunks: Vec<usize>,
    /// Core and abort procedures in the order they were called.
    pub procedures: Vec<Procedure>,
    /// Links named by `device_abort`.
    pub aborts: Vec<LinkId>,
    /// Device names of `create_link` calls.
    pub devices: Vec<String>,
    pub stb: u8,
    /// Upper bound of data returned by one `device_read`.
    pub read_chunk: Option<usize>,
    /// Raises the flag once this many reads were answered.
    pub interrupt_after_reads: Option<(usize, Arc<AtomicBool>)>,
    /// Error returned by `create_link`.
    pub refuse_link: Option<ErrorCode>,
    pending: Vec<u8>,
    output: VecDeque<u8>,
    reads: usize,
    next_lid: u32,
    open_links: Vec<LinkId>,
    abort_port: u16,
}

impl State {
    /// Links created and not yet destroyed.
    pub fn open_links(&self) -> &[LinkId] {
        &self.open_links
    }
}

enum Reply {
    Body(Vec<u8>),
    Unavailable,
}

fn body(message: &impl Xdr) -> Result<Reply, ReadError> {
    Ok(Reply::Body(message.to_bytes()))
}

/// Handle to a running loopback instrument. The serving threads live until the process exits.
pub struct Instrument {
    state: Arc<Mutex<State>>,
    portmapper: SocketAddr,
    core: SocketAddr,
}

impl Instrument {
    pub fn start(max_recv_size: u32) -> io::Result<Instrument> {
        let portmapper = TcpListener::bind("127.0.0.1:0")?;
        let core = TcpListener::bind("127.0.0.1:0")?;
        let abort = TcpListener::bind("127.0.0.1:0")?;

        let state = Arc::new(Mutex::new(State {
            max_recv_size,
            next_lid: 1,
            abort_port: abort.local_addr()?.port(),
            ..State::default()
        }));
        let instrument = Instrument {
            state: state.clone(),
            portmapper: portmapper.local_addr()?,
            core: core.local_addr()?,
        };

        let core_port = instrument.core.port();
        serve(portmapper, state.clone(), PMAP_PROGRAM, move |_, header, reader| {
            portmap(core_port, header, reader)
        });
        serve(core, state.clone(), DEVICE_CORE, core_channel);
        serve(abort, state, DEVICE_ASYNC, abort_channel);
        Ok(instrument)
    }

    pub fn core_addr(&self) -> SocketAddr {
        self.core
    }

    pub fn portmapper_addr(&self) -> SocketAddr {
        self.portmapper
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Respond to `query` with `response`.
    pub fn answer(&self, query: &[u8], response: &[u8]) {
        self.state().answers.insert(query.to_vec(), response.to_vec());
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // a test that panicked while holding the lock must not hide the state from the others
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn serve<F>(listener: TcpListener, state: Arc<Mutex<State>>, program: u32, handler: F)
where
    F: Fn(&Mutex<State>, &CallHeader, &mut Cursor<Vec<u8>>) -> Result<Reply, ReadError>
        + Copy
        + Send
        + 'static,
{
    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    break;
                }
            };
            let state = state.clone();
            thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                match handle_connection(stream, &state, program, handler) {
                    Ok(()) => log::debug!("Connection from {:?} closed", peer),
                    Err(e) => log::warn!("Connection from {:?} failed: {}", peer, e),
                }
            });
        }
    });
}

fn handle_connection<F>(
    mut stream: TcpStream,
    state: &Mutex<State>,
    program: u32,
    handler: F,
) -> Result<(), ReadError>
where
    F: Fn(&Mutex<State>, &CallHeader, &mut Cursor<Vec<u8>>) -> Result<Reply, ReadError>,
{
    loop {
        let record = match read_record(&mut stream) {
            Ok(record) => record,
            Err(ReadError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mut reader = Cursor::new(record);
        let header = CallHeader::from_reader(&mut reader)?;
        let (stat, body) = if header.program != program {
            (AcceptStat::ProgUnavail, Vec::new())
        } else {
            match handler(state, &header, &mut reader) {
                Ok(Reply::Body(body)) => (AcceptStat::Success, body),
                Ok(Reply::Unavailable) => (AcceptStat::ProcUnavail, Vec::new()),
                Err(e) => {
                    log::warn!(
                        "Cannot decode arguments of procedure {}: {}",
                        header.procedure,
                        e
                    );
                    (AcceptStat::GarbageArgs, Vec::new())
                }
            }
        };
        let mut reply = Vec::new();
        write_reply_header(header.xid, stat, &mut reply)?;
        reply.extend_from_slice(&body);
        write_record(&mut stream, &reply)?;
    }
}

fn portmap(
    core_port: u16,
    header: &CallHeader,
    reader: &mut Cursor<Vec<u8>>,
) -> Result<Reply, ReadError> {
    if header.procedure != PMAPPROC_GETPORT {
        return Ok(Reply::Unavailable);
    }
    let mapping = Mapping::from_reader(reader)?;
    let port = if mapping.program == DEVICE_CORE && mapping.protocol == Mapping::IPPROTO_TCP {
        u32::from(core_port)
    } else {
        0
    };
    body(&port)
}

fn core_channel(
    state: &Mutex<State>,
    header: &CallHeader,
    reader: &mut Cursor<Vec<u8>>,
) -> Result<Reply, ReadError> {
    let Some(procedure) = Procedure::from_number(header.program, header.procedure) else {
        return Ok(Reply::Unavailable);
    };
    lock(state).procedures.push(procedure);
    match procedure {
        Procedure::CreateLink => {
            let parms = CreateLinkParms::from_reader(reader)?;
            let mut state = lock(state);
            state.devices.push(parms.device);
            if let Some(error) = state.refuse_link {
                return body(&CreateLinkResp {
                    error,
                    lid: LinkId(0),
                    abort_port: 0,
                    max_recv_size: 0,
                });
            }
            let lid = LinkId(state.next_lid);
            state.next_lid += 1;
            state.open_links.push(lid);
            body(&CreateLinkResp {
                error: ErrorCode::NO_ERROR,
                lid,
                abort_port: state.abort_port,
                max_recv_size: state.max_recv_size,
            })
        }
        Procedure::DestroyLink => {
            let lid = LinkId::from_reader(reader)?;
            let mut state = lock(state);
            let before = state.open_links.len();
            state.open_links.retain(|open| *open != lid);
            let error = if state.open_links.len() < before {
                ErrorCode::NO_ERROR
            } else {
                ErrorCode::INVALID_LINK_IDENTIFIER
            };
            body(&DeviceError { error })
        }
        Procedure::DeviceWrite => {
            let parms = DeviceWriteParms::from_reader(reader)?;
            body(&write(&mut lock(state), parms))
        }
        Procedure::DeviceRead => body(&read(state, DeviceReadParms::from_reader(reader)?)),
        Procedure::DeviceReadStb => {
            DeviceGenericParms::from_reader(reader)?;
            body(&DeviceReadStbResp {
                error: ErrorCode::NO_ERROR,
                stb: lock(state).stb,
            })
        }
        Procedure::DeviceClear => {
            DeviceGenericParms::from_reader(reader)?;
            let mut state = lock(state);
            state.pending.clear();
            state.output.clear();
            body(&DeviceError {
                error: ErrorCode::NO_ERROR,
            })
        }
        Procedure::DeviceTrigger | Procedure::DeviceRemote | Procedure::DeviceLocal => {
            DeviceGenericParms::from_reader(reader)?;
            body(&DeviceError {
                error: ErrorCode::NO_ERROR,
            })
        }
        Procedure::DeviceAbort => Ok(Reply::Unavailable),
    }
}

fn write(state: &mut State, parms: DeviceWriteParms) -> DeviceWriteResp {
    state.chunks.push(parms.data.len());
    state.pending.extend_from_slice(&parms.data);
    if parms.flags.contains(Flags::END) {
        let message = std::mem::take(&mut state.pending);
        if let Some(response) = state.answers.get(&message).cloned() {
            state.output.extend(response);
        }
        state.messages.push(message);
    }
    DeviceWriteResp {
        error: ErrorCode::NO_ERROR,
        size: parms.data.len() as u32,
    }
}

fn read(state: &Mutex<State>, parms: DeviceReadParms) -> DeviceReadResp {
    if lock(state).output.is_empty() {
        // nothing to send; behave like an instrument that waits out the timeout
        thread::sleep(Duration::from_millis(u64::from(parms.io_timeout)).min(MAX_READ_WAIT));
        return DeviceReadResp {
            error: ErrorCode::IO_TIMEOUT,
            reason: Reason::default(),
            data: Vec::new(),
        };
    }

    let mut state = lock(state);
    let mut len = state.output.len().min(parms.request_size as usize);
    if let Some(chunk) = state.read_chunk {
        len = len.min(chunk);
    }
    let data: Vec<u8> = state.output.drain(..len).collect();
    let reason = if state.output.is_empty() {
        Reason::END
    } else if len == parms.request_size as usize {
        Reason::REQUEST_COUNT
    } else {
        Reason::default()
    };

    state.reads += 1;
    if let Some((after, flag)) = &state.interrupt_after_reads
        && *after == state.reads
    {
        flag.store(true, Ordering::SeqCst);
    }
    DeviceReadResp {
        error: ErrorCode::NO_ERROR,
        reason,
        data,
    }
}

fn abort_channel(
    state: &Mutex<State>,
    header: &CallHeader,
    reader: &mut Cursor<Vec<u8>>,
) -> Result<Reply, ReadError> {
    if Procedure::from_number(header.program, header.procedure) != Some(Procedure::DeviceAbort) {
        return Ok(Reply::Unavailable);
    }
    let lid = LinkId::from_reader(reader)?;
    let mut state = lock(state);
    state.procedures.push(Procedure::DeviceAbort);
    state.aborts.push(lid);
    let error = if state.open_links.contains(&lid) {
        ErrorCode::NO_ERROR
    } else {
        ErrorCode::INVALID_LINK_IDENTIFIER
    };
    body(&DeviceError { error })
}
