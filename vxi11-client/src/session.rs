use std::time::Duration;

use vxi11_protocol::{CreateLinkParms, LinkId, MIN_MAX_RECV_SIZE};

use crate::{
    abort::{Host, Unattended},
    control::LockState,
    error::{Error, Result},
    rpc::TcpTransport,
    transport::Transport,
};

/// Options applied when a session is opened.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the logical device on the instrument, e.g. `inst0` or `gpib0,5`.
    pub remote_service: String,
    /// Acquire the exclusive device lock when creating the core link.
    pub lock_device: bool,
    /// How long to wait for the device lock. Zero waits forever.
    pub acquire_timeout: Duration,
    /// Connect the abort channel so transfers can be cancelled.
    pub async_channel: bool,
    /// Total time a read may take. Zero waits forever.
    pub read_timeout: Duration,
    /// Total time a write may take. Zero waits forever.
    pub write_timeout: Duration,
    /// Character that terminates a read, in addition to the END indicator.
    pub term_char: Option<u8>,
    /// How often a control call that timed out is re-issued.
    pub control_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_service: "inst0".to_string(),
            lock_device: false,
            acquire_timeout: Duration::ZERO,
            async_channel: false,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            term_char: None,
            control_retries: 0,
        }
    }
}

/// Builder to open a [Session] with modified configuration options
///
/// # Example
///
/// ```ignore
/// use vxi11_client::Builder;
/// use std::time::Duration;
///
/// let mut session = Builder::new()
///     .remote_service("gpib0,5")
///     .lock_device(true)
///     .read_timeout(Duration::from_secs(2))
///     .connect("scope", "192.168.1.20")?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn remote_service(mut self, name: impl Into<String>) -> Self {
        self.config.remote_service = name.into();
        self
    }

    pub fn lock_device(mut self, lock: bool) -> Self {
        self.config.lock_device = lock;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Request the abort channel, required for abortable transfers
    pub fn async_channel(mut self, enabled: bool) -> Self {
        self.config.async_channel = enabled;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn term_char(mut self, term_char: Option<u8>) -> Self {
        self.config.term_char = term_char;
        self
    }

    pub fn control_retries(mut self, retries: u32) -> Self {
        self.config.control_retries = retries;
        self
    }

    /// Open a session over an existing transport
    pub fn open<T: Transport, H: Host>(
        self,
        transport: T,
        host: H,
        device_name: &str,
        address: &str,
    ) -> Result<Session<T, H>> {
        Session::open(transport, host, device_name, address, self.config)
    }

    /// Connect to the instrument at `address` over TCP and open a session
    pub fn connect(self, device_name: &str, address: &str) -> Result<Session<TcpTransport>> {
        self.connect_with_host(device_name, address, Unattended)
    }

    /// Like [Builder::connect], but transfers can be interrupted through `host`
    pub fn connect_with_host<H: Host>(
        self,
        device_name: &str,
        address: &str,
        host: H,
    ) -> Result<Session<TcpTransport, H>> {
        if address.is_empty() {
            return Err(Error::InvalidArgument("address must not be empty"));
        }
        let transport = TcpTransport::connect(address).map_err(Error::rpc("connect", 0))?;
        self.open(transport, host, device_name, address)
    }
}

/// A negotiated link to the device.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) id: LinkId,
    pub(crate) max_transfer: usize,
}

/// Converts a caller supplied timeout into protocol milliseconds.
/// Zero means "wait forever" and becomes the largest representable value.
pub(crate) fn timeout_millis(timeout: Duration) -> u32 {
    if timeout.is_zero() {
        u32::MAX
    } else {
        timeout.as_millis().clamp(1, u32::MAX as u128) as u32
    }
}

/// An open connection to one instrument.
///
/// A session owns a core link for all command and data traffic and, optionally, an async link
/// used to abort transfers in progress. Closing (or dropping) the session releases both.
pub struct Session<T: Transport, H: Host = Unattended> {
    pub(crate) transport: T,
    pub(crate) host: H,
    device_name: String,
    address: String,
    pub(crate) config: Config,
    pub(crate) core: Option<Link>,
    pub(crate) async_link: Option<Link>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    last_failed: bool,
}

impl<T: Transport, H: Host> Session<T, H> {
    /// Open a session: create the core link, apply the default timeouts, clear the device and
    /// put it into remote lock-out. When requested, the async link is created as well.
    ///
    /// Either every step succeeds, or every link created so far is released again and an error
    /// is returned.
    pub fn open(
        transport: T,
        host: H,
        device_name: &str,
        address: &str,
        config: Config,
    ) -> Result<Session<T, H>> {
        assert!(
            host.measurement_active(),
            "VXI-11 session opened outside of an active measurement"
        );
        if device_name.is_empty() {
            return Err(Error::InvalidArgument("device name must not be empty"));
        }
        if address.is_empty() {
            return Err(Error::InvalidArgument("address must not be empty"));
        }

        let mut session = Session {
            transport,
            host,
            device_name: device_name.to_string(),
            address: address.to_string(),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            core: None,
            async_link: None,
            config,
            last_failed: false,
        };

        let parms = CreateLinkParms {
            client_id: std::process::id() as i32,
            lock_device: session.config.lock_device,
            lock_timeout: timeout_millis(session.config.acquire_timeout),
            device: session.config.remote_service.clone(),
        };
        log::debug!(
            "Creating core link to {} ({}) at {}",
            session.device_name,
            parms.device,
            session.address
        );
        let resp = session
            .transport
            .create_link(&parms)
            .map_err(Error::rpc("create_link", 0))?;
        if !resp.error.is_ok() {
            return Err(Error::Device {
                operation: "create_link",
                code: resp.error,
                transferred: 0,
            });
        }
        let mut max_transfer = resp.max_recv_size;
        if max_transfer == 0 {
            log::warn!(
                "Device {} advertised no transfer size, using the protocol minimum of {}",
                session.device_name,
                MIN_MAX_RECV_SIZE
            );
            max_transfer = MIN_MAX_RECV_SIZE;
        } else if max_transfer < MIN_MAX_RECV_SIZE {
            log::warn!(
                "Device {} advertised a transfer size of {}, below the protocol minimum of {}",
                session.device_name,
                max_transfer,
                MIN_MAX_RECV_SIZE
            );
        }
        session.core = Some(Link {
            id: resp.lid,
            max_transfer: max_transfer as usize,
        });
        log::debug!(
            "Core link {} created, max transfer size {}",
            resp.lid,
            max_transfer
        );

        if let Err(err) = session.initialize(resp.abort_port) {
            log::error!(
                "Setting up session for {} failed: {}",
                session.device_name,
                err
            );
            if let Err(cleanup) = session.release_links() {
                log::warn!("Releasing links of {} failed: {}", session.device_name, cleanup);
            }
            return Err(err);
        }

        log::info!(
            "Opened session to {} at {} (async link: {})",
            session.device_name,
            session.address,
            session.async_link.is_some()
        );
        Ok(session)
    }

    fn initialize(&mut self, abort_port: u16) -> Result<()> {
        self.read_timeout = self.config.read_timeout;
        self.write_timeout = self.config.write_timeout;
        self.clear_device()?;
        self.lock_state(LockState::Remote)?;

        if self.config.async_channel {
            log::debug!("Opening abort channel on port {}", abort_port);
            self.transport
                .open_abort_channel(abort_port)
                .map_err(Error::rpc("create async link", 0))?;
            // The abort channel addresses the operations of the core link
            let core = self.core_link()?;
            self.async_link = Some(Link {
                id: core.id,
                max_transfer: core.max_transfer,
            });
        }
        Ok(())
    }

    /// Close the session. Releases the async link and the core link, in that order.
    ///
    /// Returning the device to local control and releasing the async link are best-effort.
    /// Only a failure to destroy the core link is reported. The session is closed afterwards
    /// in any case, and closing a closed session succeeds.
    pub fn close(&mut self) -> Result<()> {
        self.check_phase();
        if self.core.is_none() {
            return Ok(());
        }
        if let Err(err) = self.lock_state(LockState::Local) {
            log::warn!("Returning {} to local control failed: {}", self.device_name, err);
        }
        let result = self.release_links();
        log::info!("Closed session to {}", self.device_name);
        self.record(result)
    }

    /// Destroys the async link (best-effort) and then the core link.
    fn release_links(&mut self) -> Result<()> {
        if self.async_link.take().is_some() {
            log::debug!("Closing abort channel");
            if let Err(err) = self.transport.close_abort_channel() {
                log::warn!("Closing abort channel of {} failed: {}", self.device_name, err);
            }
        }
        let Some(core) = self.core.take() else {
            return Ok(());
        };
        log::debug!("Destroying core link {}", core.id);
        let resp = self
            .transport
            .destroy_link(core.id)
            .map_err(Error::rpc("destroy_link", 0))?;
        if !resp.error.is_ok() {
            return Err(Error::Device {
                operation: "destroy_link",
                code: resp.error,
                transferred: 0,
            });
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.core.is_some()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn remote_service(&self) -> &str {
        &self.config.remote_service
    }

    /// Largest number of bytes sent in a single `device_write`.
    pub fn max_transfer_size(&self) -> Option<usize> {
        self.core.as_ref().map(|link| link.max_transfer)
    }

    /// Whether transfers of this session can be aborted.
    pub fn has_async_link(&self) -> bool {
        self.async_link.is_some()
    }

    /// Whether the most recent operation failed.
    pub fn last_failed(&self) -> bool {
        self.last_failed
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Set the total time a read may take. Zero waits forever.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Set the total time a write may take. Zero waits forever.
    /// Control calls use this timeout as well.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn check_phase(&self) {
        assert!(
            self.host.measurement_active(),
            "VXI-11 session of {} used outside of an active measurement",
            self.device_name
        );
    }

    pub(crate) fn core_link(&self) -> Result<&Link> {
        self.core.as_ref().ok_or(Error::Closed)
    }

    pub(crate) fn record<R>(&mut self, result: Result<R>) -> Result<R> {
        self.last_failed = result.is_err();
        result
    }
}

impl<T: Transport, H: Host> Drop for Session<T, H> {
    fn drop(&mut self) {
        if self.core.is_none() {
            return;
        }
        if let Err(err) = self.lock_state(LockState::Local) {
            log::warn!("Returning {} to local control failed: {}", self.device_name, err);
        }
        if let Err(err) = self.release_links() {
            log::warn!("Releasing links of {} failed: {}", self.device_name, err);
        }
    }
}
