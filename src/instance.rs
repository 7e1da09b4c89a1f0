//! Network instance: lifecycle state machine, room membership, records and
//! callbacks.
//!
//! All state sits behind one `std::sync::Mutex`. Entry points hold it only
//! for bookkeeping: network I/O runs on the instance's own tokio runtime with
//! the lock released, and results are installed only if the instance is
//! still in the cycle that started the work. Callbacks are invoked from a
//! dispatcher thread, never with the lock held.

use serde::Serialize;
use std::any::Any;
use std::ffi::{c_char, CString};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::bridge::{FatalHandler, TunnelBridge};
use crate::config::EngineConfig;
use crate::device::{validate_fd, TunDevice};
use crate::error::{EngineError, EngineResult};
use crate::session::{Session, SessionSnapshot};
use crate::signaling::client::{EventHandler, RendezvousClient, RoomEntry};
use crate::signaling::{SignalingEvent, SignalingHandle};
use crate::transport::{PacketTransport, StatsSnapshot, TransportConfig};

/// Host callback signature.
pub type Callback = extern "C" fn();

/// A create or join exchange with the rendezvous service.
type RoomRequest = Pin<Box<dyn Future<Output = EngineResult<RoomEntry>> + Send>>;

/// Grace period for runtime tasks when the instance stops.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Work for the dispatcher thread.
enum Notice {
    Info,
    Stop,
    /// The tunnel bridge of `cycle` hit a descriptor error.
    Fatal { cycle: u64, message: String },
    /// The rendezvous monitor of `epoch` reported something.
    Signaling { epoch: u64, event: SignalingEvent },
}

/// Running-info document handed to the host.
#[derive(Serialize)]
struct RunningInfo<'a> {
    instance_name: &'a str,
    state: InstanceState,
    tun_attached: bool,
    room: Option<SessionSnapshot>,
    stats: StatsSnapshot,
    message: &'a str,
}

#[derive(Default)]
struct Inner {
    state: InstanceState,
    /// Bumped on every start and stop.
    cycle: u64,
    /// Bumped whenever the session is replaced or dropped.
    session_epoch: u64,
    config: Option<Arc<EngineConfig>>,
    runtime: Option<Arc<Runtime>>,
    transport: Option<Arc<PacketTransport>>,
    session: Option<Arc<Session>>,
    signaling: Option<SignalingHandle>,
    bridge: Option<TunnelBridge>,
    tun_fd: Option<RawFd>,
    stop_callback: Option<Callback>,
    info_callback: Option<Callback>,
    latest_error: Option<CString>,
    running_info: Option<CString>,
    room_result: Option<CString>,
    message: String,
}

/// Everything a teardown has to release outside the lock.
#[derive(Default)]
struct Teardown {
    runtime: Option<Arc<Runtime>>,
    transport: Option<Arc<PacketTransport>>,
    signaling: Option<SignalingHandle>,
    bridge: Option<TunnelBridge>,
}

impl Teardown {
    fn take_from(inner: &mut Inner) -> Self {
        inner.session = None;
        inner.session_epoch += 1;
        inner.tun_fd = None;
        Self {
            runtime: inner.runtime.take(),
            transport: inner.transport.take(),
            signaling: inner.signaling.take(),
            bridge: inner.bridge.take(),
        }
    }

    /// Leave the room, stop the pumps and the transport, then the runtime.
    fn run(self) {
        let Some(runtime) = self.runtime else {
            return;
        };
        let signaling = self.signaling;
        let bridge = self.bridge;
        runtime.block_on(async move {
            if let Some(signaling) = signaling {
                signaling.stop().await;
            }
            if let Some(bridge) = bridge {
                bridge.stop().await;
            }
        });
        if let Some(transport) = self.transport {
            transport.shutdown();
        }
        match Arc::try_unwrap(runtime) {
            Ok(runtime) => runtime.shutdown_timeout(RUNTIME_SHUTDOWN),
            // Another entry point is still inside block_on; the runtime
            // goes away when it returns.
            Err(shared) => drop(shared),
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    notices: Mutex<mpsc::Sender<Notice>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, notice: Notice) {
        let sender = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        if sender.send(notice).is_err() {
            log::debug!("Dispatcher gone; notice dropped");
        }
    }

    fn sender(&self) -> mpsc::Sender<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Overwrite the error record.
    fn record_error(&self, inner: &mut Inner, err: &EngineError) {
        log::warn!("{}", err);
        inner.latest_error = Some(to_cstring(err.to_string()));
    }

    /// Rebuild the running-info record and queue an info notification.
    fn publish_info(&self, inner: &mut Inner) {
        let stats = inner
            .transport
            .as_ref()
            .map(|t| t.stats().snapshot())
            .unwrap_or_default();
        let info = RunningInfo {
            instance_name: inner
                .config
                .as_ref()
                .map(|c| c.instance_name.as_str())
                .unwrap_or(""),
            state: inner.state,
            tun_attached: inner.bridge.is_some(),
            room: inner.session.as_ref().map(|s| s.snapshot()),
            stats,
            message: &inner.message,
        };
        match serde_json::to_string(&info) {
            Ok(json) => inner.running_info = Some(to_cstring(json)),
            Err(e) => log::error!("Failed to encode running info: {}", e),
        }
        self.notify(Notice::Info);
    }

    fn transition(&self, inner: &mut Inner, state: InstanceState, message: impl Into<String>) {
        inner.state = state;
        inner.message = message.into();
        log::info!("Instance {}: {}", state, inner.message);
        self.publish_info(inner);
    }

    /// Tear down the current cycle. `error` marks a failure: the instance
    /// passes through `Failed` and the error is recorded.
    fn shut_down(&self, error: Option<EngineError>) {
        let teardown = {
            let mut inner = self.lock();
            match inner.state {
                InstanceState::Stopped | InstanceState::Stopping => return,
                _ => {}
            }
            inner.cycle += 1;
            match &error {
                Some(err) => {
                    self.record_error(&mut inner, err);
                    self.transition(&mut inner, InstanceState::Failed, err.to_string());
                }
                None => self.transition(&mut inner, InstanceState::Stopping, "stopping"),
            }
            Teardown::take_from(&mut inner)
        };

        teardown.run();

        let mut inner = self.lock();
        self.transition(&mut inner, InstanceState::Stopped, "stopped");
        self.notify(Notice::Stop);
    }

    fn handle_signaling(&self, epoch: u64, event: SignalingEvent) {
        let mut inner = self.lock();
        if inner.session_epoch != epoch {
            return;
        }
        match event {
            SignalingEvent::MembershipChanged => self.publish_info(&mut inner),
            SignalingEvent::ConnectionLost(reason) => {
                let err = EngineError::Transport(format!("rendezvous connection lost: {}", reason));
                self.record_error(&mut inner, &err);
                inner.signaling = None;
                inner.message = err.to_string();
                self.publish_info(&mut inner);
            }
            SignalingEvent::RoomClosed(reason) => {
                let code = inner
                    .session
                    .as_ref()
                    .map(|s| s.room_code().to_string())
                    .unwrap_or_default();
                if let Some(transport) = &inner.transport {
                    transport.detach_session();
                }
                inner.session = None;
                inner.signaling = None;
                inner.session_epoch += 1;
                let err = EngineError::RoomExpired(format!("{} closed: {}", code, reason));
                self.record_error(&mut inner, &err);
                inner.message = err.to_string();
                self.publish_info(&mut inner);
            }
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn to_cstring(text: String) -> CString {
    CString::new(text.replace('\0', " ")).unwrap_or_default()
}

fn attach_device(inner: &Inner, runtime: &Runtime, fd: RawFd) -> EngineResult<TunDevice> {
    let (packet_info, mtu) = inner
        .config
        .as_ref()
        .map(|c| (c.network.packet_info, c.network.mtu))
        .unwrap_or((false, crate::config::DEFAULT_MTU));
    let _guard = runtime.enter();
    TunDevice::attach(fd, packet_info, mtu)
}

fn run_dispatcher(shared: Weak<Shared>, notices: mpsc::Receiver<Notice>) {
    while let Ok(notice) = notices.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match notice {
            Notice::Info => {
                let callback = shared.lock().info_callback;
                if let Some(callback) = callback {
                    callback();
                }
            }
            Notice::Stop => {
                let callback = shared.lock().stop_callback;
                if let Some(callback) = callback {
                    callback();
                }
            }
            Notice::Fatal { cycle, message } => {
                if shared.lock().cycle == cycle {
                    shared.shut_down(Some(EngineError::Fatal(message)));
                }
            }
            Notice::Signaling { epoch, event } => shared.handle_signaling(epoch, event),
        }
    }
    log::debug!("Callback dispatcher exiting");
}

/// Handle on one network instance. Clones share the same instance.
#[derive(Clone)]
pub struct NetworkInstance {
    shared: Arc<Shared>,
}

impl Default for NetworkInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInstance {
    /// Create a stopped instance and its callback dispatcher.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            notices: Mutex::new(tx),
        });
        let weak = Arc::downgrade(&shared);
        let spawned = std::thread::Builder::new()
            .name("terracotta-callbacks".to_string())
            .spawn(move || run_dispatcher(weak, rx));
        if let Err(e) = spawned {
            log::error!("Failed to spawn callback dispatcher: {}", e);
        }
        Self { shared }
    }

    pub fn state(&self) -> InstanceState {
        self.shared.lock().state
    }

    /// Record `err` as the latest error and hand it back.
    fn fail<T>(&self, inner: &mut Inner, err: EngineError) -> EngineResult<T> {
        self.shared.record_error(inner, &err);
        Err(err)
    }

    fn fail_unlocked<T>(&self, err: EngineError) -> EngineResult<T> {
        let mut inner = self.shared.lock();
        self.fail(&mut inner, err)
    }

    /// Start the instance with a TOML configuration.
    pub fn run(&self, config: &str) -> EngineResult<()> {
        let cycle = self.begin_start(config)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.start_runtime(cycle)));
        self.settle_start(cycle, outcome)
    }

    /// Move from `Stopped` to `Starting` with a freshly parsed config.
    fn begin_start(&self, config: &str) -> EngineResult<u64> {
        let mut inner = self.shared.lock();
        if inner.state != InstanceState::Stopped {
            return self.fail(&mut inner, EngineError::AlreadyRunning);
        }
        let config = match EngineConfig::from_toml_str(config) {
            Ok(config) => config,
            Err(err) => return self.fail(&mut inner, err),
        };
        inner.cycle += 1;
        inner.config = Some(Arc::new(config));
        inner.tun_fd = None;
        self.shared
            .transition(&mut inner, InstanceState::Starting, "starting");
        Ok(inner.cycle)
    }

    /// Turn any failed or panicked start into `Failed` then `Stopped`.
    fn settle_start(
        &self,
        cycle: u64,
        outcome: std::thread::Result<EngineResult<()>>,
    ) -> EngineResult<()> {
        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(EngineError::InitFailure(msg))) => EngineError::InitFailure(msg),
            Ok(Err(other)) => EngineError::InitFailure(other.to_string()),
            Err(panic) => {
                EngineError::InitFailure(format!("panic: {}", panic_message(&*panic)))
            }
        };
        let teardown = {
            let mut inner = self.shared.lock();
            self.shared.record_error(&mut inner, &err);
            if inner.cycle != cycle {
                return Err(err);
            }
            inner.cycle += 1;
            self.shared
                .transition(&mut inner, InstanceState::Failed, err.to_string());
            Teardown::take_from(&mut inner)
        };
        teardown.run();
        let mut inner = self.shared.lock();
        self.shared
            .transition(&mut inner, InstanceState::Stopped, "stopped");
        Err(err)
    }

    fn start_runtime(&self, cycle: u64) -> EngineResult<()> {
        let config = self
            .shared
            .lock()
            .config
            .clone()
            .ok_or_else(|| EngineError::InitFailure("configuration missing".into()))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("terracotta-rt")
            .enable_all()
            .build()
            .map_err(|e| EngineError::InitFailure(format!("tokio runtime: {}", e)))?;

        let transport = runtime.block_on(PacketTransport::bind(
            config.network.listen,
            TransportConfig {
                keepalive_interval: config.keepalive_interval(),
                keepalive_timeout: config.keepalive_timeout(),
                inbound_queue: config.network.inbound_queue,
            },
        ))?;

        let runtime = Arc::new(runtime);
        let mut inner = self.shared.lock();
        if inner.cycle != cycle || inner.state != InstanceState::Starting {
            drop(inner);
            transport.shutdown();
            Teardown {
                runtime: Some(runtime),
                ..Teardown::default()
            }
            .run();
            return Err(EngineError::InitFailure("stopped while starting".into()));
        }

        inner.runtime = Some(runtime);
        inner.transport = Some(transport);
        if let Some(fd) = inner.tun_fd {
            if let Err(err) = self.start_bridge(&mut inner, fd) {
                self.shared.record_error(&mut inner, &err);
                inner.tun_fd = None;
            }
        }
        self.shared
            .transition(&mut inner, InstanceState::Running, "running");
        Ok(())
    }

    /// Stop the instance. Always succeeds; a stopped instance is left alone.
    pub fn stop(&self) -> EngineResult<()> {
        self.shared.shut_down(None);
        Ok(())
    }

    pub fn register_stop_callback(&self, callback: Option<Callback>) -> EngineResult<()> {
        let mut inner = self.shared.lock();
        match callback {
            Some(callback) => {
                inner.stop_callback = Some(callback);
                Ok(())
            }
            None => self.fail(&mut inner, EngineError::NullCallback),
        }
    }

    pub fn register_running_info_callback(&self, callback: Option<Callback>) -> EngineResult<()> {
        let mut inner = self.shared.lock();
        match callback {
            Some(callback) => {
                inner.info_callback = Some(callback);
                Ok(())
            }
            None => self.fail(&mut inner, EngineError::NullCallback),
        }
    }

    /// Latest running-info JSON document.
    pub fn running_info(&self) -> EngineResult<String> {
        let inner = self.shared.lock();
        inner
            .running_info
            .as_ref()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or(EngineError::NoData)
    }

    /// Latest recorded error message. Reading does not clear it.
    pub fn latest_error(&self) -> EngineResult<String> {
        let inner = self.shared.lock();
        inner
            .latest_error
            .as_ref()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or(EngineError::NoData)
    }

    /// Pointer into the error slot, or null. Valid until the slot is
    /// overwritten.
    pub(crate) fn latest_error_ptr(&self) -> *const c_char {
        self.shared
            .lock()
            .latest_error
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    pub(crate) fn running_info_ptr(&self) -> *const c_char {
        self.shared
            .lock()
            .running_info
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    pub(crate) fn room_result_ptr(&self) -> *const c_char {
        self.shared
            .lock()
            .room_result
            .as_ref()
            .map_or(std::ptr::null(), |s| s.as_ptr())
    }

    /// Record an error raised outside the instance (FFI argument checks,
    /// caught panics).
    pub(crate) fn record_external_error(&self, err: &EngineError) {
        let mut inner = self.shared.lock();
        self.shared.record_error(&mut inner, err);
    }

    pub fn session_snapshot(&self) -> Option<SessionSnapshot> {
        self.shared.lock().session.as_ref().map(|s| s.snapshot())
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.shared
            .lock()
            .transport
            .as_ref()
            .map(|t| t.stats().snapshot())
    }

    /// Attach the host TUN descriptor.
    pub fn set_tun_fd(&self, fd: RawFd) -> EngineResult<()> {
        if let Err(err) = validate_fd(fd) {
            return self.fail_unlocked(err);
        }

        let (runtime, cycle, device, old_bridge) = {
            let mut inner = self.shared.lock();
            match inner.state {
                InstanceState::Starting => {
                    inner.tun_fd = Some(fd);
                    return Ok(());
                }
                InstanceState::Running => {}
                _ => return self.fail(&mut inner, EngineError::NotRunning),
            }
            if inner.tun_fd == Some(fd) && inner.bridge.is_some() {
                return Ok(());
            }
            let Some(runtime) = inner.runtime.clone() else {
                return self.fail(&mut inner, EngineError::NotRunning);
            };
            // Registration failure leaves the current bridge in place.
            let device = match attach_device(&inner, &runtime, fd) {
                Ok(device) => device,
                Err(err) => return self.fail(&mut inner, err),
            };
            (runtime, inner.cycle, device, inner.bridge.take())
        };

        // Old pumps must be gone before the new ones drain the inbound queue.
        if let Some(bridge) = old_bridge {
            runtime.block_on(bridge.stop());
        }

        let mut inner = self.shared.lock();
        if inner.cycle != cycle || inner.state != InstanceState::Running {
            return self.fail(&mut inner, EngineError::NotRunning);
        }
        let _guard = runtime.enter();
        if let Err(err) = self.spawn_bridge(&mut inner, device) {
            return self.fail(&mut inner, err);
        }
        inner.tun_fd = Some(fd);
        inner.message = format!("tun descriptor {} attached", fd);
        self.shared.publish_info(&mut inner);
        Ok(())
    }

    /// Attach a descriptor stored while the instance was starting.
    fn start_bridge(&self, inner: &mut Inner, fd: RawFd) -> EngineResult<()> {
        let runtime = inner.runtime.clone().ok_or(EngineError::NotRunning)?;
        let device = attach_device(inner, &runtime, fd)?;
        let _guard = runtime.enter();
        self.spawn_bridge(inner, device)
    }

    /// Start pumps on `device`. Needs the runtime context.
    fn spawn_bridge(&self, inner: &mut Inner, device: TunDevice) -> EngineResult<()> {
        let transport = inner.transport.clone().ok_or(EngineError::NotRunning)?;
        let sender = self.shared.sender();
        let cycle = inner.cycle;
        let on_fatal: FatalHandler = Arc::new(move |message| {
            let _ = sender.send(Notice::Fatal { cycle, message });
        });
        let displaced = inner
            .bridge
            .replace(TunnelBridge::start(device, transport, on_fatal));
        if let Some(displaced) = displaced {
            // Raced with another attach; the newer pumps win.
            tokio::spawn(displaced.stop());
        }
        Ok(())
    }

    /// Create a room and host it. Returns the room code.
    pub fn create_room(&self, name: &str) -> EngineResult<String> {
        let name = name.to_string();
        let code = self.enter_room(move |client, config, candidates| -> RoomRequest {
            Box::pin(async move {
                client
                    .create_room(&name, config.room.network, candidates)
                    .await
            })
        })?;
        let mut inner = self.shared.lock();
        inner.room_result = Some(to_cstring(code.clone()));
        Ok(code)
    }

    /// Join a room by code.
    pub fn join_room(&self, code: &str) -> EngineResult<()> {
        let code = code.to_string();
        self.enter_room(move |client, _config, candidates| -> RoomRequest {
            Box::pin(async move { client.join_room(&code, candidates).await })
        })?;
        Ok(())
    }

    /// Leave the current room (if any), run `request` against the
    /// rendezvous service and install the resulting session.
    fn enter_room<F>(&self, request: F) -> EngineResult<String>
    where
        F: FnOnce(RendezvousClient, Arc<EngineConfig>, Vec<SocketAddr>) -> RoomRequest,
    {
        let (runtime, transport, config, cycle, old_signaling) = {
            let mut inner = self.shared.lock();
            if inner.state != InstanceState::Running {
                return self.fail(&mut inner, EngineError::NotRunning);
            }
            let (Some(runtime), Some(transport), Some(config)) = (
                inner.runtime.clone(),
                inner.transport.clone(),
                inner.config.clone(),
            ) else {
                return self.fail(&mut inner, EngineError::NotRunning);
            };
            transport.detach_session();
            let old_signaling = inner.signaling.take();
            if inner.session.take().is_some() {
                inner.session_epoch += 1;
                inner.message = "left room".to_string();
                self.shared.publish_info(&mut inner);
            }
            (runtime, transport, config, inner.cycle, old_signaling)
        };

        let client = RendezvousClient::new(&config);
        let candidates = transport.candidates();
        let request = request(client, config.clone(), candidates);
        let result = runtime.block_on(async move {
            if let Some(signaling) = old_signaling {
                signaling.stop().await;
            }
            request.await
        });

        let mut inner = self.shared.lock();
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => return self.fail(&mut inner, err),
        };
        if inner.cycle != cycle || inner.state != InstanceState::Running {
            return self.fail(&mut inner, EngineError::NotRunning);
        }

        let RoomEntry {
            params,
            peers,
            connection,
        } = entry;
        let session = Arc::new(Session::new(params, peers));
        let code = session.room_code().to_string();

        inner.session_epoch += 1;
        let epoch = inner.session_epoch;
        let sender = self.shared.sender();
        let on_event: EventHandler = Arc::new(move |event| {
            let _ = sender.send(Notice::Signaling { epoch, event });
        });

        let _guard = runtime.enter();
        transport.attach_session(session.clone());
        let monitor =
            connection.spawn_monitor(session.clone(), config.rendezvous_keepalive(), on_event);
        if let Some(stale) = inner.signaling.replace(monitor) {
            // Raced with another create/join; only the newest session stays.
            runtime.spawn(stale.stop());
        }
        inner.session = Some(session);
        inner.message = format!("in room {}", code);
        self.shared.publish_info(&mut inner);
        Ok(code)
    }
}
