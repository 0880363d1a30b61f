//! High-level console handle: status tracking, power transitions, and the
//! command scheduler that parks work across wake-from-standby.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ddp::{self, DeviceStatus};
use crate::endpoint::DdpEndpoint;
use crate::error::ConsoleError;
use crate::packets::{Button, TCP_PORT};
use crate::session::TcpSession;

/// Settle time after a successful login.
pub const DEFAULT_LOGIN_DELAY: Duration = Duration::from_secs(1);
/// Idle window after a heartbeat before the session is force-closed.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// One queued command; the slot holds at most one and the newest wins.
#[derive(Debug, Clone)]
pub enum PendingCommand {
    Login { pin: Option<String> },
    Standby,
    StartTitle {
        title_id: String,
        running_id: Option<String>,
    },
    RemoteControl { button: Button, hold_ms: u32 },
}

type StatusCallback = Box<dyn Fn(Option<&DeviceStatus>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ConsoleState {
    pub(crate) status: Option<DeviceStatus>,
    pub(crate) poll_count: u32,
    pub(crate) unreachable: bool,
    pub(crate) connected: bool,
    pub(crate) logged_in: bool,
    pub(crate) powering_on: bool,
    pub(crate) powering_off: bool,
    pub(crate) connecting: bool,
    pub(crate) pending: Option<PendingCommand>,
    pub(crate) session: Option<TcpSession>,
}

pub(crate) struct ConsoleShared {
    pub(crate) host: IpAddr,
    pub(crate) tcp_port: u16,
    pub(crate) credential: String,
    pub(crate) device_name: String,
    pub(crate) state: Mutex<ConsoleState>,
    callback: Mutex<Option<StatusCallback>>,
    endpoint: Mutex<Option<(DdpEndpoint, u64)>>,
    login_delay: Mutex<Duration>,
    heartbeat_timeout: Mutex<Duration>,
}

impl ConsoleShared {
    /// Applies one parsed status datagram. Returns whether the console just
    /// transitioned into standby, so the endpoint can arm its backoff.
    pub(crate) fn handle_status(self: &Arc<Self>, status: DeviceStatus) -> bool {
        let mut entered_standby = false;
        let mut close_session = None;
        let mut drain = false;
        let changed;
        {
            let mut state = self.state.lock();
            state.poll_count = 0;
            state.unreachable = false;
            changed = state.status.as_ref() != Some(&status);
            if status.is_standby() {
                // only an observed on→standby transition arms the endpoint
                // backoff; first sight of a sleeping console must not block
                // an immediate wakeup
                let was_on = state.status.as_ref().is_some_and(|s| !s.is_standby());
                if was_on {
                    entered_standby = true;
                }
                state.logged_in = false;
                state.connected = false;
                state.powering_off = false;
                close_session = state.session.take();
            } else if status.is_running()
                && state.powering_on
                && state.session.is_none()
                && !state.connecting
            {
                drain = true;
            }
            state.status = Some(status);
        }
        if let Some(session) = close_session {
            debug!(host = %self.host, "closing control session after standby transition");
            session.trigger_close();
        }
        if drain {
            let shared = self.clone();
            tokio::spawn(async move {
                if let Err(err) = connect_and_drain(shared).await {
                    warn!(%err, "connect after wakeup failed");
                }
            });
        }
        if changed {
            self.fire_callback();
        }
        entered_standby
    }

    /// Charges one unanswered poll; past the threshold the status is
    /// cleared and the callback fires exactly once.
    pub(crate) fn note_poll(&self, max_polls: u32) {
        let became_unreachable = {
            let mut state = self.state.lock();
            state.poll_count += 1;
            if state.poll_count > max_polls && !state.unreachable {
                state.unreachable = true;
                state.status = None;
                state.connected = false;
                state.logged_in = false;
                true
            } else {
                false
            }
        };
        if became_unreachable {
            warn!(host = %self.host, "console is unreachable");
            self.fire_callback();
        }
    }

    fn fire_callback(&self) {
        let status = self.state.lock().status.clone();
        let callback = self.callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(status.as_ref());
        }
    }

    pub(crate) async fn send_ddp(&self, message: String) -> Result<(), ConsoleError> {
        let endpoint = self.endpoint.lock().as_ref().map(|(ep, _)| ep.clone());
        match endpoint {
            Some(endpoint) => endpoint.send_to(self.host, &message).await?,
            None => ddp::send_datagram(self.host, ddp::DDP_PORT, &message).await?,
        }
        Ok(())
    }

    pub(crate) async fn send_launch(&self) -> Result<(), ConsoleError> {
        self.send_ddp(ddp::launch_message(&self.credential)).await
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    pub(crate) fn set_logged_in(&self, logged_in: bool) {
        let mut state = self.state.lock();
        state.logged_in = logged_in;
        if logged_in {
            state.connected = true;
        }
    }

    pub(crate) fn is_powering_on(&self) -> bool {
        self.state.lock().powering_on
    }

    pub(crate) fn set_powering_off(&self, powering_off: bool) {
        self.state.lock().powering_off = powering_off;
    }

    pub(crate) fn login_delay(&self) -> Duration {
        *self.login_delay.lock()
    }

    pub(crate) fn heartbeat_timeout(&self) -> Duration {
        *self.heartbeat_timeout.lock()
    }

    /// Clears connection flags once a session finishes closing.
    pub(crate) fn drop_session(&self, session: &TcpSession) {
        let mut state = self.state.lock();
        let is_current = state
            .session
            .as_ref()
            .is_some_and(|current| current.same(session));
        if is_current || state.session.is_none() {
            state.session = None;
            state.connected = false;
            state.logged_in = false;
        }
    }
}

/// Connects the control session, logs in, and runs the queued command.
///
/// The pending slot is popped only after login succeeds, so a command parked
/// across a wakeup executes exactly once on the fresh session.
pub(crate) async fn connect_and_drain(shared: Arc<ConsoleShared>) -> Result<(), ConsoleError> {
    {
        let mut state = shared.state.lock();
        if state.session.is_some() || state.connecting {
            return Ok(());
        }
        state.connecting = true;
    }
    let session = match TcpSession::open(shared.clone()).await {
        Ok(session) => session,
        Err(err) => {
            warn!(host = %shared.host, %err, "control connect failed");
            let mut state = shared.state.lock();
            state.connecting = false;
            state.connected = false;
            state.logged_in = false;
            state.powering_on = false;
            return Err(err);
        }
    };
    {
        let mut state = shared.state.lock();
        state.connecting = false;
        state.connected = true;
        state.session = Some(session.clone());
    }
    let login = session.login(None).await;
    shared.state.lock().powering_on = false;
    login?;
    let pending = shared.state.lock().pending.take();
    if let Some(command) = pending {
        debug!(host = %shared.host, "running queued command");
        run_command(&session, command).await?;
    }
    Ok(())
}

pub(crate) async fn run_command(
    session: &TcpSession,
    command: PendingCommand,
) -> Result<(), ConsoleError> {
    match command {
        PendingCommand::Login { pin } => session.login(pin.as_deref()).await,
        PendingCommand::Standby => session.standby().await,
        PendingCommand::StartTitle {
            title_id,
            running_id,
        } => session.start_title(&title_id, running_id.as_deref()).await,
        PendingCommand::RemoteControl { button, hold_ms } => {
            session.remote_control(button, hold_ms).await
        }
    }
}

enum Route {
    Run(TcpSession),
    Wake,
    Connect,
    NotReady,
}

/// One PS4 on the network.
///
/// Cheap to clone; all clones share the same state. Attach the console to a
/// [`DdpEndpoint`] for status polling and wake-from-standby handling.
#[derive(Clone)]
pub struct Console {
    shared: Arc<ConsoleShared>,
}

impl Console {
    /// `port` overrides the control port, default 997.
    pub fn new(
        host: IpAddr,
        credential: &str,
        device_name: Option<&str>,
        port: Option<u16>,
    ) -> Self {
        Self {
            shared: Arc::new(ConsoleShared {
                host,
                tcp_port: port.unwrap_or(TCP_PORT),
                credential: credential.to_string(),
                device_name: device_name
                    .unwrap_or(crate::credential::DEFAULT_DEVICE_NAME)
                    .to_string(),
                state: Mutex::new(ConsoleState::default()),
                callback: Mutex::new(None),
                endpoint: Mutex::new(None),
                login_delay: Mutex::new(DEFAULT_LOGIN_DELAY),
                heartbeat_timeout: Mutex::new(DEFAULT_HEARTBEAT_TIMEOUT),
            }),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.shared.host
    }

    /// Registers this console as an observer on the shared endpoint.
    pub fn attach(&self, endpoint: &DdpEndpoint) {
        self.detach();
        let id = endpoint.add_observer(&self.shared);
        *self.shared.endpoint.lock() = Some((endpoint.clone(), id));
    }

    pub fn detach(&self) {
        if let Some((endpoint, id)) = self.shared.endpoint.lock().take() {
            endpoint.remove_observer(self.shared.host, id);
        }
    }

    /// Sends one SRCH poll through the attached endpoint.
    pub async fn poll(&self) -> Result<(), ConsoleError> {
        let endpoint = self.shared.endpoint.lock().as_ref().map(|(ep, _)| ep.clone());
        let endpoint = endpoint.ok_or(ConsoleError::NotReady("no ddp endpoint attached"))?;
        endpoint.poll(&self.shared).await?;
        Ok(())
    }

    /// The callback receives a status snapshot on every change and must not
    /// block; it runs on the endpoint's receive task.
    pub fn set_status_callback(
        &self,
        callback: impl Fn(Option<&DeviceStatus>) + Send + Sync + 'static,
    ) {
        *self.shared.callback.lock() = Some(Box::new(callback));
    }

    pub fn clear_status_callback(&self) {
        *self.shared.callback.lock() = None;
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *self.shared.login_delay.lock() = delay;
    }

    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        *self.shared.heartbeat_timeout.lock() = timeout;
    }

    /// Sends a WAKEUP datagram and flags the power-on transition.
    pub async fn wakeup(&self) -> Result<(), ConsoleError> {
        {
            let mut state = self.shared.state.lock();
            state.powering_on = true;
            state.powering_off = false;
        }
        info!(host = %self.shared.host, "sending wakeup");
        self.shared
            .send_ddp(ddp::wakeup_message(&self.shared.credential))
            .await
    }

    /// Opens the control session and logs in without queueing a command.
    pub async fn connect(&self) -> Result<(), ConsoleError> {
        self.ensure_status().await?;
        if self.is_standby() {
            return Err(ConsoleError::NotReady("console is in standby"));
        }
        if !self.is_available() {
            return Err(ConsoleError::NotReady("console is unreachable"));
        }
        if self.shared.state.lock().powering_off {
            return Err(ConsoleError::NotReady("console is powering off"));
        }
        connect_and_drain(self.shared.clone()).await
    }

    pub async fn login(&self, pin: Option<&str>) -> Result<(), ConsoleError> {
        self.submit(PendingCommand::Login {
            pin: pin.map(str::to_string),
        })
        .await
    }

    pub async fn standby(&self) -> Result<(), ConsoleError> {
        self.submit(PendingCommand::Standby).await
    }

    /// Starts a title; `running_id` defaults to whatever the last status
    /// reported as running, which arms the auto-confirm press.
    pub async fn start_title(
        &self,
        title_id: &str,
        running_id: Option<&str>,
    ) -> Result<(), ConsoleError> {
        let running_id = running_id
            .map(str::to_string)
            .or_else(|| self.running_app_titleid());
        self.submit(PendingCommand::StartTitle {
            title_id: title_id.to_string(),
            running_id,
        })
        .await
    }

    /// Presses one button; `hold_ms` only matters for the PS button.
    pub async fn remote_control(
        &self,
        button_name: &str,
        hold_ms: u32,
    ) -> Result<(), ConsoleError> {
        let button = Button::from_name(button_name)
            .ok_or_else(|| ConsoleError::UnknownButton(button_name.to_string()))?;
        self.submit(PendingCommand::RemoteControl { button, hold_ms })
            .await
    }

    /// Closes the control session and drops any queued command.
    pub async fn close(&self) {
        let session = {
            let mut state = self.shared.state.lock();
            state.pending = None;
            state.session.clone()
        };
        if let Some(session) = session {
            session.close().await;
        }
    }

    async fn ensure_status(&self) -> Result<(), ConsoleError> {
        if self.shared.state.lock().status.is_some() {
            return Ok(());
        }
        if let Some(status) = ddp::get_status(self.shared.host).await? {
            self.shared.handle_status(status);
        }
        Ok(())
    }

    /// Routes a command: straight to the live session, or parked in the
    /// one-slot queue behind a wakeup or a fresh connect.
    async fn submit(&self, command: PendingCommand) -> Result<(), ConsoleError> {
        self.ensure_status().await?;
        let route = {
            let state = self.shared.state.lock();
            if let Some(session) = state.session.clone() {
                Route::Run(session)
            } else if state.powering_off {
                // the console is about to report standby; do not reconnect
                Route::NotReady
            } else {
                match state.status.as_ref() {
                    Some(status) if status.is_standby() => Route::Wake,
                    Some(status) if status.is_running() => Route::Connect,
                    _ => Route::NotReady,
                }
            }
        };
        match route {
            Route::Run(session) => run_command(&session, command).await,
            Route::Wake => {
                info!(host = %self.shared.host, "console in standby, queueing command");
                self.shared.state.lock().pending = Some(command);
                self.wakeup().await
            }
            Route::Connect => {
                self.shared.state.lock().pending = Some(command);
                connect_and_drain(self.shared.clone()).await
            }
            Route::NotReady => Err(ConsoleError::NotReady("console is unreachable or off")),
        }
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        self.shared.state.lock().status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .status
            .as_ref()
            .is_some_and(DeviceStatus::is_running)
    }

    pub fn is_standby(&self) -> bool {
        self.shared
            .state
            .lock()
            .status
            .as_ref()
            .is_some_and(DeviceStatus::is_standby)
    }

    pub fn is_available(&self) -> bool {
        self.shared.state.lock().status.is_some()
    }

    pub fn is_unreachable(&self) -> bool {
        self.shared.state.lock().unreachable
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.state.lock().logged_in
    }

    pub fn running_app_titleid(&self) -> Option<String> {
        self.status_field(DeviceStatus::running_app_titleid)
    }

    pub fn running_app_name(&self) -> Option<String> {
        self.status_field(DeviceStatus::running_app_name)
    }

    pub fn host_name(&self) -> Option<String> {
        self.status_field(DeviceStatus::host_name)
    }

    pub fn host_id(&self) -> Option<String> {
        self.status_field(DeviceStatus::host_id)
    }

    pub fn system_version(&self) -> Option<String> {
        self.status_field(DeviceStatus::system_version)
    }

    fn status_field(&self, field: impl Fn(&DeviceStatus) -> Option<&str>) -> Option<String> {
        self.shared
            .state
            .lock()
            .status
            .as_ref()
            .and_then(|status| field(status).map(str::to_string))
    }
}
