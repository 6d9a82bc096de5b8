//! The client session layer.
//!
//! Services embed a [`FluidSettings`] session to read, write and watch
//! settings. The session owns a permanent connection to the communicator
//! bus: it registers under the caller's service name, re-sends the watch
//! set whenever the fluid-settings service comes up, translates replies
//! and pushes into [`SettingEvent`]s, arms a per-request timeout for every
//! explicit call, and overlays pushed values onto the caller's
//! [`LocalOptions`].
//!
//! The handle is cheap to clone and all methods are non-blocking; events
//! arrive on the channel returned by [`FluidSettings::connect`].

use crate::options::{LocalOptions, OverlayResult};
use crate::SettingsError;
use fluid_settings_model::{commands, name, Address, Message, Priority};
use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, warn};

const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Bounds on the per-request timeout.
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

static CLI_SERVICE_NAME: OnceLock<String> = OnceLock::new();

/// The process-wide service name used by ad-hoc clients:
/// `fluid_settings_cli<pid>`. Initialized on first use.
pub fn cli_service_name() -> &'static str {
    CLI_SERVICE_NAME.get_or_init(|| format!("fluid_settings_cli{}", std::process::id()))
}

/// What a [`SettingEvent::Changed`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingStatus {
    /// A stored value arrived (reply to a GET).
    Value,
    /// The schema default arrived.
    Default,
    /// A watched value changed (or was replayed on registration).
    NewValue,
    /// The setting has no value and no default.
    Undefined,
    /// A DELETE succeeded.
    Deleted,
    /// A PUT succeeded.
    Updated,
    /// No reply arrived within the request timeout.
    Timeout,
    /// The fluid-settings service is not reachable.
    Unavailable,
    /// The LISTEN registration was accepted.
    Registered,
    /// Every initial value of the watch set has been delivered.
    Ready,
}

/// Events delivered to the embedding service.
#[derive(Debug, Clone)]
pub enum SettingEvent {
    Changed {
        status: SettingStatus,
        name: String,
        value: String,
    },
    /// Reply to a LIST: every declared setting name.
    Options(Vec<String>),
    /// A bus STATUS transition for some service.
    ServiceStatus { service: String, up: bool },
    /// The daemon rejected a request.
    Failed { command: String, message: String },
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Communicator bus `address:port`.
    pub bus_address: String,
    /// Name of the machine this service runs on.
    pub server_name: String,
    /// Service name to register on the bus.
    pub service_name: String,
    /// Per-request timeout, clamped to 1 s .. 1 h.
    pub timeout: Duration,
    /// Pause before reconnecting to the bus.
    pub reconnect_pause: Duration,
}

impl SessionConfig {
    pub fn new(bus_address: impl Into<String>, service_name: impl Into<String>) -> Self {
        // FLUID_SETTINGS_TIMEOUT overrides the default request timeout
        let timeout = std::env::var("FLUID_SETTINGS_TIMEOUT")
            .ok()
            .and_then(|v| humantime::parse_duration(&v).ok())
            .unwrap_or(DEFAULT_TIMEOUT);
        Self {
            bus_address: bus_address.into(),
            server_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            service_name: service_name.into(),
            timeout,
            reconnect_pause: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

enum SessionCmd {
    GetValue(String),
    GetAllValues(String),
    GetWithPriority(String, Priority),
    GetDefault(String),
    Put {
        name: String,
        value: String,
        priority: Option<Priority>,
    },
    Delete {
        name: String,
        priority: Option<Priority>,
    },
    ListOptions,
    AddWatch(String),
    Forget(String),
    Close,
}

/// Handle to a running session.
#[derive(Clone)]
pub struct FluidSettings {
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    service_name: String,
}

impl FluidSettings {
    /// Start a session. Options flagged `dynamic` in `options` are watched
    /// automatically. Returns the handle and the event channel.
    pub fn connect(
        config: SessionConfig,
        options: LocalOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SettingEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let service_name = config.service_name.clone();
        let mut watches = BTreeSet::new();
        for dynamic in options.dynamic_names() {
            watches.insert(qualified(&service_name, &dynamic));
        }

        let task = SessionTask {
            config: SessionConfig {
                timeout: config.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT),
                ..config
            },
            cmd_rx,
            event_tx,
            timer_tx,
            timer_rx,
            watches,
            options,
            service_up: false,
            ready_sent: false,
            pending: HashMap::new(),
            next_timer: 0,
        };
        tokio::spawn(task.run());

        (
            Self {
                cmd_tx,
                service_name,
            },
            event_rx,
        )
    }

    fn send(&self, cmd: SessionCmd) -> Result<(), SettingsError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| SettingsError::SessionClosed)
    }

    /// Ask for the current value of a setting.
    pub fn get_value(&self, name: &str) -> Result<(), SettingsError> {
        self.send(SessionCmd::GetValue(self.qualify(name)))
    }

    /// Ask for every stored value of a setting.
    pub fn get_all_values(&self, name: &str) -> Result<(), SettingsError> {
        self.send(SessionCmd::GetAllValues(self.qualify(name)))
    }

    /// Ask for the value stored at one specific priority.
    pub fn get_value_with_priority(
        &self,
        name: &str,
        priority: Priority,
    ) -> Result<(), SettingsError> {
        self.send(SessionCmd::GetWithPriority(self.qualify(name), priority))
    }

    /// Ask for the schema default of a setting.
    pub fn get_default_value(&self, name: &str) -> Result<(), SettingsError> {
        self.send(SessionCmd::GetDefault(self.qualify(name)))
    }

    /// Store a value.
    pub fn put(
        &self,
        name: &str,
        value: &str,
        priority: Option<Priority>,
    ) -> Result<(), SettingsError> {
        self.send(SessionCmd::Put {
            name: self.qualify(name),
            value: value.to_string(),
            priority,
        })
    }

    /// Delete the value stored at a priority (administrator by default).
    pub fn delete(&self, name: &str, priority: Option<Priority>) -> Result<(), SettingsError> {
        self.send(SessionCmd::Delete {
            name: self.qualify(name),
            priority,
        })
    }

    /// Ask for the list of every declared setting name.
    pub fn list_options(&self) -> Result<(), SettingsError> {
        self.send(SessionCmd::ListOptions)
    }

    /// Watch a setting. Unqualified names are namespaced with our own
    /// service name.
    pub fn add_watch(&self, name: &str) -> Result<(), SettingsError> {
        self.send(SessionCmd::AddWatch(self.qualify(name)))
    }

    /// Stop watching a setting.
    pub fn forget(&self, name: &str) -> Result<(), SettingsError> {
        self.send(SessionCmd::Forget(self.qualify(name)))
    }

    /// Shut the session down.
    pub fn close(&self) -> Result<(), SettingsError> {
        self.send(SessionCmd::Close)
    }

    fn qualify(&self, watch: &str) -> String {
        qualified(&self.service_name, watch)
    }
}

fn qualified(service: &str, watch: &str) -> String {
    name::canonicalize(&name::qualify(service, watch))
}

type BusConnection = Framed<TcpStream, LinesCodec>;

struct SessionTask {
    config: SessionConfig,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    event_tx: mpsc::UnboundedSender<SettingEvent>,
    timer_tx: mpsc::UnboundedSender<(String, u64)>,
    timer_rx: mpsc::UnboundedReceiver<(String, u64)>,
    watches: BTreeSet<String>,
    options: LocalOptions,
    service_up: bool,
    ready_sent: bool,
    pending: HashMap<String, u64>,
    next_timer: u64,
}

impl SessionTask {
    async fn run(mut self) {
        'session: loop {
            let stream = match TcpStream::connect(&self.config.bus_address).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("cannot reach the communicator bus: {e}");
                    if !self.pause().await {
                        break 'session;
                    }
                    continue 'session;
                }
            };
            let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

            // REGISTER is for the bus itself, so no destination address
            let mut register = Message::new(commands::REGISTER)
                .with_param("service", &self.config.service_name)
                .with_param("version", "1");
            register.from = Some(Address::new(
                &self.config.server_name,
                &self.config.service_name,
            ));
            if conn.send(register.to_line()).await.is_err() {
                if !self.pause().await {
                    break 'session;
                }
                continue 'session;
            }

            loop {
                tokio::select! {
                    line = conn.next() => match line {
                        Some(Ok(line)) => self.handle_line(&mut conn, &line).await,
                        Some(Err(e)) => {
                            warn!("communicator connection error: {e}");
                            break;
                        }
                        None => {
                            debug!("communicator connection closed");
                            break;
                        }
                    },
                    cmd = self.cmd_rx.recv() => match cmd {
                        None | Some(SessionCmd::Close) => break 'session,
                        Some(cmd) => self.handle_cmd(Some(&mut conn), cmd).await,
                    },
                    Some((name, generation)) = self.timer_rx.recv() => {
                        self.handle_timer(name, generation);
                    }
                }
            }

            self.service_up = false;
            if !self.pause().await {
                break 'session;
            }
        }
    }

    /// Wait out the reconnect pause while still serving commands and
    /// timers. Returns false when the session should end.
    async fn pause(&mut self) -> bool {
        let pause = tokio::time::sleep(self.config.reconnect_pause);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(SessionCmd::Close) => return false,
                    Some(cmd) => self.handle_cmd(None, cmd).await,
                },
                Some((name, generation)) = self.timer_rx.recv() => {
                    self.handle_timer(name, generation);
                }
            }
        }
    }

    fn outgoing(&self, command: &str) -> Message {
        let mut msg = Message::new(command);
        msg.from = Some(Address::new(
            &self.config.server_name,
            &self.config.service_name,
        ));
        msg.to = Some(Address::service("fluid_settings"));
        msg
    }

    async fn send(&mut self, conn: Option<&mut BusConnection>, msg: Message) {
        let Some(conn) = conn else {
            // disconnected; the armed timer reports the loss
            return;
        };
        if let Err(e) = conn.send(msg.to_line()).await {
            warn!("cannot send {} to the bus: {e}", msg.command);
        }
    }

    async fn handle_cmd(&mut self, conn: Option<&mut BusConnection>, cmd: SessionCmd) {
        match cmd {
            SessionCmd::GetValue(name) => {
                self.arm_timer(&name);
                let msg = self.outgoing(commands::GET).with_param("name", &name);
                self.send(conn, msg).await;
            }
            SessionCmd::GetAllValues(name) => {
                self.arm_timer(&name);
                let msg = self
                    .outgoing(commands::GET)
                    .with_param("name", &name)
                    .with_param("all", "true");
                self.send(conn, msg).await;
            }
            SessionCmd::GetWithPriority(name, priority) => {
                self.arm_timer(&name);
                let msg = self
                    .outgoing(commands::GET)
                    .with_param("name", &name)
                    .with_param("priority", priority.to_string());
                self.send(conn, msg).await;
            }
            SessionCmd::GetDefault(name) => {
                self.arm_timer(&name);
                let msg = self
                    .outgoing(commands::GET)
                    .with_param("name", &name)
                    .with_param("default_value", "true");
                self.send(conn, msg).await;
            }
            SessionCmd::Put {
                name,
                value,
                priority,
            } => {
                self.arm_timer(&name);
                let mut msg = self
                    .outgoing(commands::PUT)
                    .with_param("name", &name)
                    .with_param("value", &value);
                if let Some(priority) = priority {
                    msg.set_param("priority", priority.to_string());
                }
                self.send(conn, msg).await;
            }
            SessionCmd::Delete { name, priority } => {
                self.arm_timer(&name);
                let mut msg = self.outgoing(commands::DELETE).with_param("name", &name);
                if let Some(priority) = priority {
                    msg.set_param("priority", priority.to_string());
                }
                self.send(conn, msg).await;
            }
            SessionCmd::ListOptions => {
                self.arm_timer("");
                let msg = self.outgoing(commands::LIST);
                self.send(conn, msg).await;
            }
            SessionCmd::AddWatch(name) => {
                if self.watches.insert(name.clone()) && self.service_up {
                    let msg = self.outgoing(commands::LISTEN).with_param("names", &name);
                    self.send(conn, msg).await;
                }
            }
            SessionCmd::Forget(name) => {
                if self.watches.remove(&name) && self.service_up {
                    let msg = self.outgoing(commands::FORGET).with_param("names", &name);
                    self.send(conn, msg).await;
                }
            }
            // Close never reaches here; the select loops break on it first
            SessionCmd::Close => {}
        }
    }

    async fn handle_line(&mut self, conn: &mut BusConnection, line: &str) {
        let msg = match Message::from_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable message from the bus: {e}");
                return;
            }
        };

        match msg.command.as_str() {
            commands::VALUE => {
                if let (Some(name), Some(value)) = (msg.param("name"), msg.param("value")) {
                    self.cancel_timer(name);
                    self.emit_changed(SettingStatus::Value, name, value);
                } else {
                    warn!("VALUE reply missing its \"name\" or \"value\" parameter");
                }
            }
            commands::ALL_VALUES => {
                if let (Some(name), Some(values)) = (msg.param("name"), msg.param("values")) {
                    self.cancel_timer(name);
                    self.emit_changed(SettingStatus::Value, name, values);
                } else {
                    warn!("ALL_VALUES reply missing its \"name\" or \"values\" parameter");
                }
            }
            commands::DEFAULT_VALUE => {
                if let (Some(name), Some(value)) = (msg.param("name"), msg.param("value")) {
                    self.cancel_timer(name);
                    self.emit_changed(SettingStatus::Default, name, value);
                } else {
                    warn!("DEFAULT_VALUE reply missing its \"name\" or \"value\" parameter");
                }
            }
            commands::NOT_SET => {
                if let Some(name) = msg.param("name") {
                    self.cancel_timer(name);
                    self.emit_changed(SettingStatus::Undefined, name, "");
                }
            }
            commands::UPDATED => {
                if let Some(name) = msg.param("name") {
                    self.cancel_timer(name);
                    self.emit_changed(
                        SettingStatus::Updated,
                        name,
                        msg.param("reason").unwrap_or_default(),
                    );
                } else {
                    warn!("UPDATED reply missing its \"name\" parameter");
                }
            }
            commands::DELETED => {
                if let Some(name) = msg.param("name") {
                    self.cancel_timer(name);
                    self.emit_changed(SettingStatus::Deleted, name, "");
                } else {
                    warn!("DELETED reply missing its \"name\" parameter");
                }
            }
            commands::OPTIONS => {
                self.cancel_timer("");
                let options = msg
                    .param("options")
                    .unwrap_or_default()
                    .split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect();
                self.emit(SettingEvent::Options(options));
            }
            commands::REGISTERED => {
                if let Some(note) = msg.param("message") {
                    warn!("listen registration came back with a note: {note}");
                }
                self.emit_changed(SettingStatus::Registered, "", "");
            }
            commands::FLUID_READY => {
                self.fire_ready();
            }
            commands::VALUE_UPDATED => {
                self.handle_value_updated(&msg);
            }
            commands::INVALID => {
                let command = msg.param("command").unwrap_or_default().to_string();
                let message = msg.param("message").unwrap_or_default().to_string();
                error!("fluid-settings rejected {command}: {message}");
                if let Some(name) = msg.param("name") {
                    self.cancel_timer(name);
                }
                self.emit(SettingEvent::Failed { command, message });
            }
            commands::STATUS => {
                self.handle_status(conn, &msg).await;
            }
            commands::SERVICE_UNAVAILABLE => {
                if msg.param("destination_service") == Some("fluid_settings") {
                    warn!("the fluid-settings service is currently unavailable");
                    self.emit_changed(SettingStatus::Unavailable, "", "");
                }
            }
            commands::UNKNOWN => {
                debug!("the bus did not recognize {:?}", msg.param("command"));
            }
            other => {
                debug!("ignoring unexpected bus command {other}");
            }
        }
    }

    fn handle_value_updated(&mut self, msg: &Message) {
        let Some(setting) = msg.param("name") else {
            warn!("VALUE_UPDATED push missing its \"name\" parameter");
            return;
        };
        match msg.param("value") {
            Some(value) => {
                self.overlay(setting, value);
                self.emit_changed(SettingStatus::NewValue, setting, value);
            }
            None => {
                self.emit_changed(SettingStatus::Undefined, setting, "");
            }
        }
    }

    /// Apply a pushed value to our own local options.
    fn overlay(&mut self, setting: &str, value: &str) {
        let own_prefix = format!("{}::", name::canonicalize(&self.config.service_name));
        let Some(local) = setting.strip_prefix(&own_prefix) else {
            return; // a cross-service watch; nothing local to update
        };
        match self.options.overlay(local, value) {
            OverlayResult::Applied => {
                debug!("option {local} now {value:?} (from fluid-settings)");
            }
            OverlayResult::NotDynamic => {
                warn!("fluid-settings pushed a value for {local}, which is not a dynamic option");
            }
            OverlayResult::Pinned => {
                debug!("option {local} keeps its command-line value");
            }
            OverlayResult::Unknown => {}
        }
    }

    async fn handle_status(&mut self, conn: &mut BusConnection, msg: &Message) {
        let (Some(service), Some(status)) = (msg.param("service"), msg.param("status")) else {
            return;
        };
        let up = status == "up";
        if service == "fluid_settings" {
            let was_up = self.service_up;
            self.service_up = up;
            if up && !was_up {
                if self.watches.is_empty() {
                    self.fire_ready();
                } else {
                    let names = self
                        .watches
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(",");
                    let listen = self.outgoing(commands::LISTEN).with_param("names", names);
                    if let Err(e) = conn.send(listen.to_line()).await {
                        warn!("cannot send LISTEN to the bus: {e}");
                    }
                }
            }
        }
        self.emit(SettingEvent::ServiceStatus {
            service: service.to_string(),
            up,
        });
    }

    fn fire_ready(&mut self) {
        if !self.ready_sent {
            self.ready_sent = true;
            self.emit_changed(SettingStatus::Ready, "", "");
        }
    }

    fn arm_timer(&mut self, name: &str) {
        self.next_timer += 1;
        let generation = self.next_timer;
        self.pending.insert(name.to_string(), generation);
        let tx = self.timer_tx.clone();
        let delay = self.config.timeout;
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((name, generation));
        });
    }

    fn cancel_timer(&mut self, name: &str) {
        self.pending.remove(name);
    }

    fn handle_timer(&mut self, name: String, generation: u64) {
        if self.pending.get(&name) == Some(&generation) {
            self.pending.remove(&name);
            self.emit_changed(SettingStatus::Timeout, &name, "");
        }
    }

    fn emit_changed(&self, status: SettingStatus, name: &str, value: &str) {
        self.emit(SettingEvent::Changed {
            status,
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    fn emit(&self, event: SettingEvent) {
        let _ = self.event_tx.send(event);
    }
}
