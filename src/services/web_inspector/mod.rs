//! WebKit remote inspector driver
//!
//! Automates Mobile Safari over `com.apple.webinspector`. Every message is
//! a plist with a `__selector` naming the RPC and an `__argument`
//! dictionary carrying the connection identifier. The session walks
//! `Created -> Initialized -> Ready -> Connected`; a hard error or the
//! start timeout parks it in `Failed`, where every request answers with
//! the failure.
//!
//! The driver is an actor: a reader task turns the socket into a message
//! stream, and the state machine task owns the write half, the pending
//! reply table and the queue of calls that arrived before `Connected`.
//!
//! Dropping the [`WebInspector`] handle tears the session down; handing
//! the session to another owner is moving the handle.

mod automation;

pub use automation::Page;

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
};

use crate::{util::plist_to_xml_bytes, DeviceConnection, DeviceService, DeviceStream, MuxdevError};

const SAFARI_BUNDLE: &str = "com.apple.mobilesafari";
const AUTOMATION_AVAILABLE: &str = "WIRAutomationAvailabilityAvailable";
const AUTOMATION_PAGE_TYPE: &str = "WIRTypeAutomation";

/// How long the session may take to reach `Connected`
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver handle for one inspector session
///
/// Cheap to use from any task; all socket work happens in the background
/// actor, which stops when this handle drops.
pub struct WebInspector {
    commands: mpsc::UnboundedSender<Command>,
    session_id: String,
    _tasks: [AbortOnDrop; 2],
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl DeviceService for WebInspector {
    fn service_name() -> &'static str {
        "com.apple.webinspector"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Self::start(connection, DEFAULT_SESSION_TIMEOUT)
    }
}

impl WebInspector {
    /// Spawns the session actor over a dialed inspector stream
    ///
    /// # Arguments
    /// * `connection` - A stream to `com.apple.webinspector`, TLS already
    ///   negotiated when the service asked for it
    /// * `session_timeout` - Deadline for reaching `Connected`
    pub fn start(
        connection: DeviceConnection,
        session_timeout: Duration,
    ) -> Result<Self, MuxdevError> {
        let session_id = uuid::Uuid::new_v4().to_string().to_uppercase();

        let stream = connection.into_stream()?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(reader_loop(read_half, message_tx));
        let actor = Inspector::new(write_half, session_id.clone());
        let deadline = tokio::time::Instant::now() + session_timeout;
        let actor = tokio::spawn(actor.run(command_rx, message_rx, deadline));

        Ok(Self {
            commands: command_tx,
            session_id,
            _tasks: [AbortOnDrop(actor), AbortOnDrop(reader)],
        })
    }

    /// The uppercase UUID identifying this session on the wire
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits until the session is `Connected`
    ///
    /// Returns immediately once the session is connected or failed;
    /// otherwise blocks until one of the two happens or `timeout` elapses.
    pub async fn wait_for_session(&self, timeout: Duration) -> Result<(), MuxdevError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::WaitForSession { reply: tx })
            .map_err(|_| MuxdevError::SessionFailed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(MuxdevError::SessionFailed),
            Err(_) => Err(MuxdevError::Timeout),
        }
    }

    /// Issues one Automation RPC and waits for its reply
    pub(crate) async fn automation_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, MuxdevError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Automation {
                method: method.to_owned(),
                params,
                reply: tx,
            })
            .map_err(|_| MuxdevError::SessionFailed)?;
        rx.await.map_err(|_| MuxdevError::SessionFailed)?
    }
}

impl std::fmt::Debug for WebInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebInspector")
            .field("session_id", &self.session_id)
            .finish()
    }
}

enum Command {
    Automation {
        method: String,
        params: serde_json::Value,
        reply: oneshot::Sender<Result<serde_json::Value, MuxdevError>>,
    },
    WaitForSession {
        reply: oneshot::Sender<Result<(), MuxdevError>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Created,
    Initialized,
    Ready,
    Connected,
    Failed,
}

#[derive(Clone, Copy, Debug)]
enum Failure {
    NoAutomation,
    Timeout,
    Disconnected,
}

impl Failure {
    fn to_error(self) -> MuxdevError {
        match self {
            Self::NoAutomation => MuxdevError::NoAutomation,
            Self::Timeout => MuxdevError::Timeout,
            Self::Disconnected => MuxdevError::SessionFailed,
        }
    }
}

#[derive(Clone, Debug)]
struct SafariApp {
    app_id: String,
    ready: bool,
}

/// The state machine task
struct Inspector {
    writer: WriteHalf<DeviceStream>,
    session_id: String,
    state: SessionState,
    failure: Option<Failure>,
    automation_available: bool,
    app: Option<SafariApp>,
    page_id: Option<u64>,
    next_request_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<serde_json::Value, MuxdevError>>>,
    queued: Vec<Command>,
    waiters: Vec<oneshot::Sender<Result<(), MuxdevError>>>,
}

impl Inspector {
    fn new(writer: WriteHalf<DeviceStream>, session_id: String) -> Self {
        Self {
            writer,
            session_id,
            state: SessionState::Created,
            failure: None,
            automation_available: false,
            app: None,
            page_id: None,
            next_request_id: 0,
            pending: HashMap::new(),
            queued: Vec::new(),
            waiters: Vec::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut messages: mpsc::UnboundedReceiver<plist::Dictionary>,
        deadline: tokio::time::Instant,
    ) {
        if let Err(e) = self.send_selector("_rpc_reportIdentifier:", plist::Dictionary::new()).await
        {
            warn!("Could not report identifier: {e}");
            self.fail(Failure::Disconnected);
        }
        let mut reader_gone = false;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Every handle dropped: tear down
                    None => return,
                },
                msg = messages.recv(), if !reader_gone && self.state != SessionState::Failed => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            reader_gone = true;
                            self.fail(Failure::Disconnected);
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline),
                    if !matches!(self.state, SessionState::Connected | SessionState::Failed) =>
                {
                    warn!("Inspector session did not connect before the deadline");
                    self.fail(Failure::Timeout);
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match self.state {
            SessionState::Connected => match cmd {
                Command::Automation {
                    method,
                    params,
                    reply,
                } => self.dispatch_automation(method, params, reply).await,
                Command::WaitForSession { reply } => {
                    let _ = reply.send(Ok(()));
                }
            },
            SessionState::Failed => {
                let e = self.failure_error();
                match cmd {
                    Command::Automation { reply, .. } => {
                        let _ = reply.send(Err(e));
                    }
                    Command::WaitForSession { reply } => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            // Not connected yet: park the call until the state settles
            _ => match cmd {
                Command::WaitForSession { reply } => self.waiters.push(reply),
                cmd => self.queued.push(cmd),
            },
        }
    }

    async fn handle_message(&mut self, msg: plist::Dictionary) {
        let selector = match msg.get("__selector").and_then(|x| x.as_string()) {
            Some(s) => s.to_owned(),
            None => {
                debug!("Inspector message without __selector");
                return;
            }
        };
        let argument = match msg.get("__argument").and_then(|x| x.as_dictionary()) {
            Some(a) => a.to_owned(),
            None => plist::Dictionary::new(),
        };
        debug!("Inspector <- {selector}");

        match selector.as_str() {
            "_rpc_reportCurrentState:" => {
                match argument
                    .get("WIRAutomationAvailabilityKey")
                    .and_then(|x| x.as_string())
                {
                    Some(AUTOMATION_AVAILABLE) => self.automation_available = true,
                    other => {
                        warn!("Automation unavailable: {other:?}");
                        self.fail(Failure::NoAutomation);
                    }
                }
            }
            "_rpc_reportConnectedApplicationList:" => {
                let apps = match argument
                    .get("WIRApplicationDictionaryKey")
                    .and_then(|x| x.as_dictionary())
                {
                    Some(a) => a,
                    None => return,
                };
                for (app_id, entry) in apps {
                    if let Some(entry) = entry.as_dictionary() {
                        if bundle_identifier(entry) == Some(SAFARI_BUNDLE) {
                            self.app = Some(SafariApp {
                                app_id: app_id.clone(),
                                ready: is_ready(entry),
                            });
                            if self.state == SessionState::Created {
                                self.state = SessionState::Initialized;
                            }
                        }
                    }
                }
            }
            "_rpc_applicationConnected:" | "_rpc_applicationUpdated:" => {
                if bundle_identifier(&argument) != Some(SAFARI_BUNDLE) {
                    return;
                }
                let app_id = match argument
                    .get("WIRApplicationIdentifierKey")
                    .and_then(|x| x.as_string())
                {
                    Some(id) => id.to_owned(),
                    None => return,
                };
                let ready = is_ready(&argument);
                self.app = Some(SafariApp {
                    app_id,
                    ready,
                });
                if self.state == SessionState::Initialized && self.automation_available && ready {
                    self.enter_ready().await;
                }
            }
            "_rpc_applicationSentListing:" => self.handle_listing(argument).await,
            "_rpc_applicationDisconnected:" => {
                if bundle_identifier(&argument) == Some(SAFARI_BUNDLE) {
                    self.app = None;
                    self.page_id = None;
                }
            }
            "_rpc_applicationSentData:" => self.handle_sent_data(argument),
            other => debug!("Ignoring inspector selector {other}"),
        }
    }

    /// Page listings drive the final hop: pick the automation page that
    /// carries our session id, ask for its socket, and treat the page's
    /// confirmed connection identifier as `Connected`.
    async fn handle_listing(&mut self, argument: plist::Dictionary) {
        let app_id = match &self.app {
            Some(app) => app.app_id.clone(),
            None => return,
        };
        if argument
            .get("WIRApplicationIdentifierKey")
            .and_then(|x| x.as_string())
            != Some(app_id.as_str())
        {
            return;
        }
        let listing = match argument.get("WIRListingKey").and_then(|x| x.as_dictionary()) {
            Some(l) => l,
            None => return,
        };

        for (_, page) in listing {
            let page = match page.as_dictionary() {
                Some(p) => p,
                None => continue,
            };
            if page.get("WIRTypeKey").and_then(|x| x.as_string()) != Some(AUTOMATION_PAGE_TYPE) {
                continue;
            }
            if page
                .get("WIRSessionIdentifierKey")
                .and_then(|x| x.as_string())
                != Some(self.session_id.as_str())
            {
                continue;
            }
            let page_id = match page
                .get("WIRPageIdentifierKey")
                .and_then(|x| x.as_unsigned_integer())
            {
                Some(id) => id,
                None => continue,
            };

            if self.page_id.is_none() {
                self.page_id = Some(page_id);
                let mut setup = plist::Dictionary::new();
                setup.insert("WIRApplicationIdentifierKey".into(), app_id.clone().into());
                setup.insert("WIRPageIdentifierKey".into(), page_id.into());
                setup.insert("WIRSenderKey".into(), self.session_id.clone().into());
                if let Err(e) = self.send_selector("_rpc_forwardSocketSetup:", setup).await {
                    warn!("Socket setup failed: {e}");
                    self.fail(Failure::Disconnected);
                    return;
                }
            }

            let confirmed = page
                .get("WIRConnectionIdentifierKey")
                .and_then(|x| x.as_string())
                == Some(self.session_id.as_str());
            if self.page_id == Some(page_id) && confirmed && self.state != SessionState::Connected
            {
                self.enter_connected().await;
            }
        }
    }

    fn handle_sent_data(&mut self, argument: plist::Dictionary) {
        if argument
            .get("WIRDestinationKey")
            .and_then(|x| x.as_string())
            != Some(self.session_id.as_str())
        {
            return;
        }
        let data = match argument.get("WIRMessageDataKey").and_then(|x| x.as_data()) {
            Some(d) => d,
            None => return,
        };
        let value: serde_json::Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                warn!("Automation reply wasn't JSON: {e}");
                return;
            }
        };
        let id = match value.get("id").and_then(|x| x.as_u64()) {
            Some(id) => id,
            None => {
                debug!("Automation event without id: {value}");
                return;
            }
        };

        // Replies may arrive out of order; the id pairs them up
        let reply = match self.pending.remove(&id) {
            Some(tx) => tx,
            None => {
                warn!("Reply for unknown request id {id}");
                return;
            }
        };
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|x| x.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            let _ = reply.send(Err(MuxdevError::Automation(message)));
        } else {
            let result = value
                .get("result")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let _ = reply.send(Ok(result));
        }
    }

    async fn enter_ready(&mut self) {
        self.state = SessionState::Ready;

        let mut capabilities = plist::Dictionary::new();
        capabilities.insert(
            "WIRAllowInsecureMediaCaptureCapabilityKey".into(),
            true.into(),
        );
        capabilities.insert(
            "WIRSuppressICECandidateFilteringCapabilityKey".into(),
            false.into(),
        );

        let mut argument = plist::Dictionary::new();
        argument.insert(
            "WIRSessionIdentifierKey".into(),
            self.session_id.clone().into(),
        );
        argument.insert(
            "WIRSessionCapabilitiesKey".into(),
            plist::Value::Dictionary(capabilities),
        );

        if let Err(e) = self
            .send_selector("_rpc_forwardAutomationSessionRequest:", argument)
            .await
        {
            warn!("Automation session request failed: {e}");
            self.fail(Failure::Disconnected);
        }
    }

    async fn enter_connected(&mut self) {
        debug!("Inspector session {} connected", self.session_id);
        self.state = SessionState::Connected;

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        // Replay everything that arrived while the session was starting
        for cmd in std::mem::take(&mut self.queued) {
            self.handle_command(cmd).await;
        }
    }

    fn fail(&mut self, failure: Failure) {
        if self.state == SessionState::Failed {
            return;
        }
        self.state = SessionState::Failed;
        self.failure = Some(failure);

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(failure.to_error()));
        }
        for cmd in std::mem::take(&mut self.queued) {
            match cmd {
                Command::Automation { reply, .. } => {
                    let _ = reply.send(Err(failure.to_error()));
                }
                Command::WaitForSession { reply } => {
                    let _ = reply.send(Err(failure.to_error()));
                }
            }
        }
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(failure.to_error()));
        }
    }

    fn failure_error(&self) -> MuxdevError {
        self.failure
            .map(Failure::to_error)
            .unwrap_or(MuxdevError::SessionFailed)
    }

    async fn dispatch_automation(
        &mut self,
        method: String,
        params: serde_json::Value,
        reply: oneshot::Sender<Result<serde_json::Value, MuxdevError>>,
    ) {
        let (app_id, page_id) = match (&self.app, self.page_id) {
            (Some(app), Some(page_id)) => (app.app_id.clone(), page_id),
            _ => {
                let _ = reply.send(Err(MuxdevError::SessionFailed));
                return;
            }
        };

        let id = self.next_request_id;
        self.next_request_id += 1;

        let body = serde_json::json!({
            "method": format!("Automation.{method}"),
            "params": params,
            "id": id,
        });
        let body = match serde_json::to_vec(&body) {
            Ok(b) => b,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        let mut argument = plist::Dictionary::new();
        argument.insert("WIRApplicationIdentifierKey".into(), app_id.into());
        argument.insert("WIRPageIdentifierKey".into(), page_id.into());
        argument.insert(
            "WIRSessionIdentifierKey".into(),
            self.session_id.clone().into(),
        );
        argument.insert("WIRSocketDataKey".into(), plist::Value::Data(body));

        match self.send_selector("_rpc_forwardSocketData:", argument).await {
            Ok(()) => {
                self.pending.insert(id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                self.fail(Failure::Disconnected);
            }
        }
    }

    async fn send_selector(
        &mut self,
        selector: &str,
        mut argument: plist::Dictionary,
    ) -> Result<(), MuxdevError> {
        argument.insert(
            "WIRConnectionIdentifierKey".into(),
            self.session_id.clone().into(),
        );

        let mut msg = plist::Dictionary::new();
        msg.insert("__selector".into(), selector.into());
        msg.insert("__argument".into(), plist::Value::Dictionary(argument));

        debug!("Inspector -> {selector}");
        let bytes = plist_to_xml_bytes(&msg);
        self.writer
            .write_all(&(bytes.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn bundle_identifier(entry: &plist::Dictionary) -> Option<&str> {
    entry
        .get("WIRApplicationBundleIdentifierKey")
        .and_then(|x| x.as_string())
}

fn is_ready(entry: &plist::Dictionary) -> bool {
    entry
        .get("WIRIsApplicationReadyKey")
        .and_then(|x| x.as_boolean())
        .unwrap_or(false)
}

/// Turns the read half into a message stream
///
/// Frames are length-prefixed-4 plists, XML or binary. The task ends on
/// socket loss, which the actor observes as a closed channel.
async fn reader_loop(
    mut reader: ReadHalf<DeviceStream>,
    tx: mpsc::UnboundedSender<plist::Dictionary>,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0; len];
        if reader.read_exact(&mut buf).await.is_err() {
            return;
        }
        match plist::from_bytes::<plist::Dictionary>(&buf) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Inspector sent an unparseable message: {e}");
                return;
            }
        }
    }
}
