//! D-Bus bridge: subscribes to the two inbound signals the Request Surface
//! reacts to, exposes the one inbound method surface (`req_inhibit_shutdown`),
//! and forwards `OutboundEvent`s the engine has no other listener for.
//!
//! Grounded in the teacher's `dbus/service.rs` (connect-then-request-name,
//! `StructuredLogger` field, `Option<Connection>` for a not-yet-started
//! service) and `dbus.rs` (`request_name` helper using `zbus::fdo::DBusProxy`
//! + `RequestNameFlags::ReplaceExisting`).

use crate::collaborators::EventSink;
use crate::config::DbusConfig;
use crate::error::{DsmeError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::messages::{CallerIdentity, Message, OutboundEvent};
use futures_util::stream::StreamExt;
use tokio::sync::mpsc;
use zbus::{Connection, Result as ZbusResult, names::WellKnownName};

#[zbus::proxy(
    interface = "com.nokia.startup.signal",
    default_path = "/com/nokia/startup/signal"
)]
trait StartupSignal {
    #[zbus(signal)]
    fn runlevel_switch_done(&self, runlevel: i32) -> zbus::Result<()>;
}

#[zbus::proxy(interface = "com.nokia.mce.signal", default_path = "/com/nokia/mce/signal")]
trait MceSignal {
    #[zbus(signal)]
    fn sig_call_state_ind(&self, state: String) -> zbus::Result<()>;
}

/// Exposes `req_inhibit_shutdown` on the well-known bus name. Every call is
/// translated into a `BlockShutdown`/`AllowShutdown` message tagged with
/// `CallerIdentity::DbusProxy`, satisfying the in-process-proxy-only rule
/// since this interface IS the trusted proxy endpoint.
struct RequestInterface {
    message_tx: mpsc::UnboundedSender<Message>,
}

#[zbus::interface(name = "com.nokia.dsme.request")]
impl RequestInterface {
    async fn req_inhibit_shutdown(&self, inhibit: bool) {
        let msg = if inhibit {
            Message::BlockShutdown { caller: CallerIdentity::DbusProxy }
        } else {
            Message::AllowShutdown { caller: CallerIdentity::DbusProxy }
        };
        let _ = self.message_tx.send(msg);
    }
}

/// Owns the bus connection, the signal-forwarding tasks, and the
/// well-known-name registration. Mirrors the teacher's `DbusService`
/// connect/start split.
pub struct DbusBridge {
    logger: StructuredLogger,
    config: DbusConfig,
    connection: Option<Connection>,
}

impl DbusBridge {
    pub fn new(config: DbusConfig) -> Self {
        Self { logger: get_logger("dbus"), config, connection: None }
    }

    /// Connects (system bus, falling back to session only if configured),
    /// requests the well-known name, registers the request interface, and
    /// spawns the two signal-forwarding tasks. Returns once the bridge is
    /// live; the spawned tasks run for the process lifetime.
    pub async fn start(&mut self, message_tx: mpsc::UnboundedSender<Message>) -> Result<()> {
        let connection = self.connect().await?;

        self.request_name(&connection)
            .await
            .map_err(|e| DsmeError::transient(format!("RequestName failed: {e}")))?;

        connection
            .object_server()
            .at("/com/nokia/dsme/request", RequestInterface { message_tx: message_tx.clone() })
            .await
            .map_err(|e| DsmeError::transient(format!("registering request interface failed: {e}")))?;

        self.spawn_runlevel_switch_bridge(&connection, message_tx.clone())
            .await?;
        self.spawn_call_state_bridge(&connection, message_tx).await?;

        self.logger.info(&format!(
            "D-Bus bridge started: {}",
            self.config.well_known_name
        ));
        self.connection = Some(connection);
        Ok(())
    }

    /// The bridge's own connection, once started, for building the
    /// production `EventSink` the engine broadcasts `CHANGE_RUNLEVEL`/
    /// `SHUTDOWN` through.
    pub fn connection(&self) -> Option<Connection> {
        self.connection.clone()
    }

    async fn connect(&self) -> Result<Connection> {
        if self.config.prefer_session_bus {
            return Connection::session()
                .await
                .map_err(|e| DsmeError::transient(format!("session bus connect failed: {e}")));
        }
        match Connection::system().await {
            Ok(c) => Ok(c),
            Err(e) => {
                self.logger
                    .warn(&format!("system bus unavailable ({e}), falling back to session bus"));
                Connection::session()
                    .await
                    .map_err(|e| DsmeError::transient(format!("session bus connect failed: {e}")))
            }
        }
    }

    async fn request_name(&self, connection: &Connection) -> ZbusResult<()> {
        use zbus::fdo::{DBusProxy, RequestNameFlags};
        let proxy = DBusProxy::new(connection).await?;
        let name = WellKnownName::try_from(self.config.well_known_name.as_str())?;
        let _ = proxy.request_name(name, RequestNameFlags::ReplaceExisting.into()).await?;
        Ok(())
    }

    async fn spawn_runlevel_switch_bridge(
        &self,
        connection: &Connection,
        message_tx: mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        let proxy = StartupSignalProxy::new(connection)
            .await
            .map_err(|e| DsmeError::transient(format!("StartupSignal proxy failed: {e}")))?;
        let mut stream = proxy
            .receive_runlevel_switch_done()
            .await
            .map_err(|e| DsmeError::transient(format!("subscribing to runlevel_switch_done failed: {e}")))?;
        let logger = get_logger("dbus");
        tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                match signal.args() {
                    Ok(args) => {
                        let _ = message_tx.send(Message::RunlevelSwitchDone { runlevel: args.runlevel });
                    }
                    Err(e) => logger.warn(&format!("malformed runlevel_switch_done signal: {e}")),
                }
            }
        });
        Ok(())
    }

    async fn spawn_call_state_bridge(
        &self,
        connection: &Connection,
        message_tx: mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        let proxy = MceSignalProxy::new(connection)
            .await
            .map_err(|e| DsmeError::transient(format!("MceSignal proxy failed: {e}")))?;
        let mut stream = proxy
            .receive_sig_call_state_ind()
            .await
            .map_err(|e| DsmeError::transient(format!("subscribing to sig_call_state_ind failed: {e}")))?;
        let logger = get_logger("dbus");
        tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                match signal.args() {
                    Ok(args) => {
                        let ongoing = args.state == "emergency";
                        let _ = message_tx.send(Message::SetEmergencyCallState { ongoing });
                    }
                    Err(e) => logger.warn(&format!("malformed sig_call_state_ind signal: {e}")),
                }
            }
        });
        Ok(())
    }
}

const DSME_SIGNAL_PATH: &str = "/com/nokia/dsme/signal";
const DSME_SIGNAL_INTERFACE: &str = "com.nokia.dsme.signal";

/// Production `EventSink`: forwards `ChangeRunlevel`/`Shutdown` onto the
/// bridge's own connection as broadcast signals for init-system consumers,
/// and logs everything else, since no further in-process consumer exists
/// for it within this crate's scope.
///
/// `connection` is `None` when the bridge failed to start; in that case the
/// two runlevel-driving events fall back to a log line, matching the
/// transient-failure handling the rest of this crate applies elsewhere.
pub struct DbusEventSink {
    logger: StructuredLogger,
    connection: Option<Connection>,
}

impl DbusEventSink {
    pub fn new(connection: Option<Connection>) -> Self {
        Self { logger: get_logger("dbus"), connection }
    }

    async fn broadcast(&self, signal_name: &str, runlevel_code: i32) {
        match &self.connection {
            Some(conn) => {
                let result = conn
                    .emit_signal(
                        None::<&str>,
                        DSME_SIGNAL_PATH,
                        DSME_SIGNAL_INTERFACE,
                        signal_name,
                        &runlevel_code,
                    )
                    .await;
                if let Err(e) = result {
                    self.logger
                        .warn(&format!("failed to broadcast {signal_name}({runlevel_code}): {e}"));
                }
            }
            None => {
                self.logger
                    .warn(&format!("no D-Bus connection, dropping {signal_name}({runlevel_code})"));
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSink for DbusEventSink {
    async fn emit(&self, event: OutboundEvent) {
        match event {
            OutboundEvent::ChangeRunlevel { runlevel } => {
                self.logger.info(&format!("CHANGE_RUNLEVEL -> {}", runlevel.code()));
                self.broadcast("change_runlevel", runlevel.code()).await;
            }
            OutboundEvent::Shutdown { runlevel } => {
                self.logger.info(&format!("SHUTDOWN -> {}", runlevel.code()));
                self.broadcast("shutdown", runlevel.code()).await;
            }
            OutboundEvent::StateChangeInd { state } => {
                self.logger.debug(&format!("STATE_CHANGE_IND: {state:?}"));
            }
            OutboundEvent::SaveDataInd => {
                self.logger.debug("SAVE_DATA_IND");
            }
            OutboundEvent::StateReqDeniedInd { state, reason } => {
                self.logger.info(&format!("STATE_REQ_DENIED_IND: {state:?} ({reason})"));
            }
            OutboundEvent::BatteryEmptyInd => {
                self.logger.warn("BATTERY_EMPTY_IND");
            }
            OutboundEvent::SetEmergencyCallState { ongoing } => {
                self.logger.debug(&format!("emergency call state echoed: {ongoing}"));
            }
            OutboundEvent::EnterMalf { reason, component, details } => {
                self.logger.error(&format!("ENTER_MALF: {reason} {component} {details}"));
            }
        }
    }
}
