use anyhow::Result;
use dsme::collaborators::{
    DeviceMapperEncryptionProbe, EtcGroupPrivilegeChecker, FilesystemRebootParamStore, TokioTimerService,
};
use dsme::dbus::DbusBridge;
use dsme::logging::{get_logger, init_logging};
use dsme::{Config, Engine};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let explicit_config = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = Config::load(explicit_config.as_deref())?;
    config.validate()?;

    init_logging(&config.logging)?;
    let logger = get_logger("main");
    info!("dsme starting up");

    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let timer_service = Arc::new(TokioTimerService::new(events_tx));
    let privilege_checker = Arc::new(EtcGroupPrivilegeChecker::new());
    let encryption_probe = Arc::new(DeviceMapperEncryptionProbe::new(&config.paths));
    let reboot_param_store = Arc::new(FilesystemRebootParamStore::new(&config.paths));

    let mut dbus_bridge = DbusBridge::new(config.dbus.clone());
    if let Err(e) = dbus_bridge.start(message_tx.clone()).await {
        logger.error(&format!("D-Bus bridge failed to start: {e}"));
    }
    let event_sink = Arc::new(dsme::dbus::DbusEventSink::new(dbus_bridge.connection()));

    let mut engine = Engine::new(
        config,
        message_rx,
        events_rx,
        timer_service,
        event_sink,
        privilege_checker,
        encryption_probe,
        reboot_param_store,
    );

    let bootstate = std::env::var("BOOTSTATE").unwrap_or_else(|_| "USER".to_string());
    engine.bootstrap(&bootstate).await?;

    let shutdown_signal = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    };

    tokio::select! {
        result = engine.run() => {
            match result {
                Ok(()) => {
                    info!("dsme main loop exited cleanly");
                    Ok(())
                }
                Err(e) => {
                    error!("dsme main loop exited fatally: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ = shutdown_signal => {
            info!("dsme received termination signal, shutting down");
            Ok(())
        }
    }
}
