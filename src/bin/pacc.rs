//! pacc
//!
//! Creates a null sink, streams whatever plays into it over HTTP and asks the
//! named receiver to play that stream. With `--dry-run` the receiver commands
//! are only logged.
//!
//! Usage: `pacc [--dry-run] <device name>`

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pacc::{
    audio::{NullSink, ParecSource},
    broadcast::BroadcastHub,
    config::AppConfig,
    control::{CastTransport, ControlTransport, DryRunTransport, SessionController},
    discovery::{select_interface, DeviceScanner, MdnsBackend},
    server::{stream_path, StreamServer},
    shutdown::TerminationSignal,
};

const USAGE: &str = "usage: pacc [--dry-run] <device name>";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut dry_run = false;
    let mut device_name = None;
    for arg in std::env::args().skip(1) {
        if arg == "--dry-run" {
            dry_run = true;
        } else if device_name.is_none() {
            device_name = Some(arg);
        } else {
            anyhow::bail!(USAGE);
        }
    }
    let device_name = device_name.context(USAGE)?;
    let mut termination = TerminationSignal::listen()?;

    tracing::info!("Starting pacc v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    config.validate()?;

    let interface = select_interface(config.discovery.interface)?;
    let advertise = config.stream.advertise_address.unwrap_or(interface);

    // Null sink applications play into
    let format = config.audio.format();
    let mut sink = NullSink::new(&config.audio.sink_name);
    sink.sample_rate = Some(format.sample_rate);
    sink.channels = Some(format.channels);
    sink.use_system_clock_for_timing = config.audio.use_system_clock_for_timing;
    sink.set_property("device.description", &config.audio.description);
    sink.open()?;

    // Broadcast its monitor
    let hub = BroadcastHub::new(config.stream.hub_config(), format);
    let source = ParecSource::spawn(&sink.name, format, config.audio.chunk_size)?;
    let hub_thread = hub.start(source)?;

    let server = StreamServer::new(hub.clone(), &config.stream);
    let shutdown = server.shutdown_token();
    let (local, server_handle) = server.start().await?;

    let codec = config.stream.codec;
    let url = format!("http://{}:{}{}", advertise, local.port(), stream_path(codec));
    tracing::info!("Streaming at {}", url);

    // Find the receiver and start playback
    let backend = MdnsBackend::new(interface)
        .with_service(config.discovery.service.clone())
        .with_requery_interval(config.discovery.requery_interval());
    let scanner = DeviceScanner::new(Arc::new(backend), config.discovery.timeout());

    let transport: Box<dyn ControlTransport> = if dry_run {
        Box::new(DryRunTransport::new())
    } else {
        Box::new(CastTransport::new())
    };
    let mut controller = SessionController::with_app_id(transport, config.control.app_id.clone());

    match scanner.find_device(&device_name).await {
        Ok(device) => {
            controller.connect(&device).await?;
            controller.play_media(&url, codec.mime_type()).await?;

            tracing::info!("Press Ctrl+C to stop");
            let signal = termination.recv().await;
            tracing::info!("Received {:?}", signal);

            let outcome = controller.quit(config.control.quit_timeout()).await?;
            tracing::info!("Receiver quit: {:?}", outcome);
        }
        Err(e) => tracing::error!("{}", e),
    }

    tracing::info!("Shutting down...");
    hub.shutdown();
    shutdown.cancel();
    if let Err(e) = server_handle.await {
        tracing::warn!("Server task failed: {}", e);
    }
    match tokio::task::spawn_blocking(move || hub_thread.join()).await {
        Ok(Ok(())) => {}
        _ => tracing::warn!("Broadcast thread did not exit cleanly"),
    }
    sink.close()?;

    tracing::info!("Goodbye!");
    Ok(())
}
