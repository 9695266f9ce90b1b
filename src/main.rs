use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webrtc_mesh::config::{Cli, ClientConfig, Command, JoinArgs, RelayArgs, RelayConfig};
use webrtc_mesh::rtc::RtcTransportFactory;
use webrtc_mesh::signaling::SignalingClient;
use webrtc_mesh::transport::LocalStream;
use webrtc_mesh::{Orchestrator, RelayServer, SessionEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webrtc_mesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => run_relay(args).await,
        Command::Join(args) => run_join(args).await,
    }
}

async fn run_relay(args: RelayArgs) -> anyhow::Result<()> {
    let config = RelayConfig::from(args);
    let server = RelayServer::bind(&config)
        .await
        .with_context(|| format!("failed to bind relay to {}", config.bind_address))?;

    tokio::select! {
        result = server.run() => result.context("relay stopped")?,
        _ = signal::ctrl_c() => info!("shutting down relay"),
    }
    Ok(())
}

async fn run_join(args: JoinArgs) -> anyhow::Result<()> {
    let config = ClientConfig::from(args);
    let url = config.room_url()?;

    let client = SignalingClient::connect(&url)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    let (outbound, inbound) = client.into_parts();

    let factory = RtcTransportFactory::new(&config.session.ice_servers)?;
    let (orchestrator, signals) = Orchestrator::new(factory, config.session.clone(), outbound);
    let mut events = orchestrator.subscribe();
    let (handle, mut task) = orchestrator.spawn(signals, inbound);

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if config.publish_audio {
        let (stream, _track) = LocalStream::opus_audio("webrtc-mesh-audio");
        handle.add_local_stream(stream).await?;
    }

    tokio::select! {
        result = &mut task => {
            if let Err(e) = result {
                error!("orchestrator task failed: {}", e);
            }
            return Ok(());
        }
        _ = signal::ctrl_c() => info!(room = %config.room, "leaving room"),
    }

    handle.shutdown().await?;
    task.await?;
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::LocalStreamAdded(stream) | SessionEvent::LocalStreamRemoved(stream) => {
            info!(event = event.name(), stream = %stream.id());
        }
        SessionEvent::RemoteStreamAdded { stream, peer_id } => {
            info!(event = event.name(), peer = %peer_id, stream = %stream.id(), tracks = stream.tracks().len());
        }
        SessionEvent::DataChannelAdded { channel, peer_id } => {
            info!(event = event.name(), peer = %peer_id, label = %channel.label());
        }
        SessionEvent::RemoteStreamRemoved(peer_id)
        | SessionEvent::PeerConnected(peer_id)
        | SessionEvent::PeerDisconnected(peer_id) => {
            info!(event = event.name(), peer = %peer_id);
        }
    }
}
