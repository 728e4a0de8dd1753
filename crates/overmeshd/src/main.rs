//! overmeshd: Overmesh overlay daemon.

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use overmesh_core::config::{OvermeshConfig, SeedingPolicy};
use overmesh_core::{GroupId, IdRegistry, PeerDescriptor};
use overmesh_services::{
    PeerViewSeeder, RendezvousEventKind, RendezvousManager, RendezvousMonitor, ResolverRouter,
    SeedingSource, Transport, TransportEvent, UriSeeder,
};

mod echo;
mod identity;
mod net;
mod transport;

use transport::{ReceiveLoop, SendWorker, UdpTransport};

/// Lease left to a rendezvous after a send to it fails.
const SEND_FAILURE_CHALLENGE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = OvermeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = OvermeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        OvermeshConfig::default()
    });

    let local = identity::load_or_create(&config.identity.peer_id_path)?;
    let group = GroupId::from_name(&config.identity.group);
    tracing::info!(
        peer = %local,
        name = %config.identity.name,
        group = %config.identity.group,
        role = ?config.rendezvous.role,
        "overmeshd starting"
    );

    // Socket
    let interface_index = if config.network.interface.is_empty() {
        None
    } else {
        Some(net::if_index(&config.network.interface)?)
    };
    let bind: SocketAddr = config
        .network
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.network.bind))?;
    let socket = UdpSocket::from_std(net::bind_socket(bind, interface_index)?)
        .context("failed to register overlay socket")?;
    let port = socket.local_addr()?.port();

    let mut advertise = config.network.advertise.clone();
    if advertise.is_empty() {
        if let Some(index) = interface_index {
            let addr = net::link_local_addr(index)?;
            tracing::info!(%addr, "local link-local address");
            advertise.push(net::format_endpoint(SocketAddr::V6(SocketAddrV6::new(
                addr, port, 0, index,
            ))));
        }
    }

    let (udp, outbound_rx) = UdpTransport::new(local, socket, advertise, interface_index)?;
    let transport: Arc<dyn Transport> = Arc::new(udp.clone());
    tracing::info!(addr = %udp.local_addr()?, route = ?transport.local_route(), "overlay socket bound");

    // Seeding
    let ids = Arc::new(IdRegistry::standard());
    let uri_seeder =
        UriSeeder::from_config(&config.rendezvous, &ids).context("invalid rendezvous seed")?;
    tracing::info!(seeds = uri_seeder.len(), policy = ?config.rendezvous.seeding, "seeding ready");
    let (seeding, peer_view): (Arc<dyn SeedingSource>, Option<Arc<PeerViewSeeder>>) =
        match config.rendezvous.seeding {
            SeedingPolicy::Uri => (Arc::new(uri_seeder) as Arc<dyn SeedingSource>, None),
            SeedingPolicy::PeerView => {
                let view = Arc::new(PeerViewSeeder::new(uri_seeder));
                (view.clone() as Arc<dyn SeedingSource>, Some(view))
            }
        };

    // Rendezvous and resolver
    let descriptor = PeerDescriptor {
        peer: local,
        name: config.identity.name.clone(),
        endpoints: Vec::new(),
    };
    let rendezvous = RendezvousManager::new(
        group,
        descriptor,
        config.rendezvous.clone(),
        transport.clone(),
        seeding,
    );
    let resolver = ResolverRouter::new(config.resolver.clone(), transport.clone(), rendezvous.clone());
    resolver.register_handler(echo::ECHO_HANDLER, Arc::new(echo::EchoHandler));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let send_worker_task = tokio::spawn(
        SendWorker::new(udp.clone(), outbound_rx, shutdown_tx.subscribe()).run(),
    );

    let receive_task = tokio::spawn(ReceiveLoop::new(udp.clone(), shutdown_tx.subscribe()).run());

    let mut monitor_task = tokio::spawn(
        RendezvousMonitor::new(rendezvous.clone(), shutdown_tx.subscribe()).run(),
    );

    let failure_watcher = {
        let rendezvous = rendezvous.clone();
        let mut events = udp.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::SendFailed { peer }) => {
                        if rendezvous.challenge(&peer, SEND_FAILURE_CHALLENGE) {
                            tracing::info!(peer = %peer, "send failed, rendezvous challenged");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "transport events lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    };

    let _peer_view_task = peer_view.map(|view| {
        let rendezvous = rendezvous.clone();
        let mut events = rendezvous.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                match event.kind {
                    RendezvousEventKind::Connected | RendezvousEventKind::Reconnected => {
                        if let Some(c) = rendezvous.connection(&event.peer) {
                            view.observe(PeerDescriptor {
                                peer: c.peer,
                                name: c.name,
                                endpoints: c.endpoints,
                            });
                        }
                    }
                    RendezvousEventKind::DisconnectedByPeer => view.forget(&event.peer),
                    _ => {}
                }
            }
        })
    });

    let status_printer = {
        let rendezvous = rendezvous.clone();
        let udp = udp.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let connections = rendezvous.connections();
                tracing::info!(
                    connections = connections.len(),
                    clients = rendezvous.clients().len(),
                    routes = udp.route_count(),
                    "rendezvous snapshot"
                );
                for c in connections {
                    tracing::info!(
                        peer = %c.peer,
                        name = %c.name,
                        state = ?c.state,
                        lease_remaining_ms = c.lease_remaining_ms,
                        "  connection"
                    );
                }
            }
        })
    };

    // Status HTTP endpoint
    let api_port = config.network.api_port;
    let _api_server = (api_port != 0).then(|| {
        let state = overmesh_api::ApiState {
            rendezvous: rendezvous.clone(),
            resolver: resolver.clone(),
            ids: ids.clone(),
            node_name: config.identity.name.clone(),
            started_at: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = overmesh_api::serve(state, api_port).await {
                tracing::error!(error = %e, "api server failed");
            }
        })
    });

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let shutting_down = tokio::select! {
        _ = shutdown_rx.recv()   => true,
        r = send_worker_task     => { tracing::error!("send worker exited: {:?}", r); false }
        r = receive_task         => { tracing::error!("receive loop exited: {:?}", r); false }
        r = &mut monitor_task    => { tracing::error!("rendezvous monitor exited: {:?}", r); false }
        r = failure_watcher      => { tracing::error!("failure watcher exited: {:?}", r); false }
        r = status_printer       => { tracing::error!("status printer exited: {:?}", r); false }
    };

    if shutting_down {
        tracing::info!("shutting down");
        // The monitor releases leases on shutdown; give the send worker time to flush them.
        if tokio::time::timeout(Duration::from_secs(2), monitor_task).await.is_err() {
            tracing::warn!("monitor did not stop in time");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(())
}
