//! Client wiring
//!
//! Glues the pieces together: one UDP transport, one peer table, one tracker
//! client, the tunnel router, and a driver task per discovered peer. The TAP
//! seam is backed by a channel device here; platform TAP integration plugs
//! in through the same `TapDevice` trait.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use tapmesh_net::{
    discover_local_ips, ChannelTap, LocalIdentity, MacAddr, Mailboxes, PeerDriver, PeerTable,
    PlainCodec, PunchGate, RemotePeer, TrackerClient, TrackerConfig, TunnelRouter, UdpTransport,
    UdpTransportBuilder, FIND_INTERVAL,
};

use crate::config::ClientConfig;

/// A running tapmesh client
pub struct TapmeshClient {
    config: ClientConfig,
    transport: Arc<UdpTransport>,
    table: Arc<PeerTable>,
    tracker: Arc<TrackerClient>,
    mailboxes: Arc<Mailboxes>,
    punch_gate: PunchGate,
    discovered_rx: mpsc::Receiver<tapmesh_net::DiscoveredPeer>,
}

impl TapmeshClient {
    /// Bind sockets, dial the trackers and start the data plane
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(
            UdpTransportBuilder::new(
                format!("0.0.0.0:{}", config.listen_port)
                    .parse()
                    .context("Bad listen port")?,
            )
            .recv_buffer_size(1 << 20)
            .build()
            .context("Failed to bind data socket")?,
        );
        let declared_port = transport.local_addr().port();
        info!("Data socket on UDP port {}", declared_port);

        let mailboxes: Arc<Mailboxes> = Arc::new(Mailboxes::new());
        let (discovered_tx, discovered_rx) = mpsc::channel(64);

        let tracker = TrackerClient::connect(
            TrackerConfig {
                routers: config.trackers.clone(),
                fingerprint: config.fingerprint.clone(),
                declared_port,
                local_ips: discover_local_ips(),
            },
            discovered_tx,
            Arc::clone(&mailboxes),
        )
        .await
        .context("Failed to reach any tracker")?;
        tracker.spawn_refresh(FIND_INTERVAL);

        let mac = match &config.overlay_mac {
            Some(mac) => mac.parse().context("Bad overlay MAC")?,
            None => MacAddr::generate(),
        };
        info!("Segment identity: {} / {}", mac, config.overlay_ip);

        let table = Arc::new(PeerTable::new());
        let (tap, tap_handle) = ChannelTap::new(&config.tap_name, 256);

        let router = Arc::new(TunnelRouter::new(
            Arc::clone(&transport),
            Arc::clone(&table),
            Arc::new(tap),
            Arc::new(PlainCodec),
            Arc::clone(&tracker),
            Arc::clone(&mailboxes),
            LocalIdentity {
                mac,
                ip: config.overlay_ip,
            },
        ));

        let (datagram_tx, datagram_rx) = mpsc::channel(1024);
        transport.spawn_receiver(datagram_tx);
        tokio::spawn(Arc::clone(&router).run_inbound(datagram_rx));
        tokio::spawn(Arc::clone(&router).run_outbound());

        // Until a platform TAP attaches to the seam, keep it open and
        // account for delivered traffic
        tokio::spawn(async move {
            let _inject = tap_handle.inject;
            let mut delivered = tap_handle.delivered;
            let mut frames: u64 = 0;
            let mut bytes: u64 = 0;
            while let Some(frame) = delivered.recv().await {
                frames += 1;
                bytes += frame.len() as u64;
                if frames % 1024 == 0 {
                    debug!("Delivered {} frames ({} bytes) to the segment", frames, bytes);
                }
            }
        });

        Ok(Self {
            config,
            transport,
            table,
            tracker,
            mailboxes,
            punch_gate: PunchGate::default(),
            discovered_rx,
        })
    }

    /// React to tracker announcements until shutdown
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Joined segment '{}' via {}",
            self.config.fingerprint, self.config.trackers
        );
        while let Some(discovered) = self.discovered_rx.recv().await {
            if self.table.contains(&discovered.id).await {
                continue;
            }
            info!(
                "Tracker announced peer {} ({:?})",
                discovered.id, discovered.endpoint
            );
            let peer = match discovered.endpoint {
                Some(endpoint) => RemotePeer::with_endpoint(discovered.id.clone(), endpoint),
                None => RemotePeer::new(discovered.id.clone()),
            };

            let (event_tx, event_rx) = mpsc::channel(64);
            self.mailboxes.insert(discovered.id.clone(), event_tx);
            // Visible in the table before the driver's first tick, so a
            // second announcement cannot double-spawn
            self.table.upsert(&discovered.id, peer.clone()).await;

            let driver = PeerDriver::new(
                peer,
                Arc::clone(&self.table),
                Arc::clone(&self.tracker),
                Arc::clone(&self.transport),
                event_rx,
                Arc::clone(&self.punch_gate),
            );
            tokio::spawn(driver.run());
        }
        Ok(())
    }

    /// Announce departure so the tracker drops us ahead of its sweep
    pub async fn shutdown(&self) {
        if let Some(id) = self.tracker.self_id().await {
            debug!("Leaving segment as {}", id);
            self.tracker.send_stop(&id).await;
        }
        info!("Client stopped");
    }
}
