//! `serve`: run a long-lived peer node
//!
//! The node answers other runners from its local layers, keeps its
//! rendezvous advert fresh and sweeps expired entries until Ctrl-C.

use std::time::Duration;

use log::{info, warn};

use crate::cli::context::advertised_address;
use crate::cli::{CommandContext, OutputFormat};
use crate::error::{Error, Result};
use crate::p2p::PeerServer;

pub async fn run(ctx: &CommandContext) -> Result<()> {
    let p2p = &ctx.config.p2p;
    if !p2p.enabled {
        return Err(Error::Other("peer network is disabled (p2p.enabled: false)".to_string()));
    }

    let stack = ctx.peer_stack()?;
    let local = ctx.local_cache()?;

    let server = PeerServer::bind(
        &p2p.bind_host,
        p2p.port_start,
        p2p.port_end,
        local.clone(),
        stack.registry.clone(),
        stack.shared_key.clone(),
    )
    .await?
    .with_io_timeout(p2p.query_timeout())
    .with_ttl_policy(ctx.config.cache.ttl.clone());
    let bound = server.local_addr()?;
    let address = advertised_address(bound, p2p.advertise_host.as_deref());

    if let Err(e) = stack.registry.register_self(&address).await {
        warn!("Could not advertise {}: {}", address, e);
    }

    match ctx.format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "peer_id": stack.registry.self_id(),
                "listen": bound.to_string(),
                "advertise": address,
            });
            println!("{}", serde_json::to_string(&json)?);
        }
        OutputFormat::Pretty => {
            println!("Peer {} listening on {}", stack.registry.self_id(), bound);
            if address != bound.to_string() {
                println!("Advertised as {}", address);
            }
        }
    }

    let server_task = server.spawn();
    let maintenance = stack
        .registry
        .clone()
        .spawn_maintenance(Duration::from_secs(p2p.discovery_interval_secs.max(1)));
    let sweeper = local.spawn_sweeper(Duration::from_secs(ctx.config.cache.sweep_interval_secs.max(1)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down peer {}", stack.registry.self_id());

    server_task.abort();
    maintenance.abort();
    sweeper.abort();
    Ok(())
}
