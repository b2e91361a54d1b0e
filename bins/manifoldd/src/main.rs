// manifold-rs - The Manifold SIP Routing Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `manifoldd`: a stateless SIP proxy over UDP and TCP legs.
//!
//! Binds the configured legs, wires them into a dispatcher and installs the
//! stateless forwarder as the receiver. Static routing comes from an
//! optional JSON domain map and/or a global outgoing proxy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use sip_dispatch::{Dispatcher, DispatcherConfig, DomainMap};
use sip_legs::{Leg, TcpLeg, UdpLeg};
use sip_observe::{set_leg_metrics, TracingLegMetrics};
use sip_proxy::{StatelessProxy, StatelessProxyConfig};

/// Stateless SIP proxy daemon.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address for the UDP leg
    #[arg(long, default_value = "0.0.0.0:5060")]
    udp_bind: String,
    /// Bind address for the TCP leg
    #[arg(long)]
    tcp_bind: Option<String>,
    /// Global outgoing proxy as [proto:]host[:port]
    #[arg(long)]
    outgoing_proxy: Option<String>,
    /// JSON file mapping domains to [proto:]host[:port] proxy specs
    #[arg(long)]
    domain_proxy_map: Option<PathBuf>,
    /// Disable dispatcher retransmissions entirely
    #[arg(long)]
    no_retransmits: bool,
    /// Default port assumed for a top Via without one (5061 for sips fronts)
    #[arg(long, default_value_t = 5060)]
    via_default_port: u16,
}

async fn load_domain_map(path: &PathBuf) -> Result<DomainMap> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let specs: HashMap<String, String> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    DomainMap::from_specs(specs.iter().map(|(d, s)| (d.as_str(), s.as_str())))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    set_leg_metrics(Arc::new(TracingLegMetrics));
    let args = Args::parse();

    let domain2proxy = match &args.domain_proxy_map {
        Some(path) => load_domain_map(path).await?,
        None => DomainMap::new(),
    };

    let mut legs: Vec<Arc<dyn Leg>> = Vec::new();
    legs.push(Arc::new(UdpLeg::bind(&args.udp_bind).await?));
    if let Some(tcp_bind) = &args.tcp_bind {
        legs.push(Arc::new(TcpLeg::bind(tcp_bind).await?));
    }

    let dispatcher = Dispatcher::new(
        legs,
        DispatcherConfig {
            outgoing_proxy: args.outgoing_proxy.clone(),
            domain2proxy,
            do_retransmits: !args.no_retransmits,
            ..Default::default()
        },
    )?;
    let _expiry = dispatcher.spawn_expiry();

    let proxy = StatelessProxy::new(
        dispatcher.clone(),
        StatelessProxyConfig {
            via_default_port: args.via_default_port,
        },
    );
    dispatcher.set_receiver(Arc::new(proxy));

    info!(udp = %args.udp_bind, tcp = args.tcp_bind.as_deref().unwrap_or("-"), "manifoldd running");
    signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
