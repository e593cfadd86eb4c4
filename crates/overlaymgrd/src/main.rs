//! overlaymgrd - overlay pipeline manager
//!
//! Compiles a topology into the switch pipeline and prints the resulting
//! wire-format rules; the preview of what the provisioning sink would push.

use anyhow::Context;
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fabric_common::{InterfaceAddress, MacAddr, RecordingSink};
use fabric_overlaymgrd::config::{BridgeConfig, TopologyConfig, VifConfig};
use fabric_overlaymgrd::overlay_mgr::OverlayMgr;
use fabric_overlaymgrd::topology::DeployMode;

#[derive(Debug, Parser)]
#[command(name = "overlaymgrd", about = "Overlay pipeline manager")]
struct Args {
    /// Bridge to deploy on.
    #[arg(long, default_value = "br0")]
    bridge: String,

    /// Deployment mode: native, tunnel, vlan or qinq.
    #[arg(long, default_value = "native")]
    mode: String,

    /// Topology bootstrap file (JSON); a demo topology is synthesized
    /// when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of demo interfaces when no config file is given.
    #[arg(long, default_value_t = 2)]
    vifs: u32,

    /// First VNI assigned to the demo interfaces.
    #[arg(long, default_value_t = 200)]
    vni_base: u32,

    /// Remote tunnel endpoints of the demo topology.
    #[arg(long)]
    remote_tep: Vec<Ipv4Addr>,

    /// Enable tunnel metadata (tunnel mode only).
    #[arg(long)]
    tunnel_metadata: bool,

    /// Print the compiled rules as a JSON array.
    #[arg(long)]
    json: bool,
}

/// Initializes tracing/logging subsystem.
fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn demo_config(args: &Args) -> TopologyConfig {
    let remote_teps = if args.remote_tep.is_empty() {
        vec![Ipv4Addr::new(10, 111, 0, 2)]
    } else {
        args.remote_tep.clone()
    };
    let vifs = (0..args.vifs)
        .map(|i| VifConfig {
            name: format!("vhost{i}"),
            mac: MacAddr::new([0, 0, 0, 0, 1, i as u8 + 1]),
            vni: Some(args.vni_base + i),
            addr: Some(InterfaceAddress::new(
                Ipv4Addr::new(172, 168, 0, i as u8 + 1),
                16,
                format!("2001:1000:1000:1000::aca8:{:x}", i + 1)
                    .parse()
                    .expect("demo address"),
                112,
            )),
        })
        .collect();
    TopologyConfig {
        tep: InterfaceAddress::new(
            Ipv4Addr::new(10, 111, 0, 1),
            16,
            "2001:1000:1000:1000::a6f:1".parse().expect("demo tep"),
            112,
        ),
        remote_teps,
        bridges: vec![BridgeConfig {
            name: args.bridge.clone(),
            vifs,
            uplinks: vec!["uplink1".to_string()],
        }],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();

    info!("--- Starting overlaymgrd ---");

    let mode: DeployMode = args.mode.parse().context("invalid deployment mode")?;

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).context("parsing topology config")?
        }
        None => demo_config(&args),
    };

    let topo = config.build().context("building topology")?;
    let sink = RecordingSink::new();
    let mut mgr = OverlayMgr::new(
        topo,
        Box::new(fabric_overlaymgrd::backend::DpdkBackend),
        Box::new(sink.clone()),
    );

    if mode == DeployMode::Tunnel {
        mgr.create_tunnel_ports(&args.bridge, "geneve", true, true)
            .context("creating tunnel ports")?;
    }

    mgr.deploy(&args.bridge, mode, args.tunnel_metadata)
        .await
        .context("deploying pipeline")?;

    let flows = sink.applied_flows();
    info!(count = flows.len(), mode = %mode, "Compiled pipeline");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&flows)?);
    } else {
        for flow in &flows {
            println!("{flow}");
        }
    }

    Ok(())
}
