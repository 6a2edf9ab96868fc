//! CSI node plugin binary.
//!
//! Wires the control-plane client, the volume registry, the node service
//! and the mount supervisor together, then serves the CSI endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use openebs_csi_node::config::{self, Settings};
use openebs_csi_node::{
    metrics, server, IscsiAdm, MapiClient, MountSupervisor, NodeService, ProbeConfig,
    VolumeRegistry, DRIVER_NAME,
};

/// CLI arguments for the node plugin
#[derive(Parser, Debug)]
#[command(name = "csi-node")]
#[command(about = "CSI node plugin for OpenEBS-style iSCSI-backed volumes")]
struct Args {
    /// CSI endpoint (unix://PATH or tcp://HOST:PORT)
    #[arg(long, default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Address to serve Prometheus metrics on (disabled when unset)
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Without the maya API service the plugin cannot publish or repair
    // anything, so configuration problems end the process here.
    let settings = Settings::from_env()?;
    let mapi_endpoint = config::resolve_mapi_endpoint(&settings).await?;

    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!(
        driver_name = DRIVER_NAME,
        endpoint = %args.endpoint,
        node_id = %node_id,
        mapi_endpoint = %mapi_endpoint,
        "starting CSI node plugin"
    );

    let control = Arc::new(MapiClient::new(mapi_endpoint)?);
    let registry = Arc::new(VolumeRegistry::new());
    let iscsi = Arc::new(IscsiAdm);
    let probe = ProbeConfig::default();

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr)?;
    }

    let supervisor = MountSupervisor::new(
        registry.clone(),
        control.clone(),
        iscsi.clone(),
        probe,
    );
    tokio::spawn(supervisor.run());

    let node = Arc::new(NodeService::new(
        node_id,
        registry,
        control,
        iscsi,
        probe,
    ));
    server::serve(&args.endpoint, node).await?;

    Ok(())
}
