//! dlepd: a minimal DLEP node runner.
//!
//! Wires command-line arguments into the configuration-parameter table,
//! attaches a logging client, and runs the engine until interrupted.
//! Real deployments embed the library behind their own `DlepClient`.

use clap::Parser;
use dlep::{
    ConfigValue, DataItem, DlepClient, Engine, MacAddress, PeerInfo, TableClient,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dlepd", version, about = "DLEP modem/router node")]
struct Args {
    /// Role: modem or router
    #[arg(short, long, default_value = "modem")]
    local_type: String,

    /// Protocol configuration XML
    #[arg(short, long, default_value = "config/dlep-rfc8175.xml")]
    protocol_config: PathBuf,

    /// Session TCP address to bind (modem) or connect to (router)
    #[arg(short, long)]
    session_address: Option<IpAddr>,

    /// Session TCP port
    #[arg(long, default_value = "854")]
    session_port: u16,

    /// Enable UDP multicast discovery
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    discovery: bool,

    /// Discovery interface
    #[arg(long, default_value = "")]
    discovery_iface: String,

    /// Discovery UDP port
    #[arg(long, default_value = "854")]
    discovery_port: u16,

    /// Discovery multicast group
    #[arg(long, default_value = "224.0.0.117")]
    discovery_mcast_address: IpAddr,

    /// Seconds between Peer Discovery signals
    #[arg(long, default_value = "60")]
    discovery_interval: u64,

    /// Outbound heartbeat interval in seconds (0 disables)
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Peer type string announced during session initialization
    #[arg(long)]
    peer_type: Option<String>,

    /// Enable the destination-advertisement subprotocol (modem only)
    #[arg(long)]
    dest_advert: bool,

    /// Local rf-id for destination advertisement, colon-separated hex
    #[arg(long)]
    dest_advert_rf_id: Option<MacAddress>,
}

/// Logs every event; accepts every destination.
struct LoggingClient {
    params: TableClient,
}

impl DlepClient for LoggingClient {
    fn get_config_parameter(
        &self,
        name: &str,
    ) -> Result<ConfigValue, dlep::ClientError> {
        self.params.get_config_parameter(name)
    }

    fn peer_up(&self, peer_info: &PeerInfo) {
        info!(
            "peer up: id={} type={:?} heartbeat={}",
            peer_info.peer_id, peer_info.peer_type, peer_info.heartbeat_interval
        );
    }

    fn peer_update(&self, peer_id: &str, data_items: &[DataItem]) {
        info!("peer update: id={} items={}", peer_id, data_items.len());
    }

    fn peer_down(&self, peer_id: &str) {
        info!("peer down: id={}", peer_id);
    }

    fn destination_up(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]) -> String {
        info!(
            "destination up: peer={} mac={} items={}",
            peer_id,
            mac,
            data_items.len()
        );
        String::new()
    }

    fn destination_update(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]) {
        info!(
            "destination update: peer={} mac={} items={}",
            peer_id,
            mac,
            data_items.len()
        );
    }

    fn destination_down(&self, peer_id: &str, mac: &MacAddress) {
        info!("destination down: peer={} mac={}", peer_id, mac);
    }

    fn linkchar_request(&self, peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) {
        info!("link characteristics request: peer={} mac={}", peer_id, mac);
    }

    fn linkchar_reply(&self, peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) {
        info!("link characteristics reply: peer={} mac={}", peer_id, mac);
    }
}

fn build_params(args: &Args) -> HashMap<String, ConfigValue> {
    let mut params = HashMap::new();
    params.insert(
        "local-type".to_string(),
        ConfigValue::Str(args.local_type.clone()),
    );
    params.insert(
        "protocol-config-file".to_string(),
        ConfigValue::Str(args.protocol_config.display().to_string()),
    );
    params.insert(
        "session-port".to_string(),
        ConfigValue::UInt(u64::from(args.session_port)),
    );
    if let Some(addr) = args.session_address {
        params.insert("session-address".to_string(), ConfigValue::Addr(addr));
    }
    params.insert(
        "discovery-enable".to_string(),
        ConfigValue::Bool(args.discovery),
    );
    params.insert(
        "discovery-iface".to_string(),
        ConfigValue::Str(args.discovery_iface.clone()),
    );
    params.insert(
        "discovery-port".to_string(),
        ConfigValue::UInt(u64::from(args.discovery_port)),
    );
    params.insert(
        "discovery-mcast-address".to_string(),
        ConfigValue::Addr(args.discovery_mcast_address),
    );
    params.insert(
        "discovery-interval".to_string(),
        ConfigValue::UInt(args.discovery_interval),
    );
    params.insert(
        "heartbeat-interval".to_string(),
        ConfigValue::UInt(args.heartbeat_interval),
    );
    if let Some(peer_type) = &args.peer_type {
        params.insert("peer-type".to_string(), ConfigValue::Str(peer_type.clone()));
    }
    params.insert(
        "destination-advert-enable".to_string(),
        ConfigValue::Bool(args.dest_advert),
    );
    if let Some(rf_id) = &args.dest_advert_rf_id {
        params.insert(
            "destination-advert-rf-id".to_string(),
            ConfigValue::UIntList(rf_id.bytes.iter().map(|b| u64::from(*b)).collect()),
        );
    }
    params
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    info!("dlepd v{} starting as {}", VERSION, args.local_type);

    let client = Arc::new(LoggingClient {
        params: TableClient::new(build_params(&args)),
    });

    let mut engine = Engine::new(client).await?;
    info!("engine running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.terminate().await;
    Ok(())
}
