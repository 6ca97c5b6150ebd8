//! The DLEP engine: configuration resolution, listener/connector
//! lifecycle, per-session socket tasks, and the 1 Hz maintenance tick.
//!
//! All protocol state lives in [`DlepCore`] behind one async mutex,
//! locked once at the top of every service call and every socket/timer
//! callback. Socket tasks address peers by peer-id and re-resolve
//! through the peer map on every callback, so a task that fires after
//! its peer is gone simply drops the work.

use crate::client::{ClientError, ClientParams, ConfigValue, DlepClient};
use crate::dataitem::DataItem;
use crate::destadvert::{self, DestAdvert};
use crate::discovery::{self, McastConfig};
use crate::error::ConfigError;
use crate::infobase::InfoBase;
use crate::message::{ProtocolMessage, MAX_SIGNAL_SIZE};
use crate::peer::Peer;
use crate::protocfg::ProtocolConfig;
use crate::types::{now, MacAddress};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV6};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration parameters resolved once at startup.
#[derive(Debug, Clone)]
pub struct Params {
    pub local_type: String,
    pub heartbeat_interval: u64,
    pub heartbeat_threshold: u64,
    pub ack_timeout: u64,
    pub ack_probability: u64,
    pub send_tries: u32,
    pub session_address: Option<IpAddr>,
    pub session_port: u16,
    pub session_iface: String,
    /// IP TTL for session sockets; 0 leaves the system default.
    pub session_ttl: u32,
    pub discovery_enable: bool,
    pub discovery: McastConfig,
    pub dest_advert_enable: bool,
    pub dest_advert: McastConfig,
    pub dest_advert_send_interval: u64,
    pub dest_advert_hold_interval: u64,
    pub dest_advert_expire_count: u64,
    pub dest_advert_rf_id: MacAddress,
}

impl Params {
    pub fn from_client(client: &dyn DlepClient) -> Result<Self, ClientError> {
        let local_type = match client.param_str("local-type") {
            Ok(s) => s,
            Err(ClientError::BadParameterName(_)) => "modem".to_string(),
            Err(e) => return Err(e),
        };

        let session_address = match client.param_addr("session-address") {
            Ok(a) => Some(a),
            Err(ClientError::BadParameterName(_)) => None,
            Err(e) => return Err(e),
        };

        let discovery_mcast = match client.param_addr("discovery-mcast-address") {
            Ok(a) => a,
            Err(ClientError::BadParameterName(_)) => IpAddr::V4(Ipv4Addr::new(224, 0, 0, 117)),
            Err(e) => return Err(e),
        };
        let advert_mcast = match client.param_addr("destination-advert-mcast-address") {
            Ok(a) => a,
            Err(ClientError::BadParameterName(_)) => IpAddr::V4(Ipv4Addr::new(225, 6, 7, 8)),
            Err(e) => return Err(e),
        };

        let rf_id = match client.get_config_parameter("destination-advert-rf-id") {
            Ok(ConfigValue::UIntList(list)) => {
                MacAddress::new(list.into_iter().map(|v| v as u8).collect())
            }
            Ok(ConfigValue::Str(s)) => s
                .parse()
                .map_err(|_| ClientError::BadParameterValue("destination-advert-rf-id".into()))?,
            Ok(_) => {
                return Err(ClientError::BadParameterValue(
                    "destination-advert-rf-id".into(),
                ))
            }
            Err(ClientError::BadParameterName(_)) => MacAddress::empty(),
            Err(e) => return Err(e),
        };

        let dest_advert_send_interval =
            client.param_uint_or("destination-advert-send-interval", 5)?;

        let params = Params {
            local_type,
            heartbeat_interval: client.param_uint_or("heartbeat-interval", 60)?,
            heartbeat_threshold: client.param_uint_or("heartbeat-threshold", 4)?,
            ack_timeout: client.param_uint_or("ack-timeout", 3)?,
            ack_probability: client.param_uint_or("ack-probability", 100)?,
            send_tries: client.param_uint_or("send-tries", 3)? as u32,
            session_address,
            session_port: client.param_uint_or("session-port", 854)? as u16,
            session_iface: client.param_str("session-iface").unwrap_or_default(),
            session_ttl: client.param_uint_or("session-ttl", 0)? as u32,
            discovery_enable: client.param_bool_or("discovery-enable", true)?,
            discovery: McastConfig {
                iface: client.param_str("discovery-iface").unwrap_or_default(),
                address: discovery_mcast,
                port: client.param_uint_or("discovery-port", 854)? as u16,
                ttl: client.param_uint_or("discovery-ttl", 1)? as u32,
                interval: client.param_uint_or("discovery-interval", 60)?,
                send: false,
                receive: false,
            },
            dest_advert_enable: client.param_bool_or("destination-advert-enable", false)?,
            dest_advert: McastConfig {
                iface: client.param_str("destination-advert-iface").unwrap_or_default(),
                address: advert_mcast,
                port: client.param_uint_or("destination-advert-port", 33445)? as u16,
                ttl: 1,
                interval: dest_advert_send_interval.max(1),
                send: dest_advert_send_interval > 0,
                receive: true,
            },
            dest_advert_send_interval,
            dest_advert_hold_interval: client
                .param_uint_or("destination-advert-hold-interval", 0)?,
            dest_advert_expire_count: client
                .param_uint_or("destination-advert-expire-count", 0)?,
            dest_advert_rf_id: rf_id,
        };
        Ok(params)
    }
}

/// All mutable engine state, guarded by one mutex.
pub struct DlepCore {
    pub cfg: Arc<ProtocolConfig>,
    pub client: Arc<dyn DlepClient>,
    pub params: Params,
    pub is_modem: bool,
    pub peers: HashMap<String, Peer>,
    pub info_base: InfoBase,
    pub dest_advert: Option<DestAdvert>,
    pub terminated: bool,
}

impl DlepCore {
    /// Declare a destination up in the local scope and push it to every
    /// in-session peer. False when the MAC already exists locally.
    pub fn local_destination_up(&mut self, mac: &MacAddress, items: Vec<DataItem>) -> bool {
        if !self.info_base.destinations_mut().add(mac, items.clone()) {
            return false;
        }
        for peer_id in self.in_session_peer_ids() {
            self.peer_destination_up(&peer_id, mac, &items);
        }
        true
    }

    /// Remove a local destination everywhere. False when absent.
    pub fn local_destination_down(&mut self, mac: &MacAddress) -> bool {
        if self.info_base.destinations_mut().remove(mac).is_none() {
            return false;
        }
        for peer_id in self.in_session_peer_ids() {
            self.peer_destination_down(&peer_id, mac);
        }
        true
    }

    /// Merge updates into a local destination and notify peers. False
    /// when absent.
    pub fn local_destination_update(&mut self, mac: &MacAddress, items: &[DataItem]) -> bool {
        if !self.info_base.destinations_mut().update(mac, items) {
            return false;
        }
        for peer_id in self.in_session_peer_ids() {
            self.peer_destination_update(&peer_id, mac, items);
        }
        true
    }

    pub(crate) fn in_session_peer_ids(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, p)| p.state == crate::peer::PeerState::InSession)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Which peer session owns this destination, if any.
    pub fn peer_owning_destination(&self, mac: &MacAddress) -> Option<String> {
        self.peers
            .iter()
            .find(|(_, p)| p.dests.contains(mac))
            .map(|(id, _)| id.clone())
    }

    /// Drop peers whose termination handshake has completed.
    pub fn cleanup_ex_peers(&mut self) {
        let gone: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.state == crate::peer::PeerState::Terminating && p.removable)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in gone {
            info!("removing ex-peer {}", peer_id);
            self.peers.remove(&peer_id);
        }
    }
}

/// The running engine. Dropping it does not stop the tasks; call
/// [`Engine::terminate`] for an orderly shutdown.
pub struct Engine {
    core: Arc<Mutex<DlepCore>>,
    cfg: Arc<ProtocolConfig>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Load the protocol configuration, resolve parameters, bind the
    /// session transport, and start the engine tasks.
    pub async fn new(client: Arc<dyn DlepClient>) -> Result<Engine, EngineError> {
        let config_file = client.param_str("protocol-config-file")?;
        let cfg = Arc::new(ProtocolConfig::load(Path::new(&config_file))?);
        if let Ok(schema) = client.param_str("protocol-config-schema") {
            // Schema conformance is checked structurally during load.
            debug!("schema reference {} noted", schema);
        }

        let params = Params::from_client(client.as_ref())?;
        let is_modem = params.local_type == "modem";
        info!(
            "I am a {}, protocol version {:?}",
            params.local_type,
            cfg.version()
        );

        let dest_advert = if is_modem && params.dest_advert_enable {
            Some(DestAdvert::new(
                params.dest_advert_rf_id.clone(),
                params.dest_advert_send_interval as u32,
                params.dest_advert_hold_interval,
                params.dest_advert_expire_count,
            ))
        } else {
            None
        };

        let core = Arc::new(Mutex::new(DlepCore {
            cfg: cfg.clone(),
            client,
            params: params.clone(),
            is_modem,
            peers: HashMap::new(),
            info_base: InfoBase::new(),
            dest_advert,
            terminated: false,
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if is_modem {
            let bind = session_endpoint(&params);
            let listener = TcpListener::bind(bind).await?;
            info!("listening for sessions on {}", listener.local_addr()?);
            tasks.push(tokio::spawn(run_acceptor(
                listener,
                core.clone(),
                shutdown_rx.clone(),
            )));

            if params.discovery_enable {
                let mcast = McastConfig {
                    send: false,
                    receive: true,
                    ..params.discovery.clone()
                };
                tasks.push(tokio::spawn(discovery::run_modem(
                    core.clone(),
                    mcast,
                    shutdown_rx.clone(),
                )));
            }
            if params.dest_advert_enable {
                tasks.push(tokio::spawn(destadvert::run(
                    core.clone(),
                    params.dest_advert.clone(),
                    shutdown_rx.clone(),
                )));
            }
        } else if params.discovery_enable {
            let mcast = McastConfig {
                send: true,
                receive: false,
                ..params.discovery.clone()
            };
            tasks.push(tokio::spawn(discovery::run_router(
                core.clone(),
                mcast,
                shutdown_rx.clone(),
            )));
        } else if params.session_address.is_some() {
            let target = session_endpoint(&params);
            tasks.push(tokio::spawn(run_connector(
                target,
                core.clone(),
                shutdown_rx.clone(),
            )));
        } else {
            warn!("router has discovery disabled and no session-address; no peers will form");
        }

        tasks.push(tokio::spawn(run_tick(core.clone(), shutdown_rx)));

        Ok(Engine {
            core,
            cfg,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn core(&self) -> &Arc<Mutex<DlepCore>> {
        &self.core
    }

    pub fn protocol_config(&self) -> Arc<ProtocolConfig> {
        self.cfg.clone()
    }

    /// Orderly shutdown: terminate every session, stop the workers,
    /// and drain the tasks.
    pub async fn terminate(&mut self) {
        {
            let mut core = self.core.lock().await;
            core.terminated = true;
            let peer_ids: Vec<String> = core.peers.keys().cloned().collect();
            for peer_id in peer_ids {
                core.terminate_peer(&peer_id, crate::types::strings::SUCCESS, "shutting down");
            }
        }
        // Give the termination messages a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Bind/connect endpoint for the session transport, with the interface
/// scope applied to link-local IPv6 addresses.
fn session_endpoint(params: &Params) -> SocketAddr {
    let addr = params
        .session_address
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if let IpAddr::V6(v6) = addr {
        if v6.segments()[0] & 0xffc0 == 0xfe80 {
            let scope = crate::netutils::ifindex(&params.session_iface).unwrap_or(0);
            return SocketAddr::V6(SocketAddrV6::new(v6, params.session_port, 0, scope));
        }
    }
    SocketAddr::new(addr, params.session_port)
}

/// Accept loop (modem role).
async fn run_acceptor(
    listener: TcpListener,
    core: Arc<Mutex<DlepCore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    start_session(core.clone(), stream, shutdown.clone()).await;
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Direct connector (router role with discovery disabled). Retries
/// until the modem answers.
async fn run_connector(
    target: SocketAddr,
    core: Arc<Mutex<DlepCore>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            connected = TcpStream::connect(target) => match connected {
                Ok(stream) => {
                    start_session(core.clone(), stream, shutdown.clone()).await;
                    return;
                }
                Err(e) => {
                    debug!("cannot connect to {}: {}, retrying", target, e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

/// Register a new peer session on an established TCP stream and spawn
/// its reader and writer tasks.
pub(crate) async fn start_session(
    core: Arc<Mutex<DlepCore>>,
    stream: TcpStream,
    shutdown: watch::Receiver<bool>,
) {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!("no peer address: {}", e);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!("cannot disable Nagle for {}: {}", addr, e);
    }
    let peer_id = addr.to_string();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let cfg = {
        let mut core_guard = core.lock().await;
        if core_guard.terminated {
            return;
        }
        // One session per remote endpoint.
        if core_guard.peers.contains_key(&peer_id) {
            warn!("already have a session for {}", peer_id);
            return;
        }
        let ttl = core_guard.params.session_ttl;
        if ttl > 0 {
            if let Err(e) = stream.set_ttl(ttl) {
                debug!("cannot set TTL for {}: {}", addr, e);
            }
        }
        core_guard
            .peers
            .insert(peer_id.clone(), Peer::new(addr, tx));
        core_guard.start_peer(&peer_id);
        core_guard.cfg.clone()
    };
    let (mut read_half, mut write_half) = stream.into_split();

    // Writer: drain the peer's channel onto the socket.
    {
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("write to peer={} failed: {}", peer_id, e);
                    break;
                }
            }
        });
    }

    // Reader: reassemble complete messages and dispatch under the core
    // lock.
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::select! {
                _ = shutdown.changed() => break,
                read = read_half.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("read from peer={} failed: {}", peer_id, e);
                        break;
                    }
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match ProtocolMessage::is_complete_message(&cfg, &buf) {
                    Some(size) if size > MAX_SIGNAL_SIZE => {
                        error!("oversized message ({} bytes) from peer={}", size, peer_id);
                        core.lock().await.terminate_peer(
                            &peer_id,
                            crate::types::strings::INVALID_MESSAGE,
                            "oversized message",
                        );
                        buf.clear();
                        break;
                    }
                    Some(size) if buf.len() >= size => {
                        let msg: Vec<u8> = buf.drain(..size).collect();
                        core.lock().await.handle_peer_message(&peer_id, &msg);
                    }
                    _ => break,
                }
            }
        }
        core.lock().await.connection_closed(&peer_id);
    });
}

/// 1 Hz maintenance: heartbeats, inactivity, retransmission, the
/// advertisement purge, and ex-peer cleanup.
async fn run_tick(core: Arc<Mutex<DlepCore>>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let mut core = core.lock().await;
                let current_time = now();
                core.peer_tick(current_time);
                core.purge_advertisements(current_time);
                core.cleanup_ex_peers();
            }
        }
    }
}
