//! Peer discovery over UDP multicast.
//!
//! The router multicasts Peer Discovery signals on a configured group;
//! a modem with no session for the sender answers with a unicast Peer
//! Offer naming the TCP connection point, and the router connects. The
//! same socket options serve the destination-advertisement worker, so
//! the multicast parameters live in one [`McastConfig`].

use crate::client::ClientParams;
use crate::engine::{self, DlepCore};
use crate::dataitem::{DataItem, DataItemValue};
use crate::message::{ProtocolMessage, MAX_SIGNAL_SIZE};
use crate::netutils;
use crate::types::strings;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// One multicast worker's parameters.
#[derive(Debug, Clone)]
pub struct McastConfig {
    pub iface: String,
    pub address: IpAddr,
    pub port: u16,
    pub ttl: u32,
    /// Seconds between periodic sends.
    pub interval: u64,
    pub send: bool,
    pub receive: bool,
}

/// Open a UDP socket configured for this worker: bound to the group
/// port when receiving (with the group joined), ephemeral when only
/// sending.
pub fn open_socket(cfg: &McastConfig) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = match cfg.address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_port = if cfg.receive { cfg.port } else { 0 };
    let bind_addr: SocketAddr = match cfg.address {
        IpAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), bind_port),
        IpAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), bind_port),
    };
    socket.bind(&bind_addr.into())?;

    match cfg.address {
        IpAddr::V4(group) => {
            if cfg.receive {
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            }
            if cfg.send {
                socket.set_multicast_ttl_v4(cfg.ttl)?;
            }
        }
        IpAddr::V6(group) => {
            let index = netutils::ifindex(&cfg.iface).unwrap_or(0);
            if cfg.receive {
                socket.join_multicast_v6(&group, index)?;
            }
            if cfg.send {
                socket.set_multicast_hops_v6(cfg.ttl)?;
            }
        }
    }

    UdpSocket::from_std(socket.into())
}

/// Router side: multicast Peer Discovery on the configured interval and
/// open a session toward every Peer Offer that answers.
pub async fn run_router(
    core: Arc<Mutex<DlepCore>>,
    mcast: McastConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match open_socket(&mcast) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open discovery socket: {}", e);
            return;
        }
    };
    let group = SocketAddr::new(mcast.address, mcast.port);
    let mut send_timer = tokio::time::interval(Duration::from_secs(mcast.interval.max(1)));
    let mut buf = vec![0u8; MAX_SIGNAL_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = send_timer.tick() => {
                let bytes = {
                    let core = core.lock().await;
                    match ProtocolMessage::with_header(core.cfg.clone(), strings::PEER_DISCOVERY) {
                        Ok(pm) => Some(pm.buffer().to_vec()),
                        Err(e) => {
                            warn!("cannot build peer discovery: {}", e);
                            None
                        }
                    }
                };
                if let Some(bytes) = bytes {
                    debug!("sending peer discovery to {}", group);
                    if let Err(e) = socket.send_to(&bytes, group).await {
                        warn!("peer discovery send failed: {}", e);
                    }
                }
            }
            result = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = result else { break };
                handle_peer_offer(&core, &buf[..len], from, shutdown.clone()).await;
            }
        }
    }
}

async fn handle_peer_offer(
    core: &Arc<Mutex<DlepCore>>,
    bytes: &[u8],
    from: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let target = {
        let core_guard = core.lock().await;
        let mut pm = ProtocolMessage::new(core_guard.cfg.clone());
        // The offer came from the modem.
        if let Err(err) = pm.parse_and_validate(bytes, true, true) {
            warn!("bad signal from {}: {}", from, err);
            return;
        }
        if pm.signal_name() != strings::PEER_OFFER {
            return;
        }
        let target = peer_offer_target(&pm, from, core_guard.params.session_port);
        if core_guard.peers.contains_key(&target.to_string()) {
            debug!("already have a session with {}", target);
            return;
        }
        target
    };

    info!("peer offer from {}, connecting to {}", from, target);
    let core = core.clone();
    tokio::spawn(async move {
        match TcpStream::connect(target).await {
            Ok(stream) => engine::start_session(core, stream, shutdown).await,
            Err(e) => warn!("cannot connect to {}: {}", target, e),
        }
    });
}

/// Pick the TCP endpoint named by a Peer Offer. Address items are
/// consulted in the order IPv4 Address, IPv4 Connection Point, IPv6
/// Address, IPv6 Connection Point, later entries overriding earlier
/// ones; the offer's source fills any gap. Link-local IPv6 targets
/// without a scope inherit the source's scope id.
fn peer_offer_target(pm: &ProtocolMessage, from: SocketAddr, default_port: u16) -> SocketAddr {
    let mut ip = from.ip();
    let mut port = default_port;

    if let Ok(p) = pm.get_port() {
        port = p;
    }
    if let Ok((_, v4)) = pm.get_ipv4_address() {
        ip = IpAddr::V4(v4);
    }
    if let Ok((_, v4, p)) = pm.get_ipv4_conn_point() {
        ip = IpAddr::V4(v4);
        if p != 0 {
            port = p;
        }
    }
    if let Ok((_, v6)) = pm.get_ipv6_address() {
        ip = IpAddr::V6(v6);
    }
    if let Ok((_, v6, p)) = pm.get_ipv6_conn_point() {
        ip = IpAddr::V6(v6);
        if p != 0 {
            port = p;
        }
    }

    if let IpAddr::V6(v6) = ip {
        // fe80::/10
        let link_local = v6.segments()[0] & 0xffc0 == 0xfe80;
        if link_local {
            if let SocketAddr::V6(src) = from {
                return SocketAddr::V6(SocketAddrV6::new(v6, port, 0, src.scope_id()));
            }
        }
    }
    SocketAddr::new(ip, port)
}

/// Modem side: listen on the multicast group and answer Peer Discovery
/// from unknown routers with a unicast Peer Offer.
pub async fn run_modem(
    core: Arc<Mutex<DlepCore>>,
    mcast: McastConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match open_socket(&mcast) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open discovery socket: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; MAX_SIGNAL_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = result else { break };
                let reply = {
                    let core = core.lock().await;
                    let mut pm = ProtocolMessage::new(core.cfg.clone());
                    // Discovery comes from the router.
                    if let Err(err) = pm.parse_and_validate(&buf[..len], true, false) {
                        warn!("bad signal from {}: {}", from, err);
                        continue;
                    }
                    if pm.signal_name() != strings::PEER_DISCOVERY {
                        continue;
                    }
                    let have_session = core
                        .peers
                        .values()
                        .any(|p| p.addr.ip() == from.ip());
                    if have_session {
                        debug!("ignoring peer discovery from {}: session exists", from);
                        None
                    } else {
                        build_peer_offer(&core)
                    }
                };
                if let Some(bytes) = reply {
                    info!("sending peer offer to {}", from);
                    if let Err(e) = socket.send_to(&bytes, from).await {
                        warn!("peer offer send failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Build the Peer Offer naming our session connection point. Connection
/// point items are preferred when the catalog defines them; otherwise
/// plain address plus Port items.
fn build_peer_offer(core: &DlepCore) -> Option<Vec<u8>> {
    let cfg = core.cfg.clone();
    let mut pm = match ProtocolMessage::with_header(cfg.clone(), strings::PEER_OFFER) {
        Ok(pm) => pm,
        Err(e) => {
            warn!("cannot build peer offer: {}", e);
            return None;
        }
    };

    let addr = core
        .client
        .param_addr("session-address")
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let port = core.params.session_port;

    let build = (|| {
        match addr {
            IpAddr::V4(v4) if !v4.is_unspecified() => {
                if cfg.get_data_item_info(strings::IPV4_CONNECTION_POINT).is_ok() {
                    pm.add_data_item(DataItem::new(
                        strings::IPV4_CONNECTION_POINT,
                        DataItemValue::U8Ipv4U16(0, v4, port),
                        &cfg,
                        None,
                    )?)?;
                } else {
                    pm.add_data_item(DataItem::new(
                        strings::IPV4_ADDRESS,
                        DataItemValue::U8Ipv4(1, v4),
                        &cfg,
                        None,
                    )?)?;
                    pm.add_data_item(DataItem::new(
                        strings::PORT,
                        DataItemValue::U16(port),
                        &cfg,
                        None,
                    )?)?;
                }
            }
            IpAddr::V6(v6) if !v6.is_unspecified() => {
                if cfg.get_data_item_info(strings::IPV6_CONNECTION_POINT).is_ok() {
                    pm.add_data_item(DataItem::new(
                        strings::IPV6_CONNECTION_POINT,
                        DataItemValue::U8Ipv6U16(0, v6, port),
                        &cfg,
                        None,
                    )?)?;
                } else {
                    pm.add_data_item(DataItem::new(
                        strings::IPV6_ADDRESS,
                        DataItemValue::U8Ipv6(1, v6),
                        &cfg,
                        None,
                    )?)?;
                    pm.add_data_item(DataItem::new(
                        strings::PORT,
                        DataItemValue::U16(port),
                        &cfg,
                        None,
                    )?)?;
                }
            }
            _ => {
                // No usable session address; the router falls back to
                // the offer's source address.
            }
        }
        Ok::<(), crate::message::MessageError>(())
    })();

    match build {
        Ok(()) => Some(pm.buffer().to_vec()),
        Err(e) => {
            warn!("cannot build peer offer: {}", e);
            None
        }
    }
}
