//! Per-peer session state and protocol message handling.
//!
//! A [`Peer`] is pure state: the session FSM, the per-destination
//! pending-response queues, the peer's slice of the information base, and
//! the writer channel its socket task drains. All protocol behavior runs
//! as methods on [`DlepCore`] so a handler can reach the information
//! base, the other peers (for the IP invariants), and the client
//! callbacks under the one core lock.

use crate::dataitem::{DataItem, IpFlags};
use crate::engine::DlepCore;
use crate::infobase::{apply_data_item_updates, DestinationMap};
use crate::message::ProtocolMessage;
use crate::protocfg::{FailureMode, Units};
use crate::types::{now, strings, ExtensionId, MacAddress, SignalId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// TCP is up, session negotiation is not done.
    Connected,
    /// Both sides completed the Session Initialization exchange.
    InSession,
    /// Termination sent or received; waiting for the cleanup sweep.
    Terminating,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Connected => "connected",
            PeerState::InSession => "in session",
            PeerState::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// A sent message awaiting its response. At most one entry per queue is
/// in flight; the rest wait their turn.
#[derive(Debug)]
pub struct ResponsePending {
    pub msg: Vec<u8>,
    pub msg_name: String,
    pub response_name: String,
    pub response_id: SignalId,
    /// Empty MAC for session-scoped messages.
    pub destination: MacAddress,
    pub send_time: u64,
    pub send_tries: u32,
}

/// Connected peer with full session state.
pub struct Peer {
    pub peer_id: String,
    pub addr: SocketAddr,
    pub state: PeerState,

    // Learned during session initialization
    pub peer_type: String,
    pub experiment_names: Vec<String>,
    pub extensions: Vec<ExtensionId>,
    /// Heartbeat interval exactly as the peer sent it.
    pub heartbeat_interval: u32,
    /// The same interval normalized to seconds.
    pub heartbeat_interval_secs: u64,

    /// Session-level data items from the peer (metrics, IP addresses).
    pub peer_data: Vec<DataItem>,
    /// Destinations owned by this peer.
    pub dests: DestinationMap,
    /// Destinations the peer declined with Not_Interested.
    pub not_interested: HashSet<MacAddress>,
    /// Response message owed per destination after a deferred announce.
    pub needs_response: HashMap<MacAddress, String>,

    /// Pending-response FIFO queues keyed by destination MAC.
    pub pending: HashMap<MacAddress, VecDeque<ResponsePending>>,

    pub last_recv: u64,
    pub last_heartbeat: u64,
    /// Set when the termination handshake finished; the cleanup sweep
    /// removes the peer.
    pub removable: bool,

    tx: mpsc::Sender<Vec<u8>>,
}

impl Peer {
    pub fn new(addr: SocketAddr, tx: mpsc::Sender<Vec<u8>>) -> Self {
        let ts = now();
        Self {
            peer_id: addr.to_string(),
            addr,
            state: PeerState::Connected,
            peer_type: String::new(),
            experiment_names: Vec::new(),
            extensions: Vec::new(),
            heartbeat_interval: 0,
            heartbeat_interval_secs: 0,
            peer_data: Vec::new(),
            dests: DestinationMap::new(),
            not_interested: HashSet::new(),
            needs_response: HashMap::new(),
            pending: HashMap::new(),
            last_recv: ts,
            last_heartbeat: ts,
            removable: false,
            tx,
        }
    }

    /// Hand serialized bytes to the writer task.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.try_send(bytes).is_ok()
    }

    pub fn is_not_interested(&self, mac: &MacAddress) -> bool {
        self.not_interested.contains(mac)
    }

    pub fn get_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            peer_type: self.peer_type.clone(),
            state: self.state,
            extensions: self.extensions.clone(),
            experiment_names: self.experiment_names.clone(),
            heartbeat_interval: self.heartbeat_interval,
            data_items: self.peer_data.clone(),
            destinations: self.dests.macs(),
        }
    }

    /// Owner label for an equal IP held by this peer, session level or
    /// destination level.
    pub fn find_ip_data_item(&self, ip_item: &DataItem) -> Option<String> {
        if ip_item.find_ip_data_item(&self.peer_data).is_some() {
            return Some(self.peer_id.clone());
        }
        self.dests
            .find_ip_data_item(ip_item)
            .map(|mac| format!("{} destination {}", self.peer_id, mac))
    }
}

/// Peer snapshot for the client.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub peer_id: String,
    pub peer_type: String,
    pub state: PeerState,
    pub extensions: Vec<ExtensionId>,
    pub experiment_names: Vec<String>,
    pub heartbeat_interval: u32,
    pub data_items: Vec<DataItem>,
    pub destinations: Vec<MacAddress>,
}

impl DlepCore {
    // ------------------------------------------------------------------
    // Session start

    /// Called once the transport is up. The router initiates the
    /// session handshake; the modem waits for it.
    pub fn start_peer(&mut self, peer_id: &str) {
        if !self.is_modem {
            let mut pm = match ProtocolMessage::with_header(
                self.cfg.clone(),
                strings::SESSION_INITIALIZATION,
            ) {
                Ok(pm) => pm,
                Err(e) => {
                    error!("cannot build session initialization: {}", e);
                    return;
                }
            };
            let build = pm
                .add_common_data_items(self.client.as_ref())
                .and_then(|_| pm.add_heartbeat_interval(self.client.as_ref()))
                .and_then(|_| {
                    let extids = self.cfg.extension_ids();
                    if extids.is_empty() {
                        Ok(())
                    } else {
                        pm.add_extensions(&extids)
                    }
                });
            if let Err(e) = build {
                error!("cannot build session initialization: {}", e);
                return;
            }
            self.send_message(peer_id, pm, MacAddress::empty());
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch

    /// Entry point for one complete message read from the peer's TCP
    /// stream.
    pub fn handle_peer_message(&mut self, peer_id: &str, buf: &[u8]) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        peer.last_recv = now();

        let mut pm = ProtocolMessage::new(self.cfg.clone());
        // The sender is the remote side.
        let modem_sender = !self.is_modem;
        if let Err(err) = pm.parse_and_validate(buf, false, modem_sender) {
            warn!("invalid message from peer={}: {}", peer_id, err);
            self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &err);
            return;
        }

        if self.check_status_code_failure(peer_id, &pm) {
            return;
        }

        match pm.signal_name() {
            strings::HEARTBEAT => {}
            strings::SESSION_INITIALIZATION => self.handle_session_init(peer_id, &pm),
            strings::SESSION_INITIALIZATION_RESPONSE => {
                self.handle_session_init_response(peer_id, &pm)
            }
            strings::SESSION_UPDATE => self.handle_session_update(peer_id, &pm),
            strings::SESSION_UPDATE_RESPONSE => {
                let _ = self.handle_response(peer_id, &pm);
            }
            strings::SESSION_TERMINATION => self.handle_session_termination(peer_id),
            strings::SESSION_TERMINATION_RESPONSE => {
                self.handle_session_termination_response(peer_id, &pm)
            }
            strings::DESTINATION_UP => {
                // Older drafts use Destination Up router-to-modem where
                // later ones use Destination Announce.
                if self.is_modem {
                    self.handle_destination_announce(peer_id, &pm)
                } else {
                    self.handle_destination_up(peer_id, &pm)
                }
            }
            strings::DESTINATION_UP_RESPONSE | strings::DESTINATION_ANNOUNCE_RESPONSE => {
                self.handle_destination_up_response(peer_id, &pm)
            }
            strings::DESTINATION_ANNOUNCE => self.handle_destination_announce(peer_id, &pm),
            strings::DESTINATION_DOWN => self.handle_destination_down(peer_id, &pm),
            strings::DESTINATION_DOWN_RESPONSE => {
                let _ = self.handle_response(peer_id, &pm);
            }
            strings::DESTINATION_UPDATE => self.handle_destination_update(peer_id, &pm),
            strings::LINK_CHARACTERISTICS_REQUEST => {
                self.handle_linkchar_request(peer_id, &pm)
            }
            strings::LINK_CHARACTERISTICS_RESPONSE => {
                self.handle_linkchar_response(peer_id, &pm)
            }
            other => error!("unhandled message {} from peer={}", other, peer_id),
        }
    }

    /// Terminate on any status code configured with failure_mode
    /// terminate, echoing the same status back. Termination messages are
    /// exempt; their handlers own the shutdown.
    fn check_status_code_failure(&mut self, peer_id: &str, pm: &ProtocolMessage) -> bool {
        let name = pm.signal_name();
        if name == strings::SESSION_TERMINATION || name == strings::SESSION_TERMINATION_RESPONSE {
            return false;
        }
        let Ok(Some(status_name)) = pm.get_status() else {
            return false;
        };
        let fatal = self
            .cfg
            .get_status_code_info(&status_name)
            .map(|info| info.failure_mode == FailureMode::Terminate)
            .unwrap_or(false);
        if fatal {
            error!(
                "{} from peer={} contained termination status={}",
                name, peer_id, status_name
            );
            self.terminate_peer(peer_id, &status_name, name);
        }
        fatal
    }

    // ------------------------------------------------------------------
    // Session establishment

    fn record_session_data(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let peer_type = pm.get_peer_type().unwrap_or_default();
        let experiment_names = pm.get_experiment_names().unwrap_or_default();
        let peer_extensions = pm.get_extensions().unwrap_or_default();
        let my_extensions = self.cfg.extension_ids();

        let (raw, secs) = match pm.get_heartbeat_interval() {
            Ok(raw) => (raw, self.heartbeat_to_seconds(raw)),
            Err(_) => (0, 0),
        };

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.peer_type = peer_type;
            peer.experiment_names = experiment_names;
            peer.extensions = peer_extensions
                .into_iter()
                .filter(|ext| my_extensions.contains(ext))
                .collect();
            peer.heartbeat_interval = raw;
            peer.heartbeat_interval_secs = secs;
        }
    }

    /// The peer's interval arrives in the units both sides configured
    /// for Heartbeat_Interval; normalize to whole seconds.
    fn heartbeat_to_seconds(&self, raw: u32) -> u64 {
        let units = self
            .cfg
            .get_data_item_info(strings::HEARTBEAT_INTERVAL)
            .map(|info| info.units)
            .unwrap_or(Units::None);
        let divisor: u64 = match units {
            Units::Milliseconds => 1_000,
            Units::Microseconds => 1_000_000,
            _ => 1,
        };
        (u64::from(raw) + divisor / 2) / divisor
    }

    fn check_version(&mut self, peer_id: &str, pm: &ProtocolMessage) -> bool {
        if let Ok([major, _minor]) = pm.get_version() {
            let ours = self.cfg.version();
            if major != ours[0] {
                let reason = format!(
                    "peer speaks version {} but this node speaks {}",
                    major, ours[0]
                );
                self.terminate_peer(peer_id, strings::INVALID_DATA, &reason);
                return false;
            }
        }
        true
    }

    /// Session Initialization, router to modem.
    fn handle_session_init(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        if let Err(err) = self.validate_ip_data_items(pm.data_items(), &[]) {
            self.terminate_peer(peer_id, strings::INCONSISTENT_DATA, &err);
            return;
        }
        if !self.check_version(peer_id, pm) {
            return;
        }
        self.record_session_data(peer_id, pm);

        if !self.send_session_init_response(peer_id) {
            return;
        }
        self.session_up(peer_id, Vec::new());

        // With destination advertisement running, our own advertisement
        // carries the attached router's MAC so peer modems can translate
        // rf-ids into it.
        if self.dest_advert.is_some() {
            if let Some(peer) = self.peers.get(peer_id) {
                let iface = self
                    .client
                    .as_ref()
                    .get_config_parameter("discovery-iface")
                    .ok()
                    .and_then(|v| match v {
                        crate::client::ConfigValue::Str(s) => Some(s),
                        _ => None,
                    })
                    .unwrap_or_default();
                match crate::netutils::arp_lookup(&peer.addr.ip(), &iface) {
                    Some(mac) => {
                        info!("advertising router peer mac {}", mac);
                        if let Some(da) = &mut self.dest_advert {
                            da.add_destination(&mac);
                        }
                    }
                    None => warn!(
                        "cannot resolve MAC for router peer {}; not advertised",
                        peer_id
                    ),
                }
            }
        }
    }

    /// Session Initialization Response, modem to router.
    fn handle_session_init_response(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        if !self.handle_response(peer_id, pm) {
            return;
        }
        if !self.check_version(peer_id, pm) {
            return;
        }
        self.record_session_data(peer_id, pm);
        let metrics = pm.metrics_and_ipaddrs().unwrap_or_default();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.peer_data = metrics.clone();
        }
        self.session_up(peer_id, metrics);
    }

    fn send_session_init_response(&mut self, peer_id: &str) -> bool {
        let mut pm = match ProtocolMessage::with_header(
            self.cfg.clone(),
            strings::SESSION_INITIALIZATION_RESPONSE,
        ) {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build session initialization response: {}", e);
                return false;
            }
        };
        let extensions = self
            .peers
            .get(peer_id)
            .map(|p| p.extensions.clone())
            .unwrap_or_default();
        let local_items = self.info_base.peer_data().to_vec();
        let build = pm
            .add_status(strings::SUCCESS, "")
            .and_then(|_| pm.add_common_data_items(self.client.as_ref()))
            .and_then(|_| pm.add_heartbeat_interval(self.client.as_ref()))
            .and_then(|_| {
                if extensions.is_empty() {
                    Ok(())
                } else {
                    pm.add_extensions(&extensions)
                }
            })
            .and_then(|_| pm.add_allowed_data_items(&local_items));
        if let Err(e) = build {
            error!("cannot build session initialization response: {}", e);
            return false;
        }
        self.send_to_peer(peer_id, pm.buffer().to_vec());
        true
    }

    /// Common InSession transition: notify the client and push all local
    /// destinations to the new peer.
    fn session_up(&mut self, peer_id: &str, data_items: Vec<DataItem>) {
        let info = {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                return;
            };
            peer.state = PeerState::InSession;
            let mut info = peer.get_info();
            info.data_items = data_items;
            info
        };
        info!("peer={} is up", peer_id);
        let client = self.client.clone();
        client.peer_up(&info);
        self.send_all_destinations(peer_id);
    }

    // ------------------------------------------------------------------
    // Session update / termination

    fn handle_session_update(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let existing = self
            .peers
            .get(peer_id)
            .map(|p| p.peer_data.clone())
            .unwrap_or_default();
        if let Err(err) = self.validate_ip_data_items(pm.data_items(), &existing) {
            self.terminate_peer(peer_id, strings::INCONSISTENT_DATA, &err);
            return;
        }
        if let Some(peer) = self.peers.get_mut(peer_id) {
            apply_data_item_updates(&mut peer.peer_data, pm.data_items());
        }
        let client = self.client.clone();
        client.peer_update(peer_id, pm.data_items());
        self.send_simple_response(
            peer_id,
            strings::SESSION_UPDATE_RESPONSE,
            strings::SUCCESS,
            "",
            None,
        );
    }

    fn handle_session_termination(&mut self, peer_id: &str) {
        self.send_simple_response(
            peer_id,
            strings::SESSION_TERMINATION_RESPONSE,
            strings::SUCCESS,
            "",
            None,
        );
        self.set_peer_terminating(peer_id);
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.removable = true;
        }
    }

    fn handle_session_termination_response(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let terminating = self
            .peers
            .get(peer_id)
            .map(|p| p.state == PeerState::Terminating)
            .unwrap_or(false);
        if terminating {
            let _ = self.handle_response(peer_id, pm);
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.removable = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Destination handlers

    /// Destination Up from the owning peer (on the router, and on either
    /// side when a response carrying destination data arrives).
    fn handle_destination_up(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let mac = match pm.get_mac() {
            Ok(mac) => mac,
            Err(e) => {
                self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &e.to_string());
                return;
            }
        };
        info!("{} from peer={} destination={}", pm.signal_name(), peer_id, mac);

        let already = self
            .peers
            .get(peer_id)
            .map(|p| p.dests.contains(&mac))
            .unwrap_or(false);

        let status_name;
        if already {
            // A second Destination Up for the same MAC is a protocol
            // error on the sender's part.
            status_name = strings::INVALID_MESSAGE.to_string();
        } else {
            let items = pm.data_items_no_mac().unwrap_or_default();
            if let Err(err) = self.validate_ip_data_items(&items, &[]) {
                self.terminate_peer(peer_id, strings::INCONSISTENT_DATA, &err);
                return;
            }
            if let Some(peer) = self.peers.get_mut(peer_id) {
                if peer.not_interested.remove(&mac) {
                    info!("peer={} regains interest in destination={}", peer_id, mac);
                }
            }

            let client = self.client.clone();
            let mut status = client.destination_up(peer_id, &mac, &items);
            if status.is_empty() {
                status = strings::SUCCESS.to_string();
            }
            if status == strings::SUCCESS {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.dests.add(&mac, items);
                }
            } else if status == strings::NOT_INTERESTED {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.not_interested.insert(mac.clone());
                }
            }
            status_name = status;
        }

        let response = self
            .cfg
            .get_message_response_name(pm.signal_name())
            .ok()
            .flatten()
            .map(|s| s.to_string());
        if let Some(response) = response {
            self.send_simple_response(peer_id, &response, &status_name, "", Some(&mac));
        }
    }

    /// Destination Up Response and Destination Announce Response.
    fn handle_destination_up_response(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let Ok(mac) = pm.get_mac() else {
            self.terminate_peer(
                peer_id,
                strings::INVALID_MESSAGE,
                "response without MAC address",
            );
            return;
        };
        if !self.handle_response(peer_id, pm) {
            return;
        }

        if let Ok(Some(status_name)) = pm.get_status() {
            if status_name == strings::NOT_INTERESTED {
                info!("peer={} is not interested in destination={}", peer_id, mac);
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.not_interested.insert(mac.clone());
                }
            }
            if status_name != strings::SUCCESS {
                return;
            }
        }

        // On the router the modem's announce response carries the real
        // destination data; treat it as a Destination Up.
        if !self.is_modem {
            self.handle_destination_up(peer_id, pm);
        }
    }

    /// Destination Announce (or old-draft Destination Up) from the
    /// router, handled on the modem.
    fn handle_destination_announce(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let mac = match pm.get_mac() {
            Ok(mac) => mac,
            Err(e) => {
                self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &e.to_string());
                return;
            }
        };
        let Ok(Some(response_name)) = self.cfg.get_message_response_name(pm.signal_name())
        else {
            error!("{} has no configured response", pm.signal_name());
            return;
        };
        let response_name = response_name.to_string();

        let already = self
            .peers
            .get(peer_id)
            .map(|p| p.dests.contains(&mac))
            .unwrap_or(false);
        if already {
            self.send_simple_response(
                peer_id,
                &response_name,
                strings::INVALID_MESSAGE,
                "",
                Some(&mac),
            );
            return;
        }

        let items = pm.data_items_no_mac().unwrap_or_default();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if peer.not_interested.remove(&mac) {
                info!("peer={} regains interest in destination={}", peer_id, mac);
            }
            peer.dests.add(&mac, items.clone());
        }

        // Locally-owned destination: answer right away with our data.
        if let Some(local_items) = self.info_base.destinations().get(&mac) {
            let local_items = local_items.to_vec();
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.needs_response.insert(mac.clone(), response_name);
            }
            self.peer_destination_up(peer_id, &mac, &local_items);
            return;
        }

        // Otherwise the client decides; the response is deferred until
        // the client declares the destination up.
        let client = self.client.clone();
        let mut status = client.destination_up(peer_id, &mac, &items);
        if status.is_empty() {
            status = strings::SUCCESS.to_string();
        }
        if status == strings::SUCCESS {
            if let Some(peer) = self.peers.get_mut(peer_id) {
                peer.needs_response.insert(mac, response_name);
            }
        } else {
            self.send_simple_response(peer_id, &response_name, &status, "", Some(&mac));
        }
    }

    fn handle_destination_update(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let mac = match pm.get_mac() {
            Ok(mac) => mac,
            Err(e) => {
                self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &e.to_string());
                return;
            }
        };
        let existing = self
            .peers
            .get(peer_id)
            .and_then(|p| p.dests.get(&mac))
            .map(|items| items.to_vec());

        let Some(existing) = existing else {
            error!("update for unknown destination={} from peer={}", mac, peer_id);
            self.terminate_peer(peer_id, strings::INVALID_MESSAGE, "unknown destination");
            return;
        };

        let updates = pm.data_items_no_mac().unwrap_or_default();
        if let Err(err) = self.validate_ip_data_items(&updates, &existing) {
            self.terminate_peer(peer_id, strings::INCONSISTENT_DATA, &err);
            return;
        }
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.dests.update(&mac, &updates);
        }
        let client = self.client.clone();
        client.destination_update(peer_id, &mac, &updates);
    }

    fn handle_destination_down(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let mac = match pm.get_mac() {
            Ok(mac) => mac,
            Err(e) => {
                self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &e.to_string());
                return;
            }
        };
        info!("destination down from peer={} destination={}", peer_id, mac);

        let removed = self
            .peers
            .get_mut(peer_id)
            .map(|p| p.dests.remove(&mac).is_some())
            .unwrap_or(false);

        if !removed {
            if self.info_base.destinations().contains(&mac) {
                // The peer is telling us it no longer wants updates
                // about a destination we own.
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    info!("peer={} is not interested in destination={}", peer_id, mac);
                    peer.not_interested.insert(mac.clone());
                }
            } else {
                let reason = format!("destination={} does not exist", mac);
                self.terminate_peer(peer_id, strings::INVALID_DESTINATION, &reason);
                return;
            }
        }

        let client = self.client.clone();
        client.destination_down(peer_id, &mac);
        self.send_simple_response(
            peer_id,
            strings::DESTINATION_DOWN_RESPONSE,
            strings::SUCCESS,
            "",
            Some(&mac),
        );
    }

    // ------------------------------------------------------------------
    // Link characteristics

    fn handle_linkchar_request(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let mac = match pm.get_mac() {
            Ok(mac) => mac,
            Err(e) => {
                self.terminate_peer(peer_id, strings::INVALID_MESSAGE, &e.to_string());
                return;
            }
        };
        let requests = pm.data_items_no_mac().unwrap_or_default();

        let Some(local_items) = self.info_base.destinations().get(&mac).map(|i| i.to_vec())
        else {
            let reason = format!("destination={} is invalid", mac);
            self.terminate_peer(peer_id, strings::INVALID_DESTINATION, &reason);
            return;
        };

        if requests.is_empty() {
            // Empty request: report the destination's current metrics.
            let metrics: Vec<DataItem> = local_items
                .into_iter()
                .filter(|di| self.cfg.is_metric(di.id, None).unwrap_or(false))
                .collect();
            self.peer_linkchar_response(peer_id, &mac, metrics);
        } else {
            let client = self.client.clone();
            client.linkchar_request(peer_id, &mac, &requests);
        }
    }

    fn handle_linkchar_response(&mut self, peer_id: &str, pm: &ProtocolMessage) {
        let Ok(mac) = pm.get_mac() else {
            self.terminate_peer(
                peer_id,
                strings::INVALID_MESSAGE,
                "response without MAC address",
            );
            return;
        };
        if !self.handle_response(peer_id, pm) {
            return;
        }
        let updates = pm.data_items_no_mac().unwrap_or_default();
        let known = self
            .peers
            .get_mut(peer_id)
            .map(|p| p.dests.update(&mac, &updates))
            .unwrap_or(false);
        if known {
            let client = self.client.clone();
            client.linkchar_reply(peer_id, &mac, &updates);
        } else {
            let reason = format!("destination={} is invalid", mac);
            self.terminate_peer(peer_id, strings::INVALID_DESTINATION, &reason);
        }
    }

    // ------------------------------------------------------------------
    // Pending responses

    /// Send a message, arming retransmission when the catalog expects a
    /// response for it.
    pub fn send_message(&mut self, peer_id: &str, pm: ProtocolMessage, dest: MacAddress) {
        let response = self
            .cfg
            .get_message_response_name(pm.signal_name())
            .ok()
            .flatten()
            .map(|s| s.to_string());
        match response {
            Some(response_name) => {
                let response_id = match self.cfg.get_signal_id(&response_name) {
                    Ok((id, _)) => id,
                    Err(e) => {
                        error!("bad response name {}: {}", response_name, e);
                        return;
                    }
                };
                let rp = ResponsePending {
                    msg: pm.buffer().to_vec(),
                    msg_name: pm.signal_name().to_string(),
                    response_name,
                    response_id,
                    destination: dest,
                    send_time: 0,
                    send_tries: 0,
                };
                self.send_expecting_response(peer_id, rp);
            }
            None => self.send_to_peer(peer_id, pm.buffer().to_vec()),
        }
    }

    fn send_expecting_response(&mut self, peer_id: &str, rp: ResponsePending) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if peer.is_not_interested(&rp.destination) {
            debug!(
                "not sending message expecting {} to peer={}: not interested in {}",
                rp.response_name, peer_id, rp.destination
            );
            return;
        }
        let dest = rp.destination.clone();
        let queue = peer.pending.entry(dest.clone()).or_default();
        queue.push_back(rp);
        if queue.len() == 1 {
            self.transmit_queue_head(peer_id, &dest);
        }
    }

    /// (Re)transmit the head of one destination queue.
    fn transmit_queue_head(&mut self, peer_id: &str, dest: &MacAddress) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let Some(queue) = peer.pending.get_mut(dest) else {
            return;
        };
        let Some(head) = queue.front_mut() else {
            return;
        };
        head.send_time = now();
        head.send_tries += 1;
        debug!(
            "sending {} to peer={} expecting {} (try {})",
            head.msg_name, peer_id, head.response_name, head.send_tries
        );
        let bytes = head.msg.clone();
        peer.send_raw(bytes);
    }

    /// Match an incoming response against the head of its queue. A
    /// response nobody is waiting for, or the wrong response at the head
    /// of the queue, terminates the session.
    fn handle_response(&mut self, peer_id: &str, pm: &ProtocolMessage) -> bool {
        let dest = pm.get_mac().unwrap_or_else(|_| MacAddress::empty());
        let received = pm.signal_name().to_string();
        let signal_id = pm.signal_id().ok();

        let mut response_ok = false;
        let mut next_to_send = false;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if let Some(queue) = peer.pending.get_mut(&dest) {
                if let Some(head) = queue.front() {
                    if Some(head.response_id) == signal_id {
                        queue.pop_front();
                        response_ok = true;
                        if queue.is_empty() {
                            peer.pending.remove(&dest);
                        } else {
                            next_to_send = true;
                        }
                    } else {
                        error!(
                            "response mismatch from peer={}: expected {} got {}",
                            peer_id, head.response_name, received
                        );
                    }
                }
            }
        }

        if next_to_send {
            self.transmit_queue_head(peer_id, &dest);
        }
        if !response_ok {
            self.terminate_peer(peer_id, strings::UNEXPECTED_MESSAGE, &received);
        }
        response_ok
    }

    // ------------------------------------------------------------------
    // Outbound operations (used by the service API and the engine)

    /// Send Destination Up (or the owed announce response, or
    /// Destination Announce from a router) for one destination.
    pub fn peer_destination_up(&mut self, peer_id: &str, mac: &MacAddress, items: &[DataItem]) {
        let owed = self
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.needs_response.remove(mac));

        let (msg_name, is_response) = match owed {
            Some(response_name) => (response_name, true),
            None => {
                // A router with Destination Announce configured asks with
                // that instead of claiming the destination itself.
                let mut name = strings::DESTINATION_UP.to_string();
                if !self.is_modem && self.cfg.get_signal_id(strings::DESTINATION_ANNOUNCE).is_ok()
                {
                    name = strings::DESTINATION_ANNOUNCE.to_string();
                }
                (name, false)
            }
        };

        let mut pm = match ProtocolMessage::with_header(self.cfg.clone(), &msg_name) {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build {}: {}", msg_name, e);
                return;
            }
        };
        let build = pm
            .add_mac(mac)
            .and_then(|_| pm.add_data_items(items.to_vec()));
        if let Err(e) = build {
            error!("cannot build {}: {}", msg_name, e);
            return;
        }

        if is_response {
            self.send_to_peer(peer_id, pm.buffer().to_vec());
        } else {
            self.send_message(peer_id, pm, mac.clone());
        }
    }

    pub fn peer_destination_down(&mut self, peer_id: &str, mac: &MacAddress) {
        let mut pm =
            match ProtocolMessage::with_header(self.cfg.clone(), strings::DESTINATION_DOWN) {
                Ok(pm) => pm,
                Err(e) => {
                    error!("cannot build destination down: {}", e);
                    return;
                }
            };
        if let Err(e) = pm.add_mac(mac) {
            error!("cannot build destination down: {}", e);
            return;
        }
        self.send_message(peer_id, pm, mac.clone());
    }

    pub fn peer_destination_update(&mut self, peer_id: &str, mac: &MacAddress, items: &[DataItem]) {
        let interested = self
            .peers
            .get(peer_id)
            .map(|p| !p.is_not_interested(mac))
            .unwrap_or(false);
        if !interested {
            return;
        }
        let mut pm =
            match ProtocolMessage::with_header(self.cfg.clone(), strings::DESTINATION_UPDATE) {
                Ok(pm) => pm,
                Err(e) => {
                    error!("cannot build destination update: {}", e);
                    return;
                }
            };
        let build = pm
            .add_mac(mac)
            .and_then(|_| pm.add_data_items(items.to_vec()));
        if let Err(e) = build {
            error!("cannot build destination update: {}", e);
            return;
        }
        self.send_to_peer(peer_id, pm.buffer().to_vec());
    }

    /// Session Update toward one peer; false when the session is not up.
    pub fn peer_session_update(&mut self, peer_id: &str, items: &[DataItem]) -> bool {
        let in_session = self
            .peers
            .get(peer_id)
            .map(|p| p.state == PeerState::InSession)
            .unwrap_or(false);
        if !in_session {
            warn!("session update not sent: peer={} not in session", peer_id);
            return false;
        }
        let mut pm = match ProtocolMessage::with_header(self.cfg.clone(), strings::SESSION_UPDATE)
        {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build session update: {}", e);
                return false;
            }
        };
        if let Err(e) = pm.add_data_items(items.to_vec()) {
            error!("cannot build session update: {}", e);
            return false;
        }
        self.send_message(peer_id, pm, MacAddress::empty());
        true
    }

    pub fn peer_linkchar_request(&mut self, peer_id: &str, mac: &MacAddress, items: &[DataItem]) {
        let mut pm = match ProtocolMessage::with_header(
            self.cfg.clone(),
            strings::LINK_CHARACTERISTICS_REQUEST,
        ) {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build link characteristics request: {}", e);
                return;
            }
        };
        let build = pm
            .add_mac(mac)
            .and_then(|_| pm.add_data_items(items.to_vec()));
        if let Err(e) = build {
            error!("cannot build link characteristics request: {}", e);
            return;
        }
        self.send_message(peer_id, pm, mac.clone());
    }

    pub fn peer_linkchar_response(&mut self, peer_id: &str, mac: &MacAddress, items: Vec<DataItem>) {
        if !self.should_send_response() {
            return;
        }
        let mut pm = match ProtocolMessage::with_header(
            self.cfg.clone(),
            strings::LINK_CHARACTERISTICS_RESPONSE,
        ) {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build link characteristics response: {}", e);
                return;
            }
        };
        let build = pm.add_mac(mac).and_then(|_| pm.add_data_items(items));
        if let Err(e) = build {
            error!("cannot build link characteristics response: {}", e);
            return;
        }
        self.send_to_peer(peer_id, pm.buffer().to_vec());
    }

    /// On session establishment, push every local destination to the new
    /// peer.
    pub fn send_all_destinations(&mut self, peer_id: &str) {
        for mac in self.info_base.destinations().macs() {
            let items = self
                .info_base
                .destinations()
                .get(&mac)
                .map(|i| i.to_vec())
                .unwrap_or_default();
            self.peer_destination_up(peer_id, &mac, &items);
        }
    }

    // ------------------------------------------------------------------
    // Sending plumbing

    fn send_to_peer(&mut self, peer_id: &str, bytes: Vec<u8>) {
        if let Some(peer) = self.peers.get(peer_id) {
            if !peer.send_raw(bytes) {
                warn!("cannot queue bytes to peer={}", peer_id);
            }
        }
    }

    /// Loss-injection knob: responses are suppressed with probability
    /// `100 - ack-probability` percent so retransmission paths can be
    /// exercised. Defaults to sending everything.
    fn should_send_response(&self) -> bool {
        use rand::Rng;
        if self.params.ack_probability >= 100 {
            return true;
        }
        let roll: u64 = rand::thread_rng().gen_range(0..100);
        roll < self.params.ack_probability
    }

    pub fn send_simple_response(
        &mut self,
        peer_id: &str,
        response_name: &str,
        status_name: &str,
        reason: &str,
        mac: Option<&MacAddress>,
    ) {
        if !self.should_send_response() {
            info!("suppressing {} to peer={}", response_name, peer_id);
            return;
        }
        let mut pm = match ProtocolMessage::with_header(self.cfg.clone(), response_name) {
            Ok(pm) => pm,
            Err(e) => {
                error!("cannot build {}: {}", response_name, e);
                return;
            }
        };
        let mut build = Ok(());
        if !status_name.is_empty() && self.signal_allows(response_name, strings::STATUS) {
            build = pm.add_status(status_name, reason);
        }
        if let (Ok(()), Some(mac)) = (&build, mac) {
            build = pm.add_mac(mac);
        }
        if let Err(e) = build {
            error!("cannot build {}: {}", response_name, e);
            return;
        }
        self.send_to_peer(peer_id, pm.buffer().to_vec());
    }

    fn signal_allows(&self, signal_name: &str, di_name: &str) -> bool {
        let Ok(di_id) = self.cfg.get_data_item_id(di_name, None) else {
            return false;
        };
        self.cfg
            .get_signal_info(signal_name)
            .map(|info| info.data_items.iter().any(|d| d.id == di_id))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Termination

    /// Send Session Termination with the given status and move the peer
    /// to Terminating. The cleanup sweep removes it later.
    pub fn terminate_peer(&mut self, peer_id: &str, status_name: &str, reason: &str) {
        let already = self
            .peers
            .get(peer_id)
            .map(|p| p.state == PeerState::Terminating)
            .unwrap_or(true);
        if already {
            return;
        }
        info!(
            "terminating peer={} status={} reason={}",
            peer_id, status_name, reason
        );
        self.set_peer_terminating(peer_id);

        let mut pm =
            match ProtocolMessage::with_header(self.cfg.clone(), strings::SESSION_TERMINATION) {
                Ok(pm) => pm,
                Err(e) => {
                    error!("cannot build session termination: {}", e);
                    return;
                }
            };
        if let Err(e) = pm.add_status(status_name, reason) {
            error!("cannot build session termination: {}", e);
            return;
        }

        // Queue directly: terminate() must bypass the not-interested
        // filtering and always go out on the session queue.
        let response_id = self
            .cfg
            .get_signal_id(strings::SESSION_TERMINATION_RESPONSE)
            .map(|(id, _)| id)
            .unwrap_or(0);
        let rp = ResponsePending {
            msg: pm.buffer().to_vec(),
            msg_name: strings::SESSION_TERMINATION.to_string(),
            response_name: strings::SESSION_TERMINATION_RESPONSE.to_string(),
            response_id,
            destination: MacAddress::empty(),
            send_time: 0,
            send_tries: 0,
        };
        if let Some(peer) = self.peers.get_mut(peer_id) {
            let queue = peer.pending.entry(MacAddress::empty()).or_default();
            queue.clear();
            queue.push_back(rp);
        }
        self.transmit_queue_head(peer_id, &MacAddress::empty());
    }

    /// Transition to Terminating, notifying the client exactly once.
    fn set_peer_terminating(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        if peer.state == PeerState::Terminating {
            return;
        }
        peer.state = PeerState::Terminating;
        let client = self.client.clone();
        client.peer_down(peer_id);
        if let Some(da) = &mut self.dest_advert {
            // All advertised destinations rode on this peer session.
            da.clear_destinations();
        }
    }

    /// The transport dropped out from under the session: no termination
    /// handshake is possible, so the peer goes straight to removable.
    pub(crate) fn connection_closed(&mut self, peer_id: &str) {
        self.set_peer_terminating(peer_id);
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.removable = true;
        }
    }

    // ------------------------------------------------------------------
    // Periodic work, driven by the engine's 1 Hz tick

    pub fn peer_tick(&mut self, current_time: u64) {
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            if self.check_for_activity(&peer_id, current_time) {
                self.check_for_retransmits(&peer_id, current_time);
                self.send_heartbeat_if_due(&peer_id, current_time);
            }
        }
    }

    /// False when the peer was terminated for inactivity. A peer that
    /// advertises interval 0 is never considered inactive.
    fn check_for_activity(&mut self, peer_id: &str, current_time: u64) -> bool {
        let Some(peer) = self.peers.get(peer_id) else {
            return false;
        };
        if peer.state != PeerState::InSession || peer.heartbeat_interval_secs == 0 {
            return true;
        }
        let deadline =
            peer.last_recv + peer.heartbeat_interval_secs * self.params.heartbeat_threshold;
        if deadline <= current_time {
            let reason = format!(
                "peer has been inactive for {} seconds",
                current_time - peer.last_recv
            );
            error!("peer={} {}", peer_id, reason);
            self.terminate_peer(peer_id, strings::TIMED_OUT, &reason);
            return false;
        }
        true
    }

    fn check_for_retransmits(&mut self, peer_id: &str, current_time: u64) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.pending.is_empty() {
            return;
        }

        let mut to_resend: Vec<MacAddress> = Vec::new();
        let mut exhausted = false;
        for (dest, queue) in &peer.pending {
            if let Some(head) = queue.front() {
                if head.send_time + self.params.ack_timeout < current_time {
                    if head.send_tries < self.params.send_tries {
                        to_resend.push(dest.clone());
                    } else {
                        error!(
                            "max send tries {} to peer={} reached waiting for {}",
                            self.params.send_tries, peer_id, head.response_name
                        );
                        exhausted = true;
                        break;
                    }
                }
            }
        }

        if exhausted {
            let removable = self
                .peers
                .get(peer_id)
                .map(|p| p.state == PeerState::Terminating)
                .unwrap_or(false);
            if removable {
                // The termination handshake itself timed out; give up.
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.removable = true;
                }
            } else {
                self.terminate_peer(peer_id, strings::TIMED_OUT, "response timeout");
            }
            return;
        }
        for dest in to_resend {
            self.transmit_queue_head(peer_id, &dest);
        }
    }

    fn send_heartbeat_if_due(&mut self, peer_id: &str, current_time: u64) {
        if self.params.heartbeat_interval == 0 {
            return;
        }
        let due = self
            .peers
            .get(peer_id)
            .map(|p| {
                p.state == PeerState::InSession
                    && p.last_heartbeat + self.params.heartbeat_interval <= current_time
            })
            .unwrap_or(false);
        if !due {
            return;
        }
        match ProtocolMessage::with_header(self.cfg.clone(), strings::HEARTBEAT) {
            Ok(pm) => {
                debug!("sending heartbeat to peer={}", peer_id);
                self.send_to_peer(peer_id, pm.buffer().to_vec());
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.last_heartbeat = current_time;
                }
            }
            Err(e) => error!("cannot build heartbeat: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // IP invariants

    /// Enforce the add/drop IP rules for an incoming update: an added
    /// address must be new to the local node and every peer, and a
    /// dropped address must be present in `existing`.
    pub fn validate_ip_data_items(
        &self,
        new_items: &[DataItem],
        existing: &[DataItem],
    ) -> Result<(), String> {
        for di in new_items {
            if !di.holds_ip() {
                continue;
            }
            if di.ip_flags() == IpFlags::Add {
                let mut owner = self.info_base.find_ip_data_item(di);
                if owner.is_none() {
                    owner = self.peers.values().find_map(|p| p.find_ip_data_item(di));
                }
                if let Some(owner) = owner {
                    return Err(format!(
                        "cannot add IP data item id={}, {} already has it",
                        di.id, owner
                    ));
                }
            } else if di.find_ip_data_item(existing).is_none() {
                return Err(format!(
                    "cannot remove IP data item id={}, it is not there",
                    di.id
                ));
            }
        }
        Ok(())
    }
}
