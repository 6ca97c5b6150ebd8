//! Destination advertisement: the modem-to-modem subprotocol that lets a
//! radio represent destinations attached to peer radios.
//!
//! Each participating modem periodically multicasts its rf-id and the set
//! of destination MACs it currently represents. A receiving modem keeps a
//! database keyed by rf-id; when the local client declares an rf-id up,
//! the advertised destinations behind it are raised toward the attached
//! router in its place. Routers never see raw rf-ids.

use crate::dataitem::DataItem;
use crate::discovery::{open_socket, McastConfig};
use crate::engine::DlepCore;
use crate::types::{now, MacAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// One advertisement as it travels on the wire (postcard-encoded).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestAdvertInfo {
    pub report_interval: u32,
    pub uptime: u64,
    pub sequence_number: u32,
    pub rf_id: MacAddress,
    pub destinations: Vec<MacAddress>,
    pub ipv4_data_items: Vec<DataItem>,
    pub ipv4_subnet_data_items: Vec<DataItem>,
    pub ipv6_data_items: Vec<DataItem>,
    pub ipv6_subnet_data_items: Vec<DataItem>,
}

pub fn encode_advertisement(info: &DestAdvertInfo) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(info)
}

pub fn decode_advertisement(bytes: &[u8]) -> Result<DestAdvertInfo, postcard::Error> {
    postcard::from_bytes(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// The client has not (or no longer) declared this rf-id up.
    Down,
    Up,
}

/// Database entry for one peer radio.
#[derive(Debug, Clone)]
pub struct DestAdvertEntry {
    /// Created or last updated.
    pub timestamp: u64,
    pub state: EntryState,
    /// True when the client declared the rf-id up before any
    /// advertisement arrived.
    pub placeholder: bool,
    /// Latest advertisement.
    pub info: DestAdvertInfo,
    /// Client-supplied data items for destinations behind this rf-id.
    pub data_items: Vec<DataItem>,
}

/// Modem-local advertisement state: what we send, and what we heard.
pub struct DestAdvert {
    pub rf_id: MacAddress,
    pub send_interval: u32,
    pub hold_interval: u64,
    pub expire_count: u64,
    started: DateTime<Utc>,
    sequence: u32,
    /// Destinations carried in our own advertisement.
    destinations: BTreeSet<MacAddress>,
    pub db: HashMap<MacAddress, DestAdvertEntry>,
}

impl DestAdvert {
    pub fn new(rf_id: MacAddress, send_interval: u32, hold_interval: u64, expire_count: u64) -> Self {
        Self {
            rf_id,
            send_interval,
            hold_interval,
            expire_count,
            started: Utc::now(),
            sequence: 0,
            destinations: BTreeSet::new(),
            db: HashMap::new(),
        }
    }

    pub fn add_destination(&mut self, mac: &MacAddress) {
        info!("advertising destination {}", mac);
        self.destinations.insert(mac.clone());
    }

    pub fn del_destination(&mut self, mac: &MacAddress) {
        self.destinations.remove(mac);
    }

    pub fn clear_destinations(&mut self) {
        self.destinations.clear();
    }

    /// Build the next periodic advertisement.
    pub fn next_advertisement(&mut self) -> DestAdvertInfo {
        self.sequence = self.sequence.wrapping_add(1);
        DestAdvertInfo {
            report_interval: self.send_interval,
            uptime: (Utc::now() - self.started).num_seconds().max(0) as u64,
            sequence_number: self.sequence,
            rf_id: self.rf_id.clone(),
            destinations: self.destinations.iter().cloned().collect(),
            ..Default::default()
        }
    }
}

impl DlepCore {
    /// Upsert the database from a received advertisement and synthesize
    /// destination deltas for entries the client has declared up.
    pub fn handle_advertisement(&mut self, info: DestAdvertInfo) {
        let (added, deleted, items) = {
            let Some(da) = &mut self.dest_advert else {
                return;
            };
            if info.rf_id == da.rf_id {
                // Our own multicast looped back.
                return;
            }
            if !da.db.contains_key(&info.rf_id) {
                info!("new destination advertisement from rf-id={}", info.rf_id);
                da.db.insert(
                    info.rf_id.clone(),
                    DestAdvertEntry {
                        timestamp: now(),
                        state: EntryState::Down,
                        placeholder: false,
                        info,
                        data_items: Vec::new(),
                    },
                );
                return;
            }
            let Some(entry) = da.db.get_mut(&info.rf_id) else {
                return;
            };
            entry.timestamp = now();
            let old: BTreeSet<MacAddress> = entry.info.destinations.iter().cloned().collect();
            let new: BTreeSet<MacAddress> = info.destinations.iter().cloned().collect();
            entry.info = info;
            if entry.state != EntryState::Up {
                return;
            }
            let added: Vec<MacAddress> = new.difference(&old).cloned().collect();
            let deleted: Vec<MacAddress> = old.difference(&new).cloned().collect();
            (added, deleted, entry.data_items.clone())
        };

        for mac in added {
            if !self.local_destination_up(&mac, items.clone()) {
                warn!("advertised destination {} already exists", mac);
            }
        }
        for mac in deleted {
            if !self.local_destination_down(&mac) {
                warn!("advertised destination {} does not exist", mac);
            }
        }
    }

    /// 1 Hz sweep: drop placeholders past the hold interval and entries
    /// whose advertisements stopped arriving, taking their destinations
    /// down.
    pub fn purge_advertisements(&mut self, current_time: u64) {
        let mut downs: Vec<MacAddress> = Vec::new();
        {
            let Some(da) = &mut self.dest_advert else {
                return;
            };
            let hold_interval = da.hold_interval;
            let expire_count = da.expire_count;
            da.db.retain(|rf_id, entry| {
                let age = current_time.saturating_sub(entry.timestamp);

                if hold_interval > 0
                    && entry.placeholder
                    && entry.state == EntryState::Up
                    && age >= hold_interval
                {
                    info!("placeholder entry for {} is {}s old, removing", rf_id, age);
                    return false;
                }

                if expire_count > 0 {
                    let lifetime = expire_count * u64::from(entry.info.report_interval);
                    if lifetime > 0 && age >= lifetime {
                        info!("advertisement from {} is {}s old, removing", rf_id, age);
                        if entry.state == EntryState::Up {
                            downs.extend(entry.info.destinations.iter().cloned());
                        }
                        return false;
                    }
                }
                true
            });
        }
        for mac in downs {
            if !self.local_destination_down(&mac) {
                warn!("expired destination {} does not exist", mac);
            }
        }
    }

    /// Client declared an rf-id up. Known rf-ids raise their advertised
    /// destinations; unknown ones get a placeholder for when the first
    /// advertisement arrives. False means the rf-id was already up.
    pub fn advert_declare_up(&mut self, rf_id: &MacAddress, items: Vec<DataItem>) -> bool {
        let (raise, ok) = {
            let Some(da) = &mut self.dest_advert else {
                return false;
            };
            if !da.db.contains_key(rf_id) {
                debug!("placeholder advertisement entry for rf-id={}", rf_id);
                da.db.insert(
                    rf_id.clone(),
                    DestAdvertEntry {
                        timestamp: now(),
                        state: EntryState::Up,
                        placeholder: true,
                        info: DestAdvertInfo::default(),
                        data_items: items,
                    },
                );
                (Vec::new(), true)
            } else {
                let Some(entry) = da.db.get_mut(rf_id) else {
                    return false;
                };
                entry.data_items = items.clone();
                if entry.state == EntryState::Down {
                    entry.state = EntryState::Up;
                    (entry.info.destinations.clone(), true)
                } else {
                    (Vec::new(), false)
                }
            }
        };
        for mac in raise {
            let items = self
                .dest_advert
                .as_ref()
                .and_then(|da| da.db.get(rf_id))
                .map(|e| e.data_items.clone())
                .unwrap_or_default();
            if !self.local_destination_up(&mac, items) {
                warn!("advertised destination {} already exists", mac);
            }
        }
        ok
    }

    /// Client updated an rf-id's data items; propagate to the advertised
    /// destinations currently up. False when the rf-id is unknown.
    pub fn advert_update(&mut self, rf_id: &MacAddress, items: &[DataItem]) -> bool {
        let dests = {
            let Some(da) = &mut self.dest_advert else {
                return false;
            };
            match da.db.get_mut(rf_id) {
                None => return false,
                Some(entry) => {
                    crate::infobase::apply_data_item_updates(&mut entry.data_items, items);
                    if entry.state == EntryState::Up {
                        entry.info.destinations.clone()
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        for mac in dests {
            self.local_destination_update(&mac, items);
        }
        true
    }

    /// Client declared an rf-id down; its advertised destinations go
    /// down with it. False when the rf-id is unknown.
    pub fn advert_declare_down(&mut self, rf_id: &MacAddress) -> bool {
        let lower = {
            let Some(da) = &mut self.dest_advert else {
                return false;
            };
            match da.db.get_mut(rf_id) {
                None => return false,
                Some(entry) => {
                    if entry.state != EntryState::Up {
                        return false;
                    }
                    entry.state = EntryState::Down;
                    entry.info.destinations.clone()
                }
            }
        };
        for mac in lower {
            if !self.local_destination_down(&mac) {
                warn!("advertised destination {} does not exist", mac);
            }
        }
        true
    }
}

/// Multicast worker: periodic advertisement send plus receive/upsert.
pub async fn run(
    core: Arc<Mutex<DlepCore>>,
    mcast: McastConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match open_socket(&mcast) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot open destination advertisement socket: {}", e);
            return;
        }
    };
    let group = SocketAddr::new(mcast.address, mcast.port);
    let mut send_timer = tokio::time::interval(Duration::from_secs(mcast.interval.max(1)));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = send_timer.tick(), if mcast.send => {
                let bytes = {
                    let mut core = core.lock().await;
                    core.dest_advert
                        .as_mut()
                        .map(|da| da.next_advertisement())
                        .and_then(|advert| match encode_advertisement(&advert) {
                            Ok(bytes) => Some(bytes),
                            Err(e) => {
                                warn!("cannot encode advertisement: {}", e);
                                None
                            }
                        })
                };
                if let Some(bytes) = bytes {
                    if let Err(e) = socket.send_to(&bytes, group).await {
                        warn!("advertisement send failed: {}", e);
                    }
                }
            }
            result = socket.recv_from(&mut buf), if mcast.receive => {
                match result {
                    Ok((len, from)) => match decode_advertisement(&buf[..len]) {
                        Ok(info) => {
                            debug!("advertisement from {}: rf-id={} seq={}",
                                   from, info.rf_id, info.sequence_number);
                            core.lock().await.handle_advertisement(info);
                        }
                        Err(e) => warn!(
                            "cannot parse advertisement from {}: {} (head {})",
                            from,
                            e,
                            hex::encode(&buf[..len.min(16)])
                        ),
                    },
                    Err(e) => {
                        warn!("advertisement receive failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
