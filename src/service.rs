//! The service API the embedding client calls.
//!
//! Every operation locks the core once, never throws across the
//! boundary, and reports its outcome through [`ReturnStatus`]. These
//! methods must not be invoked synchronously from inside a client
//! callback; spawn a task instead.

use crate::dataitem::DataItem;
use crate::engine::Engine;
use crate::peer::PeerInfo;
use crate::types::MacAddress;
use std::fmt;

/// Outcome of a service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnStatus {
    Ok,
    InvalidDataItem,
    InvalidMacAddress,
    DestinationExists,
    DestinationDoesNotExist,
    PeerDoesNotExist,
}

impl fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReturnStatus::Ok => "ok",
            ReturnStatus::InvalidDataItem => "invalid data item",
            ReturnStatus::InvalidMacAddress => "invalid MAC address",
            ReturnStatus::DestinationExists => "destination exists",
            ReturnStatus::DestinationDoesNotExist => "destination does not exist",
            ReturnStatus::PeerDoesNotExist => "peer does not exist",
        };
        f.write_str(s)
    }
}

impl Engine {
    /// Declare a destination up. On a modem this adds a local
    /// destination (or, with destination advertisement enabled, declares
    /// an rf-id up); on a router it asks the modems with Destination
    /// Announce (or old-draft Destination Up).
    pub async fn destination_up(&self, mac: &MacAddress, data_items: Vec<DataItem>) -> ReturnStatus {
        if mac.is_empty() {
            return ReturnStatus::InvalidMacAddress;
        }
        let mut core = self.core().lock().await;
        for di in &data_items {
            if di.validate(&core.cfg, None).is_err() {
                return ReturnStatus::InvalidDataItem;
            }
        }

        if core.is_modem && core.dest_advert.is_some() {
            if core.advert_declare_up(mac, data_items) {
                ReturnStatus::Ok
            } else {
                ReturnStatus::DestinationExists
            }
        } else if !core.is_modem {
            if core.peer_owning_destination(mac).is_some()
                || core.info_base.destinations().contains(mac)
            {
                return ReturnStatus::DestinationExists;
            }
            for peer_id in core.in_session_peer_ids() {
                core.peer_destination_up(&peer_id, mac, &data_items);
            }
            ReturnStatus::Ok
        } else if core.local_destination_up(mac, data_items) {
            ReturnStatus::Ok
        } else {
            ReturnStatus::DestinationExists
        }
    }

    /// Merge new data items into a destination this node declared up.
    pub async fn destination_update(
        &self,
        mac: &MacAddress,
        data_items: Vec<DataItem>,
    ) -> ReturnStatus {
        if mac.is_empty() {
            return ReturnStatus::InvalidMacAddress;
        }
        let mut core = self.core().lock().await;
        for di in &data_items {
            if di.validate(&core.cfg, None).is_err() {
                return ReturnStatus::InvalidDataItem;
            }
        }

        if core.is_modem && core.dest_advert.is_some() {
            if core.advert_update(mac, &data_items) {
                ReturnStatus::Ok
            } else {
                ReturnStatus::DestinationDoesNotExist
            }
        } else if core.local_destination_update(mac, &data_items) {
            ReturnStatus::Ok
        } else {
            ReturnStatus::DestinationDoesNotExist
        }
    }

    /// Declare a destination down.
    pub async fn destination_down(&self, mac: &MacAddress) -> ReturnStatus {
        if mac.is_empty() {
            return ReturnStatus::InvalidMacAddress;
        }
        let mut core = self.core().lock().await;

        if core.is_modem && core.dest_advert.is_some() {
            if core.advert_declare_down(mac) {
                ReturnStatus::Ok
            } else {
                ReturnStatus::DestinationDoesNotExist
            }
        } else if core.local_destination_down(mac) {
            ReturnStatus::Ok
        } else {
            ReturnStatus::DestinationDoesNotExist
        }
    }

    /// Update this node's session-level data items (default metrics, IP
    /// addresses) and send a Session Update to every in-session peer.
    pub async fn peer_update(&self, data_items: Vec<DataItem>) -> ReturnStatus {
        let mut core = self.core().lock().await;
        for di in &data_items {
            if di.validate(&core.cfg, None).is_err() {
                return ReturnStatus::InvalidDataItem;
            }
        }
        core.info_base.update_peer_data(&data_items);
        for peer_id in core.in_session_peer_ids() {
            core.peer_session_update(&peer_id, &data_items);
        }
        ReturnStatus::Ok
    }

    /// Ids of all current peer sessions.
    pub async fn get_peers(&self) -> Vec<String> {
        let core = self.core().lock().await;
        let mut ids: Vec<String> = core.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_peer_info(&self, peer_id: &str) -> Result<PeerInfo, ReturnStatus> {
        let core = self.core().lock().await;
        core.peers
            .get(peer_id)
            .map(|p| p.get_info())
            .ok_or(ReturnStatus::PeerDoesNotExist)
    }

    /// Data items stored for a destination owned by the given peer.
    pub async fn get_destination_info(
        &self,
        peer_id: &str,
        mac: &MacAddress,
    ) -> Result<Vec<DataItem>, ReturnStatus> {
        let core = self.core().lock().await;
        let peer = core
            .peers
            .get(peer_id)
            .ok_or(ReturnStatus::PeerDoesNotExist)?;
        peer.dests
            .get(mac)
            .map(|items| items.to_vec())
            .ok_or(ReturnStatus::DestinationDoesNotExist)
    }

    /// Ask the peer owning a destination to achieve the given link
    /// characteristics. An empty item list requests a metric report.
    pub async fn linkchar_request(
        &self,
        mac: &MacAddress,
        data_items: Vec<DataItem>,
    ) -> ReturnStatus {
        let mut core = self.core().lock().await;
        let Some(peer_id) = core.peer_owning_destination(mac) else {
            return ReturnStatus::DestinationDoesNotExist;
        };
        core.peer_linkchar_request(&peer_id, mac, &data_items);
        ReturnStatus::Ok
    }

    /// Answer a link characteristics request previously delivered
    /// through the client callback.
    pub async fn linkchar_reply(
        &self,
        peer_id: &str,
        mac: &MacAddress,
        data_items: Vec<DataItem>,
    ) -> ReturnStatus {
        let mut core = self.core().lock().await;
        if !core.peers.contains_key(peer_id) {
            return ReturnStatus::PeerDoesNotExist;
        }
        core.peer_linkchar_response(peer_id, mac, data_items);
        ReturnStatus::Ok
    }
}
