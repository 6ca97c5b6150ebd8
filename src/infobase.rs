//! The information base: destination and data item storage.
//!
//! Two tiers. The local tier holds the synthetic "self" peer (the local
//! node's default metrics and IP addresses) plus destinations the client
//! has declared up. Each peer session holds its own [`DestinationMap`]
//! for destinations owned by that remote. A MAC lives in exactly one
//! scope at a time.

use crate::dataitem::{DataItem, IpFlags};
use crate::types::MacAddress;
use std::collections::HashMap;

/// Merge a list of updates into stored data items. Non-IP items replace
/// any stored item with the same id; IP items are edited by their
/// add/drop flag (add appends unless already present, drop removes the
/// matching address).
pub fn apply_data_item_updates(existing: &mut Vec<DataItem>, updates: &[DataItem]) {
    for update in updates {
        if update.holds_ip() {
            match update.ip_flags() {
                IpFlags::Add => {
                    if !existing.iter().any(|di| di.ip_equal(update)) {
                        existing.push(update.clone());
                    }
                }
                IpFlags::None => {
                    existing.retain(|di| !di.ip_equal(update));
                }
            }
        } else {
            existing.retain(|di| di.id != update.id);
            existing.push(update.clone());
        }
    }
}

/// MAC-keyed destination storage for one scope.
#[derive(Debug, Default)]
pub struct DestinationMap {
    dests: HashMap<MacAddress, Vec<DataItem>>,
}

impl DestinationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the MAC already exists in this scope.
    pub fn add(&mut self, mac: &MacAddress, data_items: Vec<DataItem>) -> bool {
        if self.dests.contains_key(mac) {
            return false;
        }
        self.dests.insert(mac.clone(), data_items);
        true
    }

    pub fn remove(&mut self, mac: &MacAddress) -> Option<Vec<DataItem>> {
        self.dests.remove(mac)
    }

    /// Merge updates into an existing destination; false when absent.
    pub fn update(&mut self, mac: &MacAddress, updates: &[DataItem]) -> bool {
        match self.dests.get_mut(mac) {
            Some(existing) => {
                apply_data_item_updates(existing, updates);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.dests.contains_key(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&[DataItem]> {
        self.dests.get(mac).map(|v| v.as_slice())
    }

    pub fn macs(&self) -> Vec<MacAddress> {
        let mut macs: Vec<_> = self.dests.keys().cloned().collect();
        macs.sort();
        macs
    }

    pub fn len(&self) -> usize {
        self.dests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dests.is_empty()
    }

    /// Owner MAC of a destination holding an equal IP, if any.
    pub fn find_ip_data_item(&self, ip_item: &DataItem) -> Option<MacAddress> {
        self.dests
            .iter()
            .find(|(_, items)| ip_item.find_ip_data_item(items).is_some())
            .map(|(mac, _)| mac.clone())
    }
}

/// The local tier: self-peer data items plus locally-declared
/// destinations.
#[derive(Debug, Default)]
pub struct InfoBase {
    peer_data: Vec<DataItem>,
    destinations: DestinationMap,
}

impl InfoBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local node's default metrics and IP addresses, sent during
    /// session initialization.
    pub fn peer_data(&self) -> &[DataItem] {
        &self.peer_data
    }

    pub fn update_peer_data(&mut self, updates: &[DataItem]) {
        apply_data_item_updates(&mut self.peer_data, updates);
    }

    pub fn destinations(&self) -> &DestinationMap {
        &self.destinations
    }

    pub fn destinations_mut(&mut self) -> &mut DestinationMap {
        &mut self.destinations
    }

    /// Owner of an equal IP in the local scope: the self peer or a local
    /// destination.
    pub fn find_ip_data_item(&self, ip_item: &DataItem) -> Option<String> {
        if ip_item.find_ip_data_item(&self.peer_data).is_some() {
            return Some("local".to_string());
        }
        self.destinations
            .find_ip_data_item(ip_item)
            .map(|mac| mac.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataitem::DataItemValue;
    use std::net::Ipv4Addr;

    fn mac(last: u8) -> MacAddress {
        MacAddress::from([0, 1, 2, 3, 4, last])
    }

    fn ipv4(flags: u8, last: u8) -> DataItem {
        DataItem {
            id: 8,
            value: DataItemValue::U8Ipv4(flags, Ipv4Addr::new(10, 0, 0, last)),
        }
    }

    fn metric(id: u32, v: u64) -> DataItem {
        DataItem {
            id,
            value: DataItemValue::U64(v),
        }
    }

    #[test]
    fn add_is_idempotent_failure() {
        let mut dests = DestinationMap::new();
        assert!(dests.add(&mac(1), vec![]));
        assert!(!dests.add(&mac(1), vec![]));
        assert!(dests.remove(&mac(1)).is_some());
        assert!(dests.remove(&mac(1)).is_none());
    }

    #[test]
    fn update_merges_by_id_and_ip() {
        let mut dests = DestinationMap::new();
        dests.add(&mac(1), vec![metric(12, 100)]);

        // Metric with the same id replaces.
        assert!(dests.update(&mac(1), &[metric(12, 200)]));
        assert_eq!(dests.get(&mac(1)).unwrap(), &[metric(12, 200)]);

        // IP add appends, drop removes.
        assert!(dests.update(&mac(1), &[ipv4(1, 9)]));
        assert_eq!(dests.get(&mac(1)).unwrap().len(), 2);
        assert!(dests.update(&mac(1), &[ipv4(0, 9)]));
        assert_eq!(dests.get(&mac(1)).unwrap().len(), 1);

        assert!(!dests.update(&mac(2), &[metric(12, 1)]));
    }

    #[test]
    fn ip_search_spans_self_and_destinations() {
        let mut base = InfoBase::new();
        base.update_peer_data(&[ipv4(1, 1)]);
        base.destinations_mut().add(&mac(7), vec![ipv4(1, 2)]);

        assert_eq!(base.find_ip_data_item(&ipv4(1, 1)).as_deref(), Some("local"));
        assert_eq!(
            base.find_ip_data_item(&ipv4(1, 2)).as_deref(),
            Some(mac(7).to_string().as_str())
        );
        assert!(base.find_ip_data_item(&ipv4(1, 3)).is_none());
    }
}
