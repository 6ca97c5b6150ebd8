//! Core identifier types, the MAC address form, and protocol string constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Internal representation of a signal/message id. The wire width is
/// configured (1-4 bytes) and is usually narrower than this.
pub type SignalId = u32;

/// Internal representation of a data item id.
pub type DataItemId = u32;

/// Internal representation of a status code id.
pub type StatusCodeId = u32;

/// Internal representation of an extension id.
pub type ExtensionId = u32;

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A MAC-like identifier: an opaque, variable-length byte string.
///
/// DLEP destinations are keyed by these. The destination-advertisement
/// subprotocol also uses them as rf-ids, which may be longer than the
/// usual six bytes, so no fixed width is assumed anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress {
    pub bytes: Vec<u8>,
}

impl MacAddress {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The empty MAC, used as the key for session-scoped message queues.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self { bytes: bytes.to_vec() }
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for b in &self.bytes {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
            first = false;
        }
        Ok(())
    }
}

/// Parse error for [`MacAddress::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(pub String);

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(MacParseError(s.to_string()));
        }
        let mut bytes = Vec::new();
        for part in s.split(':') {
            let b = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError(s.to_string()))?;
            bytes.push(b);
        }
        Ok(Self { bytes })
    }
}

/// The protocol configuration file refers to signals, data items, and
/// status codes by name; the code does too. These constants keep the
/// spelling in one place so a typo is a compile error, not a runtime
/// lookup failure.
pub mod strings {
    // signal/message names

    pub const PEER_DISCOVERY: &str = "Peer_Discovery";
    pub const PEER_OFFER: &str = "Peer_Offer";
    pub const SESSION_INITIALIZATION: &str = "Session_Initialization";
    pub const SESSION_INITIALIZATION_RESPONSE: &str = "Session_Initialization_Response";
    pub const SESSION_TERMINATION: &str = "Session_Termination";
    pub const SESSION_TERMINATION_RESPONSE: &str = "Session_Termination_Response";
    pub const SESSION_UPDATE: &str = "Session_Update";
    pub const SESSION_UPDATE_RESPONSE: &str = "Session_Update_Response";
    pub const DESTINATION_UP: &str = "Destination_Up";
    pub const DESTINATION_UP_RESPONSE: &str = "Destination_Up_Response";
    pub const DESTINATION_DOWN: &str = "Destination_Down";
    pub const DESTINATION_DOWN_RESPONSE: &str = "Destination_Down_Response";
    pub const DESTINATION_UPDATE: &str = "Destination_Update";
    pub const DESTINATION_ANNOUNCE: &str = "Destination_Announce";
    pub const DESTINATION_ANNOUNCE_RESPONSE: &str = "Destination_Announce_Response";
    pub const LINK_CHARACTERISTICS_REQUEST: &str = "Link_Characteristics_Request";
    pub const LINK_CHARACTERISTICS_RESPONSE: &str = "Link_Characteristics_Response";
    pub const HEARTBEAT: &str = "Heartbeat";

    // data item names

    pub const VERSION: &str = "Version";
    pub const PORT: &str = "Port";
    pub const PEER_TYPE: &str = "Peer_Type";
    pub const MAC_ADDRESS: &str = "MAC_Address";
    pub const IPV4_ADDRESS: &str = "IPv4_Address";
    pub const IPV6_ADDRESS: &str = "IPv6_Address";
    pub const STATUS: &str = "Status";
    pub const HEARTBEAT_INTERVAL: &str = "Heartbeat_Interval";
    pub const IPV4_ATTACHED_SUBNET: &str = "IPv4_Attached_Subnet";
    pub const IPV6_ATTACHED_SUBNET: &str = "IPv6_Attached_Subnet";
    pub const EXTENSIONS_SUPPORTED: &str = "Extensions_Supported";
    pub const EXPERIMENTAL_DEFINITION: &str = "Experimental_Definition";
    pub const IPV4_CONNECTION_POINT: &str = "IPv4_Connection_Point";
    pub const IPV6_CONNECTION_POINT: &str = "IPv6_Connection_Point";

    // metric data item names

    pub const MAXIMUM_DATA_RATE_RECEIVE: &str = "Maximum_Data_Rate_Receive";
    pub const MAXIMUM_DATA_RATE_TRANSMIT: &str = "Maximum_Data_Rate_Transmit";
    pub const CURRENT_DATA_RATE_RECEIVE: &str = "Current_Data_Rate_Receive";
    pub const CURRENT_DATA_RATE_TRANSMIT: &str = "Current_Data_Rate_Transmit";
    pub const LATENCY: &str = "Latency";
    pub const RESOURCES: &str = "Resources";
    pub const RESOURCES_RECEIVE: &str = "Resources_Receive";
    pub const RESOURCES_TRANSMIT: &str = "Resources_Transmit";
    pub const RELATIVE_LINK_QUALITY_RECEIVE: &str = "Relative_Link_Quality_Receive";
    pub const RELATIVE_LINK_QUALITY_TRANSMIT: &str = "Relative_Link_Quality_Transmit";
    pub const MAXIMUM_TRANSMISSION_UNIT: &str = "Maximum_Transmission_Unit";

    // status code names

    pub const SUCCESS: &str = "Success";
    pub const UNKNOWN_MESSAGE: &str = "Unknown_Message";
    pub const INVALID_MESSAGE: &str = "Invalid_Message";
    pub const UNEXPECTED_MESSAGE: &str = "Unexpected_Message";
    pub const REQUEST_DENIED: &str = "Request_Denied";
    pub const TIMED_OUT: &str = "Timed_Out";
    pub const INVALID_DATA: &str = "Invalid_Data";
    pub const INVALID_DESTINATION: &str = "Invalid_Destination";
    pub const NOT_INTERESTED: &str = "Not_Interested";
    pub const INCONSISTENT_DATA: &str = "Inconsistent_Data";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let mac: MacAddress = "01:02:03:04:05:06".parse().unwrap();
        assert_eq!(mac.bytes, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(mac.to_string(), "01:02:03:04:05:06");
    }

    #[test]
    fn mac_odd_lengths() {
        let rf_id: MacAddress = "aa:bb:cc:dd:ee:ff:00:11".parse().unwrap();
        assert_eq!(rf_id.bytes.len(), 8);
        assert!("".parse::<MacAddress>().is_err());
        assert!("zz:01".parse::<MacAddress>().is_err());
    }
}
