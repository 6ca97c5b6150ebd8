//! The embedding-client interface.
//!
//! The core calls out through [`DlepClient`] for configuration values and to
//! deliver protocol events. Implementations must be callable from the
//! engine's tasks, so the trait is `Send + Sync`; callbacks should return
//! quickly and must not call back into the service API from the same stack.

use crate::dataitem::DataItem;
use crate::peer::PeerInfo;
use crate::types::MacAddress;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;

/// One typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    UInt(u64),
    Str(String),
    Addr(IpAddr),
    UIntList(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("unknown configuration parameter: {0}")]
    BadParameterName(String),

    #[error("configuration parameter {0} has the wrong type")]
    BadParameterValue(String),
}

/// Callbacks supplied by the program embedding the DLEP core.
pub trait DlepClient: Send + Sync {
    /// Look up a configuration parameter by name. The set of names the
    /// core consults is enumerated in the crate documentation; unknown
    /// names must produce [`ClientError::BadParameterName`].
    fn get_config_parameter(&self, name: &str) -> Result<ConfigValue, ClientError>;

    /// A peer session reached InSession.
    fn peer_up(&self, peer_info: &PeerInfo);

    /// A peer sent a Session Update.
    fn peer_update(&self, peer_id: &str, data_items: &[DataItem]);

    /// A peer session ended.
    fn peer_down(&self, peer_id: &str);

    /// A peer declared a destination up. The returned string is a status
    /// code name; empty means Success. Returning `Not_Interested` keeps
    /// the destination out of the information base.
    fn destination_up(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]) -> String;

    /// A peer updated a destination's data items.
    fn destination_update(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]);

    /// A peer declared a destination down.
    fn destination_down(&self, peer_id: &str, mac: &MacAddress);

    /// A peer asked this side to realize the given link characteristics.
    /// The client answers later through the service API.
    fn linkchar_request(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]);

    /// A peer answered an earlier link characteristics request.
    fn linkchar_reply(&self, peer_id: &str, mac: &MacAddress, data_items: &[DataItem]);
}

/// Typed parameter lookups over [`DlepClient::get_config_parameter`].
pub trait ClientParams {
    fn param_bool(&self, name: &str) -> Result<bool, ClientError>;
    fn param_uint(&self, name: &str) -> Result<u64, ClientError>;
    fn param_str(&self, name: &str) -> Result<String, ClientError>;
    fn param_addr(&self, name: &str) -> Result<IpAddr, ClientError>;

    /// Like [`ClientParams::param_uint`] but an absent parameter yields
    /// `default` instead of an error.
    fn param_uint_or(&self, name: &str, default: u64) -> Result<u64, ClientError> {
        match self.param_uint(name) {
            Err(ClientError::BadParameterName(_)) => Ok(default),
            other => other,
        }
    }

    fn param_bool_or(&self, name: &str, default: bool) -> Result<bool, ClientError> {
        match self.param_bool(name) {
            Err(ClientError::BadParameterName(_)) => Ok(default),
            other => other,
        }
    }
}

impl<C: DlepClient + ?Sized> ClientParams for C {
    fn param_bool(&self, name: &str) -> Result<bool, ClientError> {
        match self.get_config_parameter(name)? {
            ConfigValue::Bool(b) => Ok(b),
            ConfigValue::UInt(n) => Ok(n != 0),
            _ => Err(ClientError::BadParameterValue(name.to_string())),
        }
    }

    fn param_uint(&self, name: &str) -> Result<u64, ClientError> {
        match self.get_config_parameter(name)? {
            ConfigValue::UInt(n) => Ok(n),
            _ => Err(ClientError::BadParameterValue(name.to_string())),
        }
    }

    fn param_str(&self, name: &str) -> Result<String, ClientError> {
        match self.get_config_parameter(name)? {
            ConfigValue::Str(s) => Ok(s),
            _ => Err(ClientError::BadParameterValue(name.to_string())),
        }
    }

    fn param_addr(&self, name: &str) -> Result<IpAddr, ClientError> {
        match self.get_config_parameter(name)? {
            ConfigValue::Addr(a) => Ok(a),
            ConfigValue::Str(s) => s
                .parse()
                .map_err(|_| ClientError::BadParameterValue(name.to_string())),
            _ => Err(ClientError::BadParameterValue(name.to_string())),
        }
    }
}

/// A [`DlepClient`] backed by a parameter table, ignoring all events.
/// Useful for tests and as a base for thin embedders; real clients
/// usually wrap it and forward the callbacks they care about.
pub struct TableClient {
    params: HashMap<String, ConfigValue>,
}

impl TableClient {
    pub fn new(params: HashMap<String, ConfigValue>) -> Self {
        Self { params }
    }

    pub fn set(&mut self, name: &str, value: ConfigValue) {
        self.params.insert(name.to_string(), value);
    }
}

impl DlepClient for TableClient {
    fn get_config_parameter(&self, name: &str) -> Result<ConfigValue, ClientError> {
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::BadParameterName(name.to_string()))
    }

    fn peer_up(&self, _peer_info: &PeerInfo) {}
    fn peer_update(&self, _peer_id: &str, _data_items: &[DataItem]) {}
    fn peer_down(&self, _peer_id: &str) {}

    fn destination_up(&self, _peer_id: &str, _mac: &MacAddress, _data_items: &[DataItem]) -> String {
        String::new()
    }

    fn destination_update(&self, _peer_id: &str, _mac: &MacAddress, _data_items: &[DataItem]) {}
    fn destination_down(&self, _peer_id: &str, _mac: &MacAddress) {}
    fn linkchar_request(&self, _peer_id: &str, _mac: &MacAddress, _data_items: &[DataItem]) {}
    fn linkchar_reply(&self, _peer_id: &str, _mac: &MacAddress, _data_items: &[DataItem]) {}
}
