//! Protocol message framing.
//!
//! A message is `[optional signal prefix][signal id][length][data items]`
//! with every width and the prefix drawn from the protocol configuration.
//! Signals (UDP) carry the prefix; messages (TCP) do not. The builder
//! keeps the serialized buffer and the parsed data item list in sync so a
//! message can be assembled, logged, and transmitted without re-parsing.

use crate::client::{ClientError, ClientParams, DlepClient};
use crate::codec::{Decoder, Encoder};
use crate::dataitem::{DataItem, DataItemValue, DataItemValueType};
use crate::error::{ConfigError, WireError};
use crate::protocfg::{ProtocolConfig, Units};
use crate::types::{strings, ExtensionId, MacAddress, SignalId};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on any serialized signal/message.
pub const MAX_SIGNAL_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("data item {0} not present")]
    NotPresent(String),

    #[error("data item {0} has the wrong value type")]
    WrongType(String),

    #[error("message has no header yet")]
    NoHeader,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub struct ProtocolMessage {
    cfg: Arc<ProtocolConfig>,
    buf: Vec<u8>,
    /// Offset of the length field, rewritten as data items are added.
    len_index: usize,
    /// Total header size; data items start here.
    header_length: usize,
    signal_id: Option<SignalId>,
    signal_name: String,
    is_signal: bool,
    data_items: Vec<DataItem>,
}

impl ProtocolMessage {
    pub fn new(cfg: Arc<ProtocolConfig>) -> Self {
        Self {
            cfg,
            buf: Vec::new(),
            len_index: 0,
            header_length: 0,
            signal_id: None,
            signal_name: String::new(),
            is_signal: false,
            data_items: Vec::new(),
        }
    }

    /// Convenience: build a message with the header already written.
    pub fn with_header(cfg: Arc<ProtocolConfig>, name: &str) -> Result<Self, MessageError> {
        let mut pm = Self::new(cfg);
        pm.add_header(name)?;
        Ok(pm)
    }

    // ------------------------------------------------------------------
    // Assembly

    /// Write the prefix (signals only), id, and a zero length placeholder.
    pub fn add_header(&mut self, name: &str) -> Result<(), MessageError> {
        let (id, is_signal) = self.cfg.get_signal_id(name)?;
        let mut enc = Encoder::new();
        if is_signal {
            enc.put_bytes(self.cfg.signal_prefix().as_bytes());
        }
        enc.put_uint(u64::from(id), self.cfg.signal_id_size())?;
        self.buf = enc.into_bytes();
        self.len_index = self.buf.len();
        self.buf
            .extend(std::iter::repeat(0).take(self.cfg.signal_length_size()));
        self.header_length = self.buf.len();
        self.signal_id = Some(id);
        self.signal_name = name.to_string();
        self.is_signal = is_signal;
        Ok(())
    }

    /// Append one data item and patch the length field.
    pub fn add_data_item(&mut self, di: DataItem) -> Result<(), MessageError> {
        if self.signal_id.is_none() {
            return Err(MessageError::NoHeader);
        }
        let bytes = di.serialize(&self.cfg)?;
        self.buf.extend_from_slice(&bytes);
        self.data_items.push(di);
        self.update_length();
        Ok(())
    }

    pub fn add_data_items(&mut self, items: Vec<DataItem>) -> Result<(), MessageError> {
        for di in items {
            self.add_data_item(di)?;
        }
        Ok(())
    }

    /// Append only the data items this message's signal allows. Used when
    /// reflecting stored items into a response whose draft may define a
    /// narrower item set.
    pub fn add_allowed_data_items(&mut self, items: &[DataItem]) -> Result<(), MessageError> {
        let allowed: Vec<_> = self
            .cfg
            .get_signal_info(&self.signal_name)?
            .data_items
            .iter()
            .map(|s| s.id)
            .collect();
        for di in items {
            if allowed.contains(&di.id) {
                self.add_data_item(di.clone())?;
            }
        }
        Ok(())
    }

    fn update_length(&mut self) {
        let payload = (self.buf.len() - self.header_length) as u64;
        let width = self.cfg.signal_length_size();
        let be = payload.to_be_bytes();
        self.buf[self.len_index..self.len_index + width].copy_from_slice(&be[8 - width..]);
    }

    // ------------------------------------------------------------------
    // Well-known data item helpers

    pub fn add_version(&mut self) -> Result<(), MessageError> {
        let [major, minor] = self.cfg.version();
        let cfg = self.cfg.clone();
        let di = DataItem::new(
            strings::VERSION,
            DataItemValue::A2U16([major, minor]),
            &cfg,
            None,
        )?;
        self.add_data_item(di)
    }

    /// Add the local heartbeat interval, converted to the configured
    /// units and width (u16 in early drafts, u32 later).
    pub fn add_heartbeat_interval(&mut self, client: &dyn DlepClient) -> Result<(), MessageError> {
        let seconds = client.param_uint("heartbeat-interval")?;
        let cfg = self.cfg.clone();
        let info = cfg.get_data_item_info(strings::HEARTBEAT_INTERVAL)?;

        let value = match info.units {
            Units::Milliseconds => seconds * 1_000,
            Units::Microseconds => seconds * 1_000_000,
            Units::None | Units::Seconds => seconds,
            Units::Percentage => {
                warn!("invalid units for {}", strings::HEARTBEAT_INTERVAL);
                seconds
            }
        };

        let div = match info.value_type {
            DataItemValueType::U16 => DataItemValue::U16(value as u16),
            DataItemValueType::U32 => DataItemValue::U32(value as u32),
            other => {
                warn!(
                    "invalid value type {} for {}",
                    other,
                    strings::HEARTBEAT_INTERVAL
                );
                DataItemValue::U32(value as u32)
            }
        };
        self.add_data_item(DataItem::new(strings::HEARTBEAT_INTERVAL, div, &cfg, None)?)
    }

    /// Add the Peer Type data item. Depending on the draft it is a bare
    /// string or a flags byte plus string; an absent `peer-type`
    /// parameter omits the item when the current signal allows that.
    pub fn add_peer_type(&mut self, client: &dyn DlepClient) -> Result<(), MessageError> {
        let cfg = self.cfg.clone();
        let peer_type = match client.param_str("peer-type") {
            Ok(s) => s,
            Err(ClientError::BadParameterName(_)) => {
                let di_id = cfg.get_data_item_id(strings::PEER_TYPE, None)?;
                let siginfo = cfg.get_signal_info(&self.signal_name)?;
                let optional = siginfo
                    .data_items
                    .iter()
                    .find(|d| d.id == di_id)
                    .map(|d| d.occurs.optional())
                    .unwrap_or(true);
                if optional {
                    return Ok(());
                }
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let div = match cfg.get_data_item_value_type(strings::PEER_TYPE)? {
            DataItemValueType::Str => DataItemValue::Str(peer_type),
            _ => {
                let flags = client.param_uint_or("peer-flags", 0)?;
                DataItemValue::U8Str(flags as u8, peer_type)
            }
        };
        self.add_data_item(DataItem::new(strings::PEER_TYPE, div, &cfg, None)?)
    }

    pub fn add_experiment_names(&mut self) -> Result<(), MessageError> {
        let cfg = self.cfg.clone();
        for name in cfg.experiment_names() {
            let di = DataItem::new(
                strings::EXPERIMENTAL_DEFINITION,
                DataItemValue::Str(name),
                &cfg,
                None,
            )?;
            self.add_data_item(di)?;
        }
        Ok(())
    }

    /// Add a Status data item, soft-remapping names the current
    /// configuration does not define onto nearby ones it does.
    pub fn add_status(&mut self, status_name: &str, reason: &str) -> Result<(), MessageError> {
        let cfg = self.cfg.clone();
        let resolved = cfg.resolve_status_name(status_name);
        if resolved != status_name {
            info!(
                "status {} not configured, sending {} instead",
                status_name, resolved
            );
        }
        let id = cfg.get_status_code_id(&resolved)?;

        let div = match cfg.get_data_item_value_type(strings::STATUS)? {
            DataItemValueType::U8 => DataItemValue::U8(id as u8),
            _ => DataItemValue::U8Str(id as u8, reason.to_string()),
        };
        self.add_data_item(DataItem::new(strings::STATUS, div, &cfg, None)?)
    }

    pub fn add_extensions(&mut self, extensions: &[ExtensionId]) -> Result<(), MessageError> {
        let cfg = self.cfg.clone();
        let di = DataItem::new(
            strings::EXTENSIONS_SUPPORTED,
            DataItemValue::VExtId(extensions.to_vec()),
            &cfg,
            None,
        )?;
        self.add_data_item(di)
    }

    pub fn add_mac(&mut self, mac: &MacAddress) -> Result<(), MessageError> {
        let cfg = self.cfg.clone();
        let di = DataItem::new(
            strings::MAC_ADDRESS,
            DataItemValue::Mac(mac.clone()),
            &cfg,
            None,
        )?;
        self.add_data_item(di)
    }

    /// Version, optional peer type, and experiment names; the common
    /// tail of the session establishment messages. Drafts without a
    /// Version data item simply omit it.
    pub fn add_common_data_items(&mut self, client: &dyn DlepClient) -> Result<(), MessageError> {
        if self.cfg.get_data_item_info(strings::VERSION).is_ok() {
            self.add_version()?;
        }
        self.add_peer_type(client)?;
        self.add_experiment_names()
    }

    // ------------------------------------------------------------------
    // Buffer access

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Peek at a stream buffer: if a complete message header is present,
    /// return the total size of the next message. Streams carry messages
    /// only, never prefixed signals.
    pub fn is_complete_message(cfg: &ProtocolConfig, buf: &[u8]) -> Option<usize> {
        let header = cfg.signal_id_size() + cfg.signal_length_size();
        if buf.len() < header {
            return None;
        }
        let mut dec = Decoder::new(buf);
        let _id = dec.get_uint(cfg.signal_id_size()).ok()?;
        let length = dec.get_uint(cfg.signal_length_size()).ok()? as usize;
        Some(header + length)
    }

    // ------------------------------------------------------------------
    // Parsing

    /// Parse raw bytes into this message. For signals the configured
    /// prefix must be present; mismatch fails fast.
    pub fn parse(&mut self, buf: &[u8], is_signal: bool) -> Result<(), MessageError> {
        let mut dec = Decoder::new(buf);
        if is_signal {
            let prefix = self.cfg.signal_prefix().as_bytes().to_vec();
            if !prefix.is_empty() && dec.get_bytes(prefix.len())? != prefix.as_slice() {
                return Err(WireError::BadPrefix.into());
            }
        }
        let id = dec.get_uint(self.cfg.signal_id_size())? as SignalId;
        let length = dec.get_uint(self.cfg.signal_length_size())? as usize;
        if length != dec.remaining() {
            return Err(WireError::BadField(format!(
                "message length {} does not match {} remaining bytes",
                length,
                dec.remaining()
            ))
            .into());
        }

        let name = if is_signal {
            self.cfg.get_signal_name(id)?
        } else {
            self.cfg.get_message_name(id)?
        }
        .to_string();

        let cfg = self.cfg.clone();
        let mut items = Vec::new();
        while !dec.is_exhausted() {
            items.push(DataItem::deserialize(&mut dec, &cfg, None)?);
        }

        self.buf = buf.to_vec();
        self.signal_id = Some(id);
        self.signal_name = name;
        self.is_signal = is_signal;
        self.data_items = items;
        Ok(())
    }

    /// Whole-message validation: the sender's side must be allowed to
    /// send this signal, occurrence constraints must hold, and each data
    /// item must validate.
    pub fn validate(&self, modem_sender: bool) -> Result<(), String> {
        let info = self
            .cfg
            .get_signal_info(&self.signal_name)
            .map_err(|e| e.to_string())?;

        if modem_sender && !info.modem_sends {
            return Err(format!("modem may not send {}", self.signal_name));
        }
        if !modem_sender && !info.router_sends {
            return Err(format!("router may not send {}", self.signal_name));
        }

        DataItem::validate_occurrences(&self.data_items, &info.data_items, &self.cfg, None)
            .map_err(|e| format!("{}: {}", self.signal_name, e))?;

        for di in &self.data_items {
            di.validate(&self.cfg, None)
                .map_err(|e| format!("{}: {}", self.signal_name, e))?;
        }
        Ok(())
    }

    pub fn parse_and_validate(
        &mut self,
        buf: &[u8],
        is_signal: bool,
        modem_sender: bool,
    ) -> Result<(), String> {
        self.parse(buf, is_signal).map_err(|e| e.to_string())?;
        self.validate(modem_sender)
    }

    // ------------------------------------------------------------------
    // Retrieval

    pub fn signal_id(&self) -> Result<SignalId, MessageError> {
        self.signal_id.ok_or(MessageError::NoHeader)
    }

    pub fn signal_name(&self) -> &str {
        &self.signal_name
    }

    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    pub fn data_items(&self) -> &[DataItem] {
        &self.data_items
    }

    /// All data items except the MAC Address, i.e. the per-destination
    /// payload of a destination message.
    pub fn data_items_no_mac(&self) -> Result<Vec<DataItem>, MessageError> {
        let mac_id = self.cfg.get_data_item_id(strings::MAC_ADDRESS, None)?;
        Ok(self
            .data_items
            .iter()
            .filter(|di| di.id != mac_id)
            .cloned()
            .collect())
    }

    /// Metric and IP address data items only.
    pub fn metrics_and_ipaddrs(&self) -> Result<Vec<DataItem>, MessageError> {
        let mut out = Vec::new();
        for di in &self.data_items {
            let info = self.cfg.get_data_item_info_by_id(di.id, None)?;
            if info.metric || info.value_type.holds_ip() {
                out.push(di.clone());
            }
        }
        Ok(out)
    }

    fn find(&self, name: &str) -> Result<Option<&DataItem>, MessageError> {
        let id = self.cfg.get_data_item_id(name, None)?;
        Ok(self.data_items.iter().find(|di| di.id == id))
    }

    fn require(&self, name: &str) -> Result<&DataItem, MessageError> {
        self.find(name)?
            .ok_or_else(|| MessageError::NotPresent(name.to_string()))
    }

    pub fn data_item_exists(&self, name: &str) -> bool {
        matches!(self.find(name), Ok(Some(_)))
    }

    pub fn get_mac(&self) -> Result<MacAddress, MessageError> {
        match &self.require(strings::MAC_ADDRESS)?.value {
            DataItemValue::Mac(mac) => Ok(mac.clone()),
            _ => Err(MessageError::WrongType(strings::MAC_ADDRESS.to_string())),
        }
    }

    /// Status name carried by this message, or None when absent.
    pub fn get_status(&self) -> Result<Option<String>, MessageError> {
        let Some(di) = self.find(strings::STATUS)? else {
            return Ok(None);
        };
        let id = match &di.value {
            DataItemValue::U8(v) => u32::from(*v),
            DataItemValue::U8Str(v, _) => u32::from(*v),
            _ => return Err(MessageError::WrongType(strings::STATUS.to_string())),
        };
        Ok(Some(self.cfg.get_status_code_name(id)?.to_string()))
    }

    pub fn get_peer_type(&self) -> Result<String, MessageError> {
        match self.find(strings::PEER_TYPE)? {
            None => Ok(String::new()),
            Some(di) => match &di.value {
                DataItemValue::Str(s) => Ok(s.clone()),
                DataItemValue::U8Str(_, s) => Ok(s.clone()),
                _ => Err(MessageError::WrongType(strings::PEER_TYPE.to_string())),
            },
        }
    }

    pub fn get_experiment_names(&self) -> Result<Vec<String>, MessageError> {
        let id = self
            .cfg
            .get_data_item_id(strings::EXPERIMENTAL_DEFINITION, None)?;
        let mut names = Vec::new();
        for di in self.data_items.iter().filter(|di| di.id == id) {
            match &di.value {
                DataItemValue::Str(s) => names.push(s.clone()),
                _ => {
                    return Err(MessageError::WrongType(
                        strings::EXPERIMENTAL_DEFINITION.to_string(),
                    ))
                }
            }
        }
        Ok(names)
    }

    /// Raw heartbeat interval in the sender's configured units.
    pub fn get_heartbeat_interval(&self) -> Result<u32, MessageError> {
        match &self.require(strings::HEARTBEAT_INTERVAL)?.value {
            DataItemValue::U16(v) => Ok(u32::from(*v)),
            DataItemValue::U32(v) => Ok(*v),
            _ => Err(MessageError::WrongType(
                strings::HEARTBEAT_INTERVAL.to_string(),
            )),
        }
    }

    pub fn get_extensions(&self) -> Result<Vec<ExtensionId>, MessageError> {
        match self.find(strings::EXTENSIONS_SUPPORTED)? {
            None => Ok(Vec::new()),
            Some(di) => match &di.value {
                DataItemValue::VExtId(ids) => Ok(ids.clone()),
                _ => Err(MessageError::WrongType(
                    strings::EXTENSIONS_SUPPORTED.to_string(),
                )),
            },
        }
    }

    pub fn get_version(&self) -> Result<[u16; 2], MessageError> {
        match &self.require(strings::VERSION)?.value {
            DataItemValue::A2U16(v) => Ok(*v),
            _ => Err(MessageError::WrongType(strings::VERSION.to_string())),
        }
    }

    pub fn get_port(&self) -> Result<u16, MessageError> {
        match &self.require(strings::PORT)?.value {
            DataItemValue::U16(v) => Ok(*v),
            _ => Err(MessageError::WrongType(strings::PORT.to_string())),
        }
    }

    pub fn get_ipv4_address(&self) -> Result<(u8, Ipv4Addr), MessageError> {
        match &self.require(strings::IPV4_ADDRESS)?.value {
            DataItemValue::U8Ipv4(flags, ip) => Ok((*flags, *ip)),
            _ => Err(MessageError::WrongType(strings::IPV4_ADDRESS.to_string())),
        }
    }

    pub fn get_ipv6_address(&self) -> Result<(u8, Ipv6Addr), MessageError> {
        match &self.require(strings::IPV6_ADDRESS)?.value {
            DataItemValue::U8Ipv6(flags, ip) => Ok((*flags, *ip)),
            _ => Err(MessageError::WrongType(strings::IPV6_ADDRESS.to_string())),
        }
    }

    pub fn get_ipv4_conn_point(&self) -> Result<(u8, Ipv4Addr, u16), MessageError> {
        match &self.require(strings::IPV4_CONNECTION_POINT)?.value {
            DataItemValue::U8Ipv4U16(flags, ip, port) => Ok((*flags, *ip, *port)),
            _ => Err(MessageError::WrongType(
                strings::IPV4_CONNECTION_POINT.to_string(),
            )),
        }
    }

    pub fn get_ipv6_conn_point(&self) -> Result<(u8, Ipv6Addr, u16), MessageError> {
        match &self.require(strings::IPV6_CONNECTION_POINT)?.value {
            DataItemValue::U8Ipv6U16(flags, ip, port) => Ok((*flags, *ip, *port)),
            _ => Err(MessageError::WrongType(
                strings::IPV6_CONNECTION_POINT.to_string(),
            )),
        }
    }
}
