//! The typed data item model.
//!
//! A data item is the `(id, value)` pair carried as a TLV inside every
//! signal and message. The value is one of a closed set of wire shapes;
//! which shape a given id uses comes from the protocol configuration, so
//! the same code handles every draft's data item catalog. Serialization,
//! the textual form, and validation are all driven by the configured
//! [`DataItemValueType`].

use crate::codec::{Decoder, Encoder};
use crate::error::{ConfigError, WireError};
use crate::protocfg::{DataItemInfo, ProtocolConfig, SubDataItem, Units};
use crate::types::{strings, DataItemId, ExtensionId, MacAddress, StatusCodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Tag for each wire shape a data item value can take. Kept in lockstep
/// with [`DataItemValue`]; the mapping is the explicit match in
/// [`DataItemValue::value_type`], never variant-index arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataItemValueType {
    Blank,
    U8,
    U16,
    U32,
    U64,
    VU8,
    A2U16,
    A2U64,
    Str,
    Mac,
    U8Str,
    U8Ipv4,
    Ipv4U8,
    U8Ipv6,
    Ipv6U8,
    U64U8,
    U16VU8,
    VExtId,
    U8Ipv4U16,
    U8Ipv6U16,
    U8Ipv4U8,
    U8Ipv6U8,
    U64U64,
    SubDataItems,
}

/// (type, catalog spelling) table; one row per variant.
const VALUE_TYPE_NAMES: &[(DataItemValueType, &str)] = &[
    (DataItemValueType::Blank, "blank"),
    (DataItemValueType::U8, "u8"),
    (DataItemValueType::U16, "u16"),
    (DataItemValueType::U32, "u32"),
    (DataItemValueType::U64, "u64"),
    (DataItemValueType::VU8, "v_u8"),
    (DataItemValueType::A2U16, "a2_u16"),
    (DataItemValueType::A2U64, "a2_u64"),
    (DataItemValueType::Str, "string"),
    (DataItemValueType::Mac, "mac"),
    (DataItemValueType::U8Str, "u8_string"),
    (DataItemValueType::U8Ipv4, "u8_ipv4"),
    (DataItemValueType::Ipv4U8, "ipv4_u8"),
    (DataItemValueType::U8Ipv6, "u8_ipv6"),
    (DataItemValueType::Ipv6U8, "ipv6_u8"),
    (DataItemValueType::U64U8, "u64_u8"),
    (DataItemValueType::U16VU8, "u16_vu8"),
    (DataItemValueType::VExtId, "v_extid"),
    (DataItemValueType::U8Ipv4U16, "u8_ipv4_u16"),
    (DataItemValueType::U8Ipv6U16, "u8_ipv6_u16"),
    (DataItemValueType::U8Ipv4U8, "u8_ipv4_u8"),
    (DataItemValueType::U8Ipv6U8, "u8_ipv6_u8"),
    (DataItemValueType::U64U64, "u64_u64"),
    (DataItemValueType::SubDataItems, "sub_data_items"),
];

impl DataItemValueType {
    pub fn as_str(self) -> &'static str {
        VALUE_TYPE_NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, s)| *s)
            .unwrap_or("unknown")
    }

    /// Does this shape carry an IP address?
    pub fn holds_ip(self) -> bool {
        matches!(
            self,
            DataItemValueType::U8Ipv4
                | DataItemValueType::Ipv4U8
                | DataItemValueType::U8Ipv6
                | DataItemValueType::Ipv6U8
                | DataItemValueType::U8Ipv4U16
                | DataItemValueType::U8Ipv6U16
                | DataItemValueType::U8Ipv4U8
                | DataItemValueType::U8Ipv6U8
        )
    }
}

impl FromStr for DataItemValueType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VALUE_TYPE_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(t, _)| *t)
            .ok_or_else(|| {
                ConfigError::BadProtocolConfig(format!("unknown data item value type {:?}", s))
            })
    }
}

impl std::fmt::Display for DataItemValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One data item value of any configured shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataItemValue {
    Blank,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    VU8(Vec<u8>),
    A2U16([u16; 2]),
    A2U64([u64; 2]),
    Str(String),
    Mac(MacAddress),
    U8Str(u8, String),
    U8Ipv4(u8, Ipv4Addr),
    Ipv4U8(Ipv4Addr, u8),
    U8Ipv6(u8, Ipv6Addr),
    Ipv6U8(Ipv6Addr, u8),
    U64U8(u64, u8),
    U16VU8(u16, Vec<u8>),
    VExtId(Vec<ExtensionId>),
    U8Ipv4U16(u8, Ipv4Addr, u16),
    U8Ipv6U16(u8, Ipv6Addr, u16),
    U8Ipv4U8(u8, Ipv4Addr, u8),
    U8Ipv6U8(u8, Ipv6Addr, u8),
    U64U64(u64, u64),
    SubDataItems(Vec<DataItem>),
}

impl DataItemValue {
    pub fn value_type(&self) -> DataItemValueType {
        match self {
            DataItemValue::Blank => DataItemValueType::Blank,
            DataItemValue::U8(_) => DataItemValueType::U8,
            DataItemValue::U16(_) => DataItemValueType::U16,
            DataItemValue::U32(_) => DataItemValueType::U32,
            DataItemValue::U64(_) => DataItemValueType::U64,
            DataItemValue::VU8(_) => DataItemValueType::VU8,
            DataItemValue::A2U16(_) => DataItemValueType::A2U16,
            DataItemValue::A2U64(_) => DataItemValueType::A2U64,
            DataItemValue::Str(_) => DataItemValueType::Str,
            DataItemValue::Mac(_) => DataItemValueType::Mac,
            DataItemValue::U8Str(..) => DataItemValueType::U8Str,
            DataItemValue::U8Ipv4(..) => DataItemValueType::U8Ipv4,
            DataItemValue::Ipv4U8(..) => DataItemValueType::Ipv4U8,
            DataItemValue::U8Ipv6(..) => DataItemValueType::U8Ipv6,
            DataItemValue::Ipv6U8(..) => DataItemValueType::Ipv6U8,
            DataItemValue::U64U8(..) => DataItemValueType::U64U8,
            DataItemValue::U16VU8(..) => DataItemValueType::U16VU8,
            DataItemValue::VExtId(_) => DataItemValueType::VExtId,
            DataItemValue::U8Ipv4U16(..) => DataItemValueType::U8Ipv4U16,
            DataItemValue::U8Ipv6U16(..) => DataItemValueType::U8Ipv6U16,
            DataItemValue::U8Ipv4U8(..) => DataItemValueType::U8Ipv4U8,
            DataItemValue::U8Ipv6U8(..) => DataItemValueType::U8Ipv6U8,
            DataItemValue::U64U64(..) => DataItemValueType::U64U64,
            DataItemValue::SubDataItems(_) => DataItemValueType::SubDataItems,
        }
    }

    /// Zeroed/empty value for a configured shape.
    pub fn default_for(vt: DataItemValueType) -> Self {
        match vt {
            DataItemValueType::Blank => DataItemValue::Blank,
            DataItemValueType::U8 => DataItemValue::U8(0),
            DataItemValueType::U16 => DataItemValue::U16(0),
            DataItemValueType::U32 => DataItemValue::U32(0),
            DataItemValueType::U64 => DataItemValue::U64(0),
            DataItemValueType::VU8 => DataItemValue::VU8(Vec::new()),
            DataItemValueType::A2U16 => DataItemValue::A2U16([0; 2]),
            DataItemValueType::A2U64 => DataItemValue::A2U64([0; 2]),
            DataItemValueType::Str => DataItemValue::Str(String::new()),
            DataItemValueType::Mac => DataItemValue::Mac(MacAddress::empty()),
            DataItemValueType::U8Str => DataItemValue::U8Str(0, String::new()),
            DataItemValueType::U8Ipv4 => DataItemValue::U8Ipv4(0, Ipv4Addr::UNSPECIFIED),
            DataItemValueType::Ipv4U8 => DataItemValue::Ipv4U8(Ipv4Addr::UNSPECIFIED, 0),
            DataItemValueType::U8Ipv6 => DataItemValue::U8Ipv6(0, Ipv6Addr::UNSPECIFIED),
            DataItemValueType::Ipv6U8 => DataItemValue::Ipv6U8(Ipv6Addr::UNSPECIFIED, 0),
            DataItemValueType::U64U8 => DataItemValue::U64U8(0, 0),
            DataItemValueType::U16VU8 => DataItemValue::U16VU8(0, Vec::new()),
            DataItemValueType::VExtId => DataItemValue::VExtId(Vec::new()),
            DataItemValueType::U8Ipv4U16 => {
                DataItemValue::U8Ipv4U16(0, Ipv4Addr::UNSPECIFIED, 0)
            }
            DataItemValueType::U8Ipv6U16 => {
                DataItemValue::U8Ipv6U16(0, Ipv6Addr::UNSPECIFIED, 0)
            }
            DataItemValueType::U8Ipv4U8 => DataItemValue::U8Ipv4U8(0, Ipv4Addr::UNSPECIFIED, 0),
            DataItemValueType::U8Ipv6U8 => DataItemValue::U8Ipv6U8(0, Ipv6Addr::UNSPECIFIED, 0),
            DataItemValueType::U64U64 => DataItemValue::U64U64(0, 0),
            DataItemValueType::SubDataItems => DataItemValue::SubDataItems(Vec::new()),
        }
    }
}

/// Add/drop flag of an IP-bearing data item. `None` doubles as "drop"
/// for shapes with a flag byte; shapes without one (the draft-8 attached
/// subnets) are implicitly additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFlags {
    None,
    Add,
}

/// One DLEP data item: a TLV inside a signal or message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub id: DataItemId,
    pub value: DataItemValue,
}

impl DataItem {
    /// Build a data item by catalog name, resolving the id in the given
    /// scope.
    pub fn new(
        name: &str,
        value: DataItemValue,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<Self, ConfigError> {
        let id = cfg.get_data_item_id(name, parent)?;
        Ok(Self { id, value })
    }

    /// Build a data item by name with the zeroed value for its configured
    /// shape.
    pub fn with_default(
        name: &str,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<Self, ConfigError> {
        let info = cfg.get_data_item_info(name)?;
        let id = cfg.get_data_item_id(name, parent)?;
        Ok(Self {
            id,
            value: DataItemValue::default_for(info.value_type),
        })
    }

    pub fn name<'c>(
        &self,
        cfg: &'c ProtocolConfig,
        parent: Option<&'c DataItemInfo>,
    ) -> Result<&'c str, ConfigError> {
        cfg.get_data_item_name(self.id, parent)
    }

    // ------------------------------------------------------------------
    // Wire form

    /// Serialize as `[id][length][payload]` with the configured widths.
    pub fn serialize(&self, cfg: &ProtocolConfig) -> Result<Vec<u8>, WireError> {
        let mut enc = Encoder::new();
        self.serialize_into(&mut enc, cfg)?;
        Ok(enc.into_bytes())
    }

    pub fn serialize_into(&self, enc: &mut Encoder, cfg: &ProtocolConfig) -> Result<(), WireError> {
        let payload = self.serialize_value(cfg)?;
        enc.put_uint(u64::from(self.id), cfg.data_item_id_size())?;
        enc.put_uint(payload.len() as u64, cfg.data_item_length_size())?;
        enc.put_bytes(&payload);
        Ok(())
    }

    fn serialize_value(&self, cfg: &ProtocolConfig) -> Result<Vec<u8>, WireError> {
        let mut enc = Encoder::new();
        match &self.value {
            DataItemValue::Blank => {}
            DataItemValue::U8(v) => enc.put_u8(*v),
            DataItemValue::U16(v) => enc.put_uint(u64::from(*v), 2)?,
            DataItemValue::U32(v) => enc.put_uint(u64::from(*v), 4)?,
            DataItemValue::U64(v) => enc.put_uint(*v, 8)?,
            DataItemValue::VU8(v) => enc.put_bytes(v),
            DataItemValue::A2U16(a) => {
                enc.put_uint(u64::from(a[0]), 2)?;
                enc.put_uint(u64::from(a[1]), 2)?;
            }
            DataItemValue::A2U64(a) => {
                enc.put_uint(a[0], 8)?;
                enc.put_uint(a[1], 8)?;
            }
            DataItemValue::Str(s) => enc.put_bytes(s.as_bytes()),
            DataItemValue::Mac(mac) => enc.put_bytes(&mac.bytes),
            DataItemValue::U8Str(flags, s) => {
                enc.put_u8(*flags);
                enc.put_bytes(s.as_bytes());
            }
            DataItemValue::U8Ipv4(flags, ip) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
            }
            DataItemValue::Ipv4U8(ip, prefix) => {
                enc.put_bytes(&ip.octets());
                enc.put_u8(*prefix);
            }
            DataItemValue::U8Ipv6(flags, ip) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
            }
            DataItemValue::Ipv6U8(ip, prefix) => {
                enc.put_bytes(&ip.octets());
                enc.put_u8(*prefix);
            }
            DataItemValue::U64U8(a, b) => {
                enc.put_uint(*a, 8)?;
                enc.put_u8(*b);
            }
            DataItemValue::U16VU8(a, v) => {
                enc.put_uint(u64::from(*a), 2)?;
                enc.put_bytes(v);
            }
            DataItemValue::VExtId(ids) => {
                let width = cfg.extension_id_size();
                for id in ids {
                    enc.put_uint(u64::from(*id), width)?;
                }
            }
            DataItemValue::U8Ipv4U16(flags, ip, port) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
                // Connection point: the port is omitted when zero.
                if *port != 0 {
                    enc.put_uint(u64::from(*port), 2)?;
                }
            }
            DataItemValue::U8Ipv6U16(flags, ip, port) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
                if *port != 0 {
                    enc.put_uint(u64::from(*port), 2)?;
                }
            }
            DataItemValue::U8Ipv4U8(flags, ip, prefix) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
                enc.put_u8(*prefix);
            }
            DataItemValue::U8Ipv6U8(flags, ip, prefix) => {
                enc.put_u8(*flags);
                enc.put_bytes(&ip.octets());
                enc.put_u8(*prefix);
            }
            DataItemValue::U64U64(a, b) => {
                enc.put_uint(*a, 8)?;
                enc.put_uint(*b, 8)?;
            }
            DataItemValue::SubDataItems(subs) => {
                for sub in subs {
                    sub.serialize_into(&mut enc, cfg)?;
                }
            }
        }
        Ok(enc.into_bytes())
    }

    /// Parse one data item from the decoder. The id's shape is looked up
    /// in the configuration (scoped by `parent` for sub data items), and
    /// exactly `length` payload bytes are consumed; fixed shapes with
    /// leftover bytes fail.
    pub fn deserialize(
        dec: &mut Decoder<'_>,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<Self, WireError> {
        let id = dec.get_uint(cfg.data_item_id_size())? as DataItemId;
        let length = dec.get_uint(cfg.data_item_length_size())? as usize;
        if length > dec.remaining() {
            return Err(WireError::BadLength { id, length });
        }
        let mut payload = dec.slice(length)?;
        let info = cfg.get_data_item_info_by_id(id, parent)?;
        let value = Self::deserialize_value(&mut payload, info, cfg)?;
        if !payload.is_exhausted() {
            return Err(WireError::Residual(payload.remaining()));
        }
        Ok(Self { id, value })
    }

    fn deserialize_value(
        dec: &mut Decoder<'_>,
        info: &DataItemInfo,
        cfg: &ProtocolConfig,
    ) -> Result<DataItemValue, WireError> {
        let value = match info.value_type {
            DataItemValueType::Blank => DataItemValue::Blank,
            DataItemValueType::U8 => DataItemValue::U8(dec.get_u8()?),
            DataItemValueType::U16 => DataItemValue::U16(dec.get_uint(2)? as u16),
            DataItemValueType::U32 => DataItemValue::U32(dec.get_uint(4)? as u32),
            DataItemValueType::U64 => DataItemValue::U64(dec.get_uint(8)?),
            DataItemValueType::VU8 => DataItemValue::VU8(dec.get_bytes(dec.remaining())?.to_vec()),
            DataItemValueType::A2U16 => {
                DataItemValue::A2U16([dec.get_uint(2)? as u16, dec.get_uint(2)? as u16])
            }
            DataItemValueType::A2U64 => {
                DataItemValue::A2U64([dec.get_uint(8)?, dec.get_uint(8)?])
            }
            DataItemValueType::Str => DataItemValue::Str(read_string(dec)?),
            DataItemValueType::Mac => {
                DataItemValue::Mac(MacAddress::new(dec.get_bytes(dec.remaining())?.to_vec()))
            }
            DataItemValueType::U8Str => {
                let flags = dec.get_u8()?;
                DataItemValue::U8Str(flags, read_string(dec)?)
            }
            DataItemValueType::U8Ipv4 => {
                DataItemValue::U8Ipv4(dec.get_u8()?, read_ipv4(dec)?)
            }
            DataItemValueType::Ipv4U8 => {
                DataItemValue::Ipv4U8(read_ipv4(dec)?, dec.get_u8()?)
            }
            DataItemValueType::U8Ipv6 => {
                DataItemValue::U8Ipv6(dec.get_u8()?, read_ipv6(dec)?)
            }
            DataItemValueType::Ipv6U8 => {
                DataItemValue::Ipv6U8(read_ipv6(dec)?, dec.get_u8()?)
            }
            DataItemValueType::U64U8 => {
                DataItemValue::U64U8(dec.get_uint(8)?, dec.get_u8()?)
            }
            DataItemValueType::U16VU8 => {
                let first = dec.get_uint(2)? as u16;
                DataItemValue::U16VU8(first, dec.get_bytes(dec.remaining())?.to_vec())
            }
            DataItemValueType::VExtId => {
                let width = cfg.extension_id_size();
                let mut ids = Vec::new();
                while !dec.is_exhausted() {
                    ids.push(dec.get_uint(width)? as ExtensionId);
                }
                DataItemValue::VExtId(ids)
            }
            DataItemValueType::U8Ipv4U16 => {
                let flags = dec.get_u8()?;
                let ip = read_ipv4(dec)?;
                // Port present iff any bytes remain.
                let port = if dec.is_exhausted() {
                    0
                } else {
                    dec.get_uint(2)? as u16
                };
                DataItemValue::U8Ipv4U16(flags, ip, port)
            }
            DataItemValueType::U8Ipv6U16 => {
                let flags = dec.get_u8()?;
                let ip = read_ipv6(dec)?;
                let port = if dec.is_exhausted() {
                    0
                } else {
                    dec.get_uint(2)? as u16
                };
                DataItemValue::U8Ipv6U16(flags, ip, port)
            }
            DataItemValueType::U8Ipv4U8 => {
                DataItemValue::U8Ipv4U8(dec.get_u8()?, read_ipv4(dec)?, dec.get_u8()?)
            }
            DataItemValueType::U8Ipv6U8 => {
                DataItemValue::U8Ipv6U8(dec.get_u8()?, read_ipv6(dec)?, dec.get_u8()?)
            }
            DataItemValueType::U64U64 => {
                DataItemValue::U64U64(dec.get_uint(8)?, dec.get_uint(8)?)
            }
            DataItemValueType::SubDataItems => {
                let mut subs = Vec::new();
                while !dec.is_exhausted() {
                    subs.push(DataItem::deserialize(dec, cfg, Some(info))?);
                }
                DataItemValue::SubDataItems(subs)
            }
        };
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Textual form

    /// `name value`, the inverse of [`DataItem::from_text`].
    pub fn to_text(
        &self,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<String, ConfigError> {
        let name = cfg.get_data_item_name(self.id, parent)?.to_string();
        let info = cfg.get_data_item_info(&name)?;
        Ok(format!("{} {}", name, self.value_to_text(cfg, info)?))
    }

    /// Textual value form. Composites separate fields with `;`,
    /// ip-prefix subnets use `/`, vectors use `,`, sub data items nest
    /// in `{ }`.
    ///
    /// A `string` value is emitted opaquely; because the text parser
    /// tokenizes on whitespace, strings containing spaces do not
    /// round-trip through [`DataItem::from_text`].
    pub fn value_to_text(
        &self,
        cfg: &ProtocolConfig,
        info: &DataItemInfo,
    ) -> Result<String, ConfigError> {
        let text = match &self.value {
            DataItemValue::Blank => String::new(),
            DataItemValue::U8(v) => v.to_string(),
            DataItemValue::U16(v) => v.to_string(),
            DataItemValue::U32(v) => v.to_string(),
            DataItemValue::U64(v) => v.to_string(),
            DataItemValue::VU8(v) => join_ints(v.iter().map(|x| u64::from(*x))),
            DataItemValue::A2U16(a) => join_ints(a.iter().map(|x| u64::from(*x))),
            DataItemValue::A2U64(a) => join_ints(a.iter().copied()),
            DataItemValue::Str(s) => s.clone(),
            DataItemValue::Mac(mac) => mac.to_string(),
            DataItemValue::U8Str(flags, s) => format!("{};{}", flags, s),
            DataItemValue::U8Ipv4(flags, ip) => format!("{};{}", flags, ip),
            DataItemValue::Ipv4U8(ip, prefix) => format!("{}/{}", ip, prefix),
            DataItemValue::U8Ipv6(flags, ip) => format!("{};{}", flags, ip),
            DataItemValue::Ipv6U8(ip, prefix) => format!("{}/{}", ip, prefix),
            DataItemValue::U64U8(a, b) => format!("{};{}", a, b),
            DataItemValue::U16VU8(a, v) => {
                format!("{};{}", a, join_ints(v.iter().map(|x| u64::from(*x))))
            }
            DataItemValue::VExtId(ids) => join_ints(ids.iter().map(|x| u64::from(*x))),
            DataItemValue::U8Ipv4U16(flags, ip, port) => format!("{};{};{}", flags, ip, port),
            DataItemValue::U8Ipv6U16(flags, ip, port) => format!("{};{};{}", flags, ip, port),
            DataItemValue::U8Ipv4U8(flags, ip, prefix) => format!("{};{};{}", flags, ip, prefix),
            DataItemValue::U8Ipv6U8(flags, ip, prefix) => format!("{};{};{}", flags, ip, prefix),
            DataItemValue::U64U64(a, b) => format!("{};{}", a, b),
            DataItemValue::SubDataItems(subs) => {
                let mut out = String::from("{ ");
                for sub in subs {
                    out.push_str(&sub.to_text(cfg, Some(info))?);
                    out.push(' ');
                }
                out.push('}');
                out
            }
        };
        Ok(text)
    }

    /// Parse `name value` text, the inverse of [`DataItem::to_text`].
    pub fn from_text(
        text: &str,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<Self, WireError> {
        let mut toks = Tokens::new(text);
        Self::parse_tokens(&mut toks, cfg, parent)
    }

    fn parse_tokens(
        toks: &mut Tokens<'_>,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<Self, WireError> {
        let name = toks
            .next()
            .ok_or_else(|| WireError::BadField("missing data item name".into()))?;
        let id = cfg.get_data_item_id(name, parent)?;
        let info = cfg.get_data_item_info(name)?;

        let value = if info.value_type == DataItemValueType::SubDataItems {
            let open = toks.next();
            if open != Some("{") {
                return Err(WireError::BadField(format!(
                    "expected {{ after {}, got {:?}",
                    name, open
                )));
            }
            let mut subs = Vec::new();
            loop {
                let mut look = *toks;
                match look.next() {
                    Some("}") => {
                        *toks = look;
                        break;
                    }
                    Some(_) => subs.push(Self::parse_tokens(toks, cfg, Some(info))?),
                    None => {
                        return Err(WireError::BadField(format!(
                            "unterminated sub data item list in {}",
                            name
                        )))
                    }
                }
            }
            DataItemValue::SubDataItems(subs)
        } else if info.value_type == DataItemValueType::Blank {
            DataItemValue::Blank
        } else {
            let tok = toks.next().ok_or_else(|| {
                WireError::BadField(format!("missing value for data item {}", name))
            })?;
            value_from_token(tok, info.value_type)?
        };

        Ok(Self { id, value })
    }

    // ------------------------------------------------------------------
    // Validation

    /// Check the stored value against the configuration: the value's
    /// shape must match the configured one, and shape-specific limits
    /// must hold. Returns a description of the problem, or Ok.
    pub fn validate(
        &self,
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<(), String> {
        let name = cfg
            .get_data_item_name(self.id, parent)
            .map_err(|e| e.to_string())?
            .to_string();
        let info = cfg.get_data_item_info(&name).map_err(|e| e.to_string())?;

        let vt = self.value.value_type();
        if info.value_type != vt {
            return Err(format!(
                "{} type is {}, must be {}",
                name, vt, info.value_type
            ));
        }

        self.validate_value(cfg, info)
            .map_err(|e| format!("{} {}", name, e))
    }

    fn validate_value(&self, cfg: &ProtocolConfig, info: &DataItemInfo) -> Result<(), String> {
        match &self.value {
            DataItemValue::U8(v) => {
                if info.units == Units::Percentage && *v > 100 {
                    return Err(format!("is {}, must be <= 100", v));
                }
                if info.name == strings::STATUS {
                    check_status_id(cfg, StatusCodeId::from(*v))?;
                }
            }
            DataItemValue::U8Str(flags, _) => {
                if info.name == strings::STATUS {
                    check_status_id(cfg, StatusCodeId::from(*flags))?;
                }
            }
            DataItemValue::U8Ipv4(flags, _) | DataItemValue::U8Ipv6(flags, _) => {
                check_add_drop(*flags)?;
            }
            DataItemValue::Ipv4U8(_, prefix) => check_prefix(*prefix, 32)?,
            DataItemValue::Ipv6U8(_, prefix) => check_prefix(*prefix, 128)?,
            DataItemValue::U8Ipv4U8(flags, _, prefix) => {
                check_add_drop(*flags)?;
                check_prefix(*prefix, 32)?;
            }
            DataItemValue::U8Ipv6U8(flags, _, prefix) => {
                check_add_drop(*flags)?;
                check_prefix(*prefix, 128)?;
            }
            DataItemValue::SubDataItems(subs) => {
                for sub in subs {
                    sub.validate(cfg, Some(info))?;
                }
                DataItem::validate_occurrences(subs, &info.sub_data_items, cfg, Some(info))?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Check a container of data items against the occurrence
    /// constraints of the allowed set. Used both for sub data items and
    /// for the top-level items of a message.
    pub fn validate_occurrences(
        data_items: &[DataItem],
        allowed: &[SubDataItem],
        cfg: &ProtocolConfig,
        parent: Option<&DataItemInfo>,
    ) -> Result<(), String> {
        let mut counts: HashMap<DataItemId, usize> = HashMap::new();
        for di in data_items {
            *counts.entry(di.id).or_insert(0) += 1;
        }

        for entry in allowed {
            let actual = counts.remove(&entry.id).unwrap_or(0);
            if !entry.occurs.check(actual) {
                return Err(format!(
                    "{} must occur {} times, but got {}",
                    entry.name, entry.occurs, actual
                ));
            }
        }

        // Anything left over was not in the allowed set.
        if !counts.is_empty() {
            let mut msg = String::from("unexpected data items:");
            for (id, count) in counts {
                let name = cfg
                    .get_data_item_name(id, parent)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("id {}", id));
                msg.push_str(&format!(" {}({})", name, count));
            }
            return Err(msg);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // IP address helpers

    /// Compare the IP-and-prefix portion of two IP-bearing data items,
    /// ignoring the add/drop flag. Differing shapes never compare equal.
    pub fn ip_equal(&self, other: &DataItem) -> bool {
        use DataItemValue as V;
        match (&self.value, &other.value) {
            (V::U8Ipv4(_, a), V::U8Ipv4(_, b)) => a == b,
            (V::U8Ipv6(_, a), V::U8Ipv6(_, b)) => a == b,
            (V::Ipv4U8(a, ap), V::Ipv4U8(b, bp)) => a == b && ap == bp,
            (V::Ipv6U8(a, ap), V::Ipv6U8(b, bp)) => a == b && ap == bp,
            (V::U8Ipv4U8(_, a, ap), V::U8Ipv4U8(_, b, bp)) => a == b && ap == bp,
            (V::U8Ipv6U8(_, a, ap), V::U8Ipv6U8(_, b, bp)) => a == b && ap == bp,
            _ => false,
        }
    }

    /// Add/drop flag of this data item; [`IpFlags::Add`] is synthesized
    /// for subnet shapes without a flag byte, and non-IP shapes report
    /// [`IpFlags::None`].
    pub fn ip_flags(&self) -> IpFlags {
        use DataItemValue as V;
        match &self.value {
            V::U8Ipv4(flags, _)
            | V::U8Ipv6(flags, _)
            | V::U8Ipv4U8(flags, _, _)
            | V::U8Ipv6U8(flags, _, _)
            | V::U8Ipv4U16(flags, _, _)
            | V::U8Ipv6U16(flags, _, _) => {
                if flags & 1 != 0 {
                    IpFlags::Add
                } else {
                    IpFlags::None
                }
            }
            V::Ipv4U8(..) | V::Ipv6U8(..) => IpFlags::Add,
            _ => IpFlags::None,
        }
    }

    /// Does this data item hold any IP address at all?
    pub fn holds_ip(&self) -> bool {
        self.value.value_type().holds_ip()
    }

    /// Find a data item in `items` whose IP information equals this one's.
    pub fn find_ip_data_item<'a>(&self, items: &'a [DataItem]) -> Option<&'a DataItem> {
        items.iter().find(|other| self.ip_equal(other))
    }
}

fn read_string(dec: &mut Decoder<'_>) -> Result<String, WireError> {
    let bytes = dec.get_bytes(dec.remaining())?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::BadField("string value is not UTF-8".into()))
}

fn read_ipv4(dec: &mut Decoder<'_>) -> Result<Ipv4Addr, WireError> {
    let bytes = dec.get_bytes(4)?;
    Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn read_ipv6(dec: &mut Decoder<'_>) -> Result<Ipv6Addr, WireError> {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(dec.get_bytes(16)?);
    Ok(Ipv6Addr::from(octets))
}

fn join_ints(values: impl Iterator<Item = u64>) -> String {
    values
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn check_add_drop(flags: u8) -> Result<(), String> {
    if flags > 1 {
        Err(format!("add/drop is {}, must be 0 or 1", flags))
    } else {
        Ok(())
    }
}

fn check_prefix(prefix: u8, max: u8) -> Result<(), String> {
    if prefix > max {
        Err(format!("subnet mask is {}, must be <= {}", prefix, max))
    } else {
        Ok(())
    }
}

fn check_status_id(cfg: &ProtocolConfig, id: StatusCodeId) -> Result<(), String> {
    cfg.get_status_code_name(id)
        .map(|_| ())
        .map_err(|_| format!("{} is invalid", id))
}

// ----------------------------------------------------------------------
// Text parsing

/// Whitespace tokenizer over the textual data item form.
#[derive(Debug, Clone, Copy)]
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }

    fn next(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            self.rest = trimmed;
            return None;
        }
        let end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        let (tok, rest) = trimmed.split_at(end);
        self.rest = rest;
        Some(tok)
    }
}

fn parse_uint<T: TryFrom<u64>>(tok: &str) -> Result<T, WireError> {
    let v: u64 = tok
        .parse()
        .map_err(|_| WireError::BadField(format!("bad integer {:?}", tok)))?;
    T::try_from(v).map_err(|_| WireError::BadField(format!("integer {} out of range", v)))
}

fn parse_ipv4(tok: &str) -> Result<Ipv4Addr, WireError> {
    tok.parse()
        .map_err(|_| WireError::BadField(format!("bad IPv4 address {:?}", tok)))
}

fn parse_ipv6(tok: &str) -> Result<Ipv6Addr, WireError> {
    tok.parse()
        .map_err(|_| WireError::BadField(format!("bad IPv6 address {:?}", tok)))
}

fn parse_int_list<T: TryFrom<u64>>(tok: &str) -> Result<Vec<T>, WireError> {
    if tok.is_empty() {
        return Ok(Vec::new());
    }
    tok.split(',').map(parse_uint).collect()
}

fn split_fields<const N: usize>(tok: &str, sep: char) -> Result<[&str; N], WireError> {
    let parts: Vec<&str> = tok.split(sep).collect();
    parts.try_into().map_err(|_| {
        WireError::BadField(format!(
            "expected {} fields separated by {:?} in {:?}",
            N, sep, tok
        ))
    })
}

/// Parse a single whitespace token into a value of the given shape.
fn value_from_token(tok: &str, vt: DataItemValueType) -> Result<DataItemValue, WireError> {
    let value = match vt {
        DataItemValueType::Blank | DataItemValueType::SubDataItems => {
            return Err(WireError::BadField(format!(
                "{} values are not parsed from a single token",
                vt
            )))
        }
        DataItemValueType::U8 => DataItemValue::U8(parse_uint(tok)?),
        DataItemValueType::U16 => DataItemValue::U16(parse_uint(tok)?),
        DataItemValueType::U32 => DataItemValue::U32(parse_uint(tok)?),
        DataItemValueType::U64 => DataItemValue::U64(parse_uint(tok)?),
        DataItemValueType::VU8 => DataItemValue::VU8(parse_int_list(tok)?),
        DataItemValueType::A2U16 => {
            let v: Vec<u16> = parse_int_list(tok)?;
            let a: [u16; 2] = v
                .try_into()
                .map_err(|_| WireError::BadField("expected exactly 2 integers".into()))?;
            DataItemValue::A2U16(a)
        }
        DataItemValueType::A2U64 => {
            let v: Vec<u64> = parse_int_list(tok)?;
            let a: [u64; 2] = v
                .try_into()
                .map_err(|_| WireError::BadField("expected exactly 2 integers".into()))?;
            DataItemValue::A2U64(a)
        }
        DataItemValueType::Str => DataItemValue::Str(tok.to_string()),
        DataItemValueType::Mac => DataItemValue::Mac(
            tok.parse()
                .map_err(|_| WireError::BadField(format!("bad MAC address {:?}", tok)))?,
        ),
        DataItemValueType::U8Str => {
            let [flags, s] = split_fields(tok, ';')?;
            DataItemValue::U8Str(parse_uint(flags)?, s.to_string())
        }
        DataItemValueType::U8Ipv4 => {
            let [flags, ip] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv4(parse_uint(flags)?, parse_ipv4(ip)?)
        }
        DataItemValueType::Ipv4U8 => {
            let [ip, prefix] = split_fields(tok, '/')?;
            DataItemValue::Ipv4U8(parse_ipv4(ip)?, parse_uint(prefix)?)
        }
        DataItemValueType::U8Ipv6 => {
            let [flags, ip] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv6(parse_uint(flags)?, parse_ipv6(ip)?)
        }
        DataItemValueType::Ipv6U8 => {
            let [ip, prefix] = split_fields(tok, '/')?;
            DataItemValue::Ipv6U8(parse_ipv6(ip)?, parse_uint(prefix)?)
        }
        DataItemValueType::U64U8 => {
            let [a, b] = split_fields(tok, ';')?;
            DataItemValue::U64U8(parse_uint(a)?, parse_uint(b)?)
        }
        DataItemValueType::U16VU8 => {
            let [a, list] = split_fields(tok, ';')?;
            DataItemValue::U16VU8(parse_uint(a)?, parse_int_list(list)?)
        }
        DataItemValueType::VExtId => DataItemValue::VExtId(parse_int_list(tok)?),
        DataItemValueType::U8Ipv4U16 => {
            let [flags, ip, port] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv4U16(parse_uint(flags)?, parse_ipv4(ip)?, parse_uint(port)?)
        }
        DataItemValueType::U8Ipv6U16 => {
            let [flags, ip, port] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv6U16(parse_uint(flags)?, parse_ipv6(ip)?, parse_uint(port)?)
        }
        DataItemValueType::U8Ipv4U8 => {
            let [flags, ip, prefix] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv4U8(parse_uint(flags)?, parse_ipv4(ip)?, parse_uint(prefix)?)
        }
        DataItemValueType::U8Ipv6U8 => {
            let [flags, ip, prefix] = split_fields(tok, ';')?;
            DataItemValue::U8Ipv6U8(parse_uint(flags)?, parse_ipv6(ip)?, parse_uint(prefix)?)
        }
        DataItemValueType::U64U64 => {
            let [a, b] = split_fields(tok, ';')?;
            DataItemValue::U64U64(parse_uint(a)?, parse_uint(b)?)
        }
    };
    Ok(value)
}
