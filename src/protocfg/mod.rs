//! Protocol configuration: the immutable catalog of signals, messages,
//! data items, status codes, and extension modules.
//!
//! The catalog is loaded from XML once at startup, cross-checked, and then
//! only read. Every component of the core consults it for wire widths, id
//! and name lookups, occurrence constraints, and sender permissions; none
//! of the wire grammar is hard-coded.

mod xml;

use crate::dataitem::DataItemValueType;
use crate::error::ConfigError;
use crate::types::{strings, DataItemId, ExtensionId, SignalId, StatusCodeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How many times a data item may occur within its parent scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurs {
    One,
    ZeroOrOne,
    ZeroOrMore,
    OneOrMore,
}

impl Occurs {
    pub fn check(self, count: usize) -> bool {
        match self {
            Occurs::One => count == 1,
            Occurs::ZeroOrOne => count <= 1,
            Occurs::ZeroOrMore => true,
            Occurs::OneOrMore => count >= 1,
        }
    }

    /// True when zero occurrences satisfy the constraint.
    pub fn optional(self) -> bool {
        matches!(self, Occurs::ZeroOrOne | Occurs::ZeroOrMore)
    }
}

impl FromStr for Occurs {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(Occurs::One),
            "0-1" => Ok(Occurs::ZeroOrOne),
            "0+" => Ok(Occurs::ZeroOrMore),
            "1+" => Ok(Occurs::OneOrMore),
            other => Err(ConfigError::BadProtocolConfig(format!(
                "bad occurs constraint {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Occurs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Occurs::One => "1",
            Occurs::ZeroOrOne => "0-1",
            Occurs::ZeroOrMore => "0+",
            Occurs::OneOrMore => "1+",
        };
        f.write_str(s)
    }
}

/// Units attached to a data item, affecting validation and the heartbeat
/// interval conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Units {
    #[default]
    None,
    Percentage,
    Seconds,
    Milliseconds,
    Microseconds,
}

impl FromStr for Units {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Units::None),
            "percentage" => Ok(Units::Percentage),
            "seconds" => Ok(Units::Seconds),
            "milliseconds" => Ok(Units::Milliseconds),
            "microseconds" => Ok(Units::Microseconds),
            other => Err(ConfigError::BadProtocolConfig(format!(
                "bad units {:?}",
                other
            ))),
        }
    }
}

/// A data item allowed inside a parent scope (a signal or another data
/// item), with its occurrence constraint and scope-local id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDataItem {
    pub name: String,
    pub id: DataItemId,
    pub occurs: Occurs,
}

/// Everything the catalog knows about one data item.
#[derive(Debug, Clone)]
pub struct DataItemInfo {
    pub name: String,
    /// `None` for data items that only appear nested inside a parent;
    /// their id then comes from the parent's [`SubDataItem`] entry.
    pub id: Option<DataItemId>,
    pub value_type: DataItemValueType,
    pub metric: bool,
    pub units: Units,
    pub module: String,
    /// Sub data items allowed inside this one (usually empty).
    pub sub_data_items: Vec<SubDataItem>,
}

/// Everything the catalog knows about one signal or message.
#[derive(Debug, Clone)]
pub struct SignalInfo {
    pub name: String,
    pub id: SignalId,
    /// Messages travel over the TCP session; signals over UDP with the
    /// configured prefix.
    pub is_message: bool,
    pub modem_sends: bool,
    pub router_sends: bool,
    /// Name of the expected response message, if this one requires one.
    pub response: Option<String>,
    pub data_items: Vec<SubDataItem>,
    pub module: String,
}

/// Whether receiving a status code ends the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    #[default]
    Continue,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct StatusCodeInfo {
    pub name: String,
    pub id: StatusCodeId,
    pub failure_mode: FailureMode,
    pub module: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub name: String,
    pub draft: String,
    pub experiment_name: String,
    pub extension_id: Option<ExtensionId>,
    pub data_items: Vec<String>,
    pub signals: Vec<SignalId>,
    pub messages: Vec<SignalId>,
    pub status_codes: Vec<StatusCodeId>,
}

/// Configured field widths, in bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct FieldSizes {
    pub signal_id: usize,
    pub signal_length: usize,
    pub data_item_id: usize,
    pub data_item_length: usize,
    pub extension_id: usize,
    pub status_code: usize,
}

#[derive(Debug)]
pub struct ProtocolConfig {
    version: [u16; 2],
    signal_prefix: String,
    sizes: FieldSizes,
    data_items: HashMap<String, DataItemInfo>,
    data_item_names: HashMap<DataItemId, String>,
    signals: HashMap<String, SignalInfo>,
    signal_names: HashMap<SignalId, String>,
    message_names: HashMap<SignalId, String>,
    status_codes: HashMap<String, StatusCodeInfo>,
    status_names: HashMap<StatusCodeId, String>,
    modules: Vec<ModuleInfo>,
}

impl ProtocolConfig {
    /// Load a catalog from a file, honoring `<xi:include>`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let catalog = xml::read_catalog(path)?;
        Self::resolve(catalog)
    }

    /// Parse a catalog from an in-memory XML string (no includes).
    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let catalog: xml::XmlCatalog =
            serde_xml_rs::from_str(text).map_err(|e| ConfigError::Xml(e.to_string()))?;
        Self::resolve(catalog)
    }

    fn resolve(catalog: xml::XmlCatalog) -> Result<Self, ConfigError> {
        let sizes = FieldSizes {
            signal_id: catalog.field_sizes.signal_id,
            signal_length: catalog.field_sizes.signal_length,
            data_item_id: catalog.field_sizes.data_item_id,
            data_item_length: catalog.field_sizes.data_item_length,
            extension_id: catalog.field_sizes.extension_id,
            status_code: catalog.field_sizes.status_code,
        };
        for (label, width) in [
            ("signal_id", sizes.signal_id),
            ("signal_length", sizes.signal_length),
            ("data_item_id", sizes.data_item_id),
            ("data_item_length", sizes.data_item_length),
            ("extension_id", sizes.extension_id),
            ("status_code", sizes.status_code),
        ] {
            if width < 1 || width > 4 {
                return Err(ConfigError::BadProtocolConfig(format!(
                    "field size {} = {} out of range 1-4",
                    label, width
                )));
            }
        }

        let mut cfg = ProtocolConfig {
            version: catalog
                .version
                .as_ref()
                .map(|v| [v.major, v.minor])
                .unwrap_or([0, 0]),
            signal_prefix: catalog.signal_prefix.clone().unwrap_or_default(),
            sizes,
            data_items: HashMap::new(),
            data_item_names: HashMap::new(),
            signals: HashMap::new(),
            signal_names: HashMap::new(),
            message_names: HashMap::new(),
            status_codes: HashMap::new(),
            status_names: HashMap::new(),
            modules: Vec::new(),
        };

        // First pass: data items and status codes from every module, so
        // signal references in later modules can resolve forward.
        for module in &catalog.modules {
            cfg.add_module_data_items(module)?;
            cfg.add_module_status_codes(module)?;
        }
        // Second pass: sub-data-item references, now that all names exist.
        cfg.resolve_sub_data_items()?;
        // Third pass: signals and extension references.
        for module in &catalog.modules {
            cfg.add_module_signals(module)?;
        }
        cfg.check_responses()?;
        cfg.check_status_remap()?;

        for module in &catalog.modules {
            let mut info = ModuleInfo {
                name: module.name.clone(),
                draft: module.draft.clone().unwrap_or_default(),
                experiment_name: module.experiment_name.clone().unwrap_or_default(),
                extension_id: module.extension_id,
                ..Default::default()
            };
            for di in &module.data_items {
                info.data_items.push(di.name.clone());
            }
            for sig in &module.signals {
                if let Some(id) = sig.id {
                    if sig.message.unwrap_or(false) {
                        info.messages.push(id);
                    } else {
                        info.signals.push(id);
                    }
                }
            }
            for sc in &module.status_codes {
                info.status_codes.push(sc.id);
            }
            cfg.modules.push(info);
        }

        Ok(cfg)
    }

    fn add_module_data_items(&mut self, module: &xml::XmlModule) -> Result<(), ConfigError> {
        for di in &module.data_items {
            if self.data_items.contains_key(&di.name) {
                return Err(ConfigError::BadProtocolConfig(format!(
                    "data item {} redefined by module {}",
                    di.name, module.name
                )));
            }
            if let Some(id) = di.id {
                if let Some(existing) = self.data_item_names.get(&id) {
                    return Err(ConfigError::BadProtocolConfig(format!(
                        "data item id {} used by both {} and {}",
                        id, existing, di.name
                    )));
                }
                self.data_item_names.insert(id, di.name.clone());
            }
            let value_type: DataItemValueType = di.value_type.parse()?;
            let units: Units = di.units.as_deref().unwrap_or("").parse()?;
            // Sub data item references are resolved in a later pass;
            // stash the raw triples for now with a placeholder id.
            let mut subs = Vec::new();
            for sub in &di.sub_data_items {
                subs.push(SubDataItem {
                    name: sub.name.clone(),
                    id: sub.id.unwrap_or(u32::MAX),
                    occurs: sub.occurs.parse()?,
                });
            }
            self.data_items.insert(
                di.name.clone(),
                DataItemInfo {
                    name: di.name.clone(),
                    id: di.id,
                    value_type,
                    metric: di.metric.unwrap_or(false),
                    units,
                    module: module.name.clone(),
                    sub_data_items: subs,
                },
            );
        }
        Ok(())
    }

    fn resolve_sub_data_items(&mut self) -> Result<(), ConfigError> {
        let mut fixups: Vec<(String, usize, DataItemId)> = Vec::new();
        for info in self.data_items.values() {
            for (i, sub) in info.sub_data_items.iter().enumerate() {
                let target = self
                    .data_items
                    .get(&sub.name)
                    .ok_or_else(|| ConfigError::BadDataItemName(sub.name.clone()))?;
                if sub.id == u32::MAX {
                    let id = target.id.ok_or_else(|| {
                        ConfigError::BadProtocolConfig(format!(
                            "sub data item {} of {} has no id in either scope",
                            sub.name, info.name
                        ))
                    })?;
                    fixups.push((info.name.clone(), i, id));
                }
            }
        }
        for (parent, index, id) in fixups {
            if let Some(info) = self.data_items.get_mut(&parent) {
                info.sub_data_items[index].id = id;
            }
        }
        Ok(())
    }

    fn add_module_signals(&mut self, module: &xml::XmlModule) -> Result<(), ConfigError> {
        for sig in &module.signals {
            let refs = self.resolve_signal_data_items(&sig.data_items)?;
            let (modem_sends, router_sends) = match sig.sender.as_deref() {
                Some("modem") => (true, false),
                Some("router") => (false, true),
                Some("both") => (true, true),
                None => (false, false),
                Some(other) => {
                    return Err(ConfigError::BadProtocolConfig(format!(
                        "bad sender {:?} for signal {}",
                        other, sig.name
                    )))
                }
            };

            match sig.id {
                Some(id) => {
                    // Full definition.
                    if self.signals.contains_key(&sig.name) {
                        return Err(ConfigError::BadProtocolConfig(format!(
                            "signal {} redefined by module {}",
                            sig.name, module.name
                        )));
                    }
                    let is_message = sig.message.unwrap_or(false);
                    let names = if is_message {
                        &mut self.message_names
                    } else {
                        &mut self.signal_names
                    };
                    if let Some(existing) = names.get(&id) {
                        return Err(ConfigError::BadProtocolConfig(format!(
                            "signal id {} used by both {} and {}",
                            id, existing, sig.name
                        )));
                    }
                    names.insert(id, sig.name.clone());
                    self.signals.insert(
                        sig.name.clone(),
                        SignalInfo {
                            name: sig.name.clone(),
                            id,
                            is_message,
                            modem_sends,
                            router_sends,
                            response: sig.response.clone(),
                            data_items: refs,
                            module: module.name.clone(),
                        },
                    );
                }
                None => {
                    // Extension reference: augment an existing signal.
                    let info = self
                        .signals
                        .get_mut(&sig.name)
                        .ok_or_else(|| ConfigError::BadSignalName(sig.name.clone()))?;
                    info.modem_sends |= modem_sends;
                    info.router_sends |= router_sends;
                    for r in refs {
                        if info.data_items.iter().any(|d| d.name == r.name) {
                            return Err(ConfigError::BadProtocolConfig(format!(
                                "module {} re-adds data item {} to signal {}",
                                module.name, r.name, sig.name
                            )));
                        }
                        info.data_items.push(r);
                    }
                    if let Some(resp) = &sig.response {
                        info.response = Some(resp.clone());
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_signal_data_items(
        &self,
        refs: &[xml::XmlDataItemRef],
    ) -> Result<Vec<SubDataItem>, ConfigError> {
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            let target = self
                .data_items
                .get(&r.name)
                .ok_or_else(|| ConfigError::BadDataItemName(r.name.clone()))?;
            let id = match r.id.or(target.id) {
                Some(id) => id,
                None => {
                    return Err(ConfigError::BadProtocolConfig(format!(
                        "data item {} referenced without an id",
                        r.name
                    )))
                }
            };
            out.push(SubDataItem {
                name: r.name.clone(),
                id,
                occurs: r.occurs.parse()?,
            });
        }
        Ok(out)
    }

    fn add_module_status_codes(&mut self, module: &xml::XmlModule) -> Result<(), ConfigError> {
        for sc in &module.status_codes {
            if self.status_codes.contains_key(&sc.name) {
                return Err(ConfigError::BadProtocolConfig(format!(
                    "status code {} redefined by module {}",
                    sc.name, module.name
                )));
            }
            if let Some(existing) = self.status_names.get(&sc.id) {
                return Err(ConfigError::BadProtocolConfig(format!(
                    "status code id {} used by both {} and {}",
                    sc.id, existing, sc.name
                )));
            }
            let failure_mode = match sc.failure_mode.as_deref() {
                None | Some("continue") => FailureMode::Continue,
                Some("terminate") => FailureMode::Terminate,
                Some(other) => {
                    return Err(ConfigError::BadProtocolConfig(format!(
                        "bad failure mode {:?} for status code {}",
                        other, sc.name
                    )))
                }
            };
            self.status_names.insert(sc.id, sc.name.clone());
            self.status_codes.insert(
                sc.name.clone(),
                StatusCodeInfo {
                    name: sc.name.clone(),
                    id: sc.id,
                    failure_mode,
                    module: module.name.clone(),
                },
            );
        }
        Ok(())
    }

    fn check_responses(&self) -> Result<(), ConfigError> {
        for info in self.signals.values() {
            if let Some(resp) = &info.response {
                if !self.signals.contains_key(resp) {
                    return Err(ConfigError::BadProtocolConfig(format!(
                        "signal {} declares unknown response {}",
                        info.name, resp
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reject catalogs in which the status soft-remap chain can loop
    /// forever (neither Invalid_Data, Invalid_Message, nor Unknown_Message
    /// configured). The runtime remap is then total.
    fn check_status_remap(&self) -> Result<(), ConfigError> {
        let seeds = [
            strings::SUCCESS,
            strings::UNKNOWN_MESSAGE,
            strings::INVALID_MESSAGE,
            strings::UNEXPECTED_MESSAGE,
            strings::REQUEST_DENIED,
            strings::TIMED_OUT,
            strings::INVALID_DATA,
            strings::INVALID_DESTINATION,
            strings::NOT_INTERESTED,
            strings::INCONSISTENT_DATA,
        ];
        for seed in seeds {
            let mut name = seed;
            let mut visited = HashSet::new();
            loop {
                if self.status_codes.contains_key(name) {
                    break;
                }
                if !visited.insert(name) {
                    return Err(ConfigError::StatusRemap);
                }
                name = remap_status_name(name);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query API

    pub fn version(&self) -> [u16; 2] {
        self.version
    }

    pub fn signal_prefix(&self) -> &str {
        &self.signal_prefix
    }

    pub fn signal_id_size(&self) -> usize {
        self.sizes.signal_id
    }

    pub fn signal_length_size(&self) -> usize {
        self.sizes.signal_length
    }

    pub fn data_item_id_size(&self) -> usize {
        self.sizes.data_item_id
    }

    pub fn data_item_length_size(&self) -> usize {
        self.sizes.data_item_length
    }

    pub fn extension_id_size(&self) -> usize {
        self.sizes.extension_id
    }

    pub fn status_code_size(&self) -> usize {
        self.sizes.status_code
    }

    /// Resolve a data item name to its id, preferring the parent's
    /// sub-data-item scope when one is given.
    pub fn get_data_item_id(
        &self,
        name: &str,
        parent: Option<&DataItemInfo>,
    ) -> Result<DataItemId, ConfigError> {
        if let Some(parent) = parent {
            if let Some(sub) = parent.sub_data_items.iter().find(|s| s.name == name) {
                return Ok(sub.id);
            }
        }
        self.data_items
            .get(name)
            .and_then(|info| info.id)
            .ok_or_else(|| ConfigError::BadDataItemName(name.to_string()))
    }

    /// Resolve a data item id to its name within the given scope.
    pub fn get_data_item_name<'a>(
        &'a self,
        id: DataItemId,
        parent: Option<&'a DataItemInfo>,
    ) -> Result<&'a str, ConfigError> {
        if let Some(parent) = parent {
            if let Some(sub) = parent.sub_data_items.iter().find(|s| s.id == id) {
                return Ok(&sub.name);
            }
            return Err(ConfigError::BadDataItemId(id));
        }
        self.data_item_names
            .get(&id)
            .map(|s| s.as_str())
            .ok_or(ConfigError::BadDataItemId(id))
    }

    pub fn get_data_item_value_type(&self, name: &str) -> Result<DataItemValueType, ConfigError> {
        self.data_items
            .get(name)
            .map(|info| info.value_type)
            .ok_or_else(|| ConfigError::BadDataItemName(name.to_string()))
    }

    pub fn get_data_item_info(&self, name: &str) -> Result<&DataItemInfo, ConfigError> {
        self.data_items
            .get(name)
            .ok_or_else(|| ConfigError::BadDataItemName(name.to_string()))
    }

    pub fn get_data_item_info_by_id(
        &self,
        id: DataItemId,
        parent: Option<&DataItemInfo>,
    ) -> Result<&DataItemInfo, ConfigError> {
        let name = self.get_data_item_name(id, parent)?;
        self.get_data_item_info(name)
    }

    pub fn all_data_item_info(&self) -> Vec<&DataItemInfo> {
        let mut all: Vec<_> = self.data_items.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn get_data_item_info_list(
        &self,
        names: &[&str],
    ) -> Result<Vec<&DataItemInfo>, ConfigError> {
        names.iter().map(|n| self.get_data_item_info(n)).collect()
    }

    pub fn is_metric(
        &self,
        id: DataItemId,
        parent: Option<&DataItemInfo>,
    ) -> Result<bool, ConfigError> {
        Ok(self.get_data_item_info_by_id(id, parent)?.metric)
    }

    pub fn is_ipaddr(
        &self,
        id: DataItemId,
        parent: Option<&DataItemInfo>,
    ) -> Result<bool, ConfigError> {
        Ok(self
            .get_data_item_info_by_id(id, parent)?
            .value_type
            .holds_ip())
    }

    /// Resolve a signal/message name to its id. The second element is
    /// true when the name denotes a signal (UDP, prefixed).
    pub fn get_signal_id(&self, name: &str) -> Result<(SignalId, bool), ConfigError> {
        self.signals
            .get(name)
            .map(|info| (info.id, !info.is_message))
            .ok_or_else(|| ConfigError::BadSignalName(name.to_string()))
    }

    pub fn get_signal_name(&self, id: SignalId) -> Result<&str, ConfigError> {
        self.signal_names
            .get(&id)
            .map(|s| s.as_str())
            .ok_or(ConfigError::BadSignalId(id))
    }

    pub fn get_message_name(&self, id: SignalId) -> Result<&str, ConfigError> {
        self.message_names
            .get(&id)
            .map(|s| s.as_str())
            .ok_or(ConfigError::BadSignalId(id))
    }

    /// Name of the response message for `name`, or `None` when the
    /// signal does not expect one.
    pub fn get_message_response_name(&self, name: &str) -> Result<Option<&str>, ConfigError> {
        Ok(self.get_signal_info(name)?.response.as_deref())
    }

    pub fn get_signal_info(&self, name: &str) -> Result<&SignalInfo, ConfigError> {
        self.signals
            .get(name)
            .ok_or_else(|| ConfigError::BadSignalName(name.to_string()))
    }

    pub fn all_signal_info(&self) -> Vec<&SignalInfo> {
        let mut all: Vec<_> = self.signals.values().collect();
        all.sort_by_key(|info| (info.is_message, info.id));
        all
    }

    pub fn get_signal_info_list(&self, names: &[&str]) -> Result<Vec<&SignalInfo>, ConfigError> {
        names.iter().map(|n| self.get_signal_info(n)).collect()
    }

    pub fn get_status_code_id(&self, name: &str) -> Result<StatusCodeId, ConfigError> {
        self.status_codes
            .get(name)
            .map(|info| info.id)
            .ok_or_else(|| ConfigError::BadStatusCodeName(name.to_string()))
    }

    pub fn get_status_code_name(&self, id: StatusCodeId) -> Result<&str, ConfigError> {
        self.status_names
            .get(&id)
            .map(|s| s.as_str())
            .ok_or(ConfigError::BadStatusCodeId(id))
    }

    pub fn get_status_code_info(&self, name: &str) -> Result<&StatusCodeInfo, ConfigError> {
        self.status_codes
            .get(name)
            .ok_or_else(|| ConfigError::BadStatusCodeName(name.to_string()))
    }

    pub fn all_status_code_info(&self) -> Vec<&StatusCodeInfo> {
        let mut all: Vec<_> = self.status_codes.values().collect();
        all.sort_by_key(|info| info.id);
        all
    }

    pub fn get_status_code_info_list(
        &self,
        names: &[&str],
    ) -> Result<Vec<&StatusCodeInfo>, ConfigError> {
        names.iter().map(|n| self.get_status_code_info(n)).collect()
    }

    pub fn get_module_info(&self, name: &str) -> Result<&ModuleInfo, ConfigError> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ConfigError::BadModuleName(name.to_string()))
    }

    pub fn all_module_info(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// All extension ids defined across modules, sorted.
    pub fn extension_ids(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self
            .modules
            .iter()
            .filter_map(|m| m.extension_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// All experiment names defined across modules.
    pub fn experiment_names(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| !m.experiment_name.is_empty())
            .map(|m| m.experiment_name.clone())
            .collect()
    }

    /// Map a status name onto one present in this configuration, walking
    /// the remap chain. Different drafts define different status codes;
    /// this hides the difference from callers. Termination was proven at
    /// load time.
    pub fn resolve_status_name(&self, name: &str) -> String {
        let mut current = name.to_string();
        while !self.status_codes.contains_key(&current) {
            current = remap_status_name(&current).to_string();
        }
        current
    }
}

/// One step of the status soft-remap chain.
fn remap_status_name(name: &str) -> &'static str {
    match name {
        strings::INVALID_MESSAGE => strings::INVALID_DATA,
        strings::INVALID_DESTINATION | strings::INCONSISTENT_DATA => strings::INVALID_MESSAGE,
        strings::INVALID_DATA => strings::INVALID_MESSAGE,
        strings::NOT_INTERESTED => strings::REQUEST_DENIED,
        _ => strings::UNKNOWN_MESSAGE,
    }
}
