//! Raw XML form of the protocol catalog.
//!
//! These structs mirror the on-disk schema one-to-one and are only a
//! staging area: [`super::ProtocolConfig::load`] cross-checks them and
//! resolves names into the immutable query tables. `<xi:include>` elements
//! are spliced in textually before deserialization so a draft catalog can
//! compose a base module with extension modules.

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct XmlCatalog {
    pub version: Option<XmlVersion>,
    pub signal_prefix: Option<String>,
    pub field_sizes: XmlFieldSizes,
    #[serde(rename = "module", default)]
    pub modules: Vec<XmlModule>,
}

#[derive(Debug, Deserialize)]
pub struct XmlVersion {
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Deserialize)]
pub struct XmlFieldSizes {
    pub signal_length: usize,
    pub signal_id: usize,
    pub data_item_length: usize,
    pub data_item_id: usize,
    pub extension_id: usize,
    pub status_code: usize,
}

#[derive(Debug, Deserialize)]
pub struct XmlModule {
    pub name: String,
    pub draft: Option<String>,
    pub experiment_name: Option<String>,
    pub extension_id: Option<u32>,
    #[serde(rename = "signal", default)]
    pub signals: Vec<XmlSignal>,
    #[serde(rename = "data_item", default)]
    pub data_items: Vec<XmlDataItem>,
    #[serde(rename = "status_code", default)]
    pub status_codes: Vec<XmlStatusCode>,
}

/// A signal definition, or (when `id` is absent) a reference to a signal
/// defined by an earlier module, adding data items or sender flags.
#[derive(Debug, Deserialize)]
pub struct XmlSignal {
    pub name: String,
    pub id: Option<u32>,
    pub message: Option<bool>,
    /// "modem", "router", or "both"
    pub sender: Option<String>,
    pub response: Option<String>,
    #[serde(rename = "data_item", default)]
    pub data_items: Vec<XmlDataItemRef>,
}

/// Reference to a data item from a signal or parent data item, with the
/// occurrence constraint and an optional scope-local id.
#[derive(Debug, Deserialize)]
pub struct XmlDataItemRef {
    pub name: String,
    pub id: Option<u32>,
    pub occurs: String,
}

#[derive(Debug, Deserialize)]
pub struct XmlDataItem {
    pub name: String,
    /// Absent for data items that only ever appear as sub data items.
    pub id: Option<u32>,
    #[serde(rename = "type")]
    pub value_type: String,
    pub metric: Option<bool>,
    pub units: Option<String>,
    #[serde(rename = "sub_data_item", default)]
    pub sub_data_items: Vec<XmlDataItemRef>,
}

#[derive(Debug, Deserialize)]
pub struct XmlStatusCode {
    pub name: String,
    pub id: u32,
    /// "continue" or "terminate"; defaults to "continue".
    pub failure_mode: Option<String>,
}

/// Read a catalog file, splice `<xi:include href="..."/>` elements
/// (self-closing form, resolved relative to the including file), and
/// deserialize.
pub fn read_catalog(path: &Path) -> Result<XmlCatalog, ConfigError> {
    let text = read_with_includes(path, 0)?;
    serde_xml_rs::from_str(&text).map_err(|e| ConfigError::Xml(e.to_string()))
}

const MAX_INCLUDE_DEPTH: usize = 8;

fn read_with_includes(path: &Path, depth: usize) -> Result<String, ConfigError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfigError::BadProtocolConfig(format!(
            "XInclude nesting deeper than {} at {}",
            MAX_INCLUDE_DEPTH,
            path.display()
        )));
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    while let Some(start) = rest.find("<xi:include") {
        let after = &rest[start..];
        let end = after.find("/>").ok_or_else(|| {
            ConfigError::BadProtocolConfig(format!(
                "unterminated xi:include in {}",
                path.display()
            ))
        })?;
        let element = &after[..end + 2];
        let href = extract_href(element).ok_or_else(|| {
            ConfigError::BadProtocolConfig(format!(
                "xi:include without href in {}",
                path.display()
            ))
        })?;

        out.push_str(&rest[..start]);
        let included = read_with_includes(&base.join(href), depth + 1)?;
        out.push_str(strip_declaration(&included));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn extract_href(element: &str) -> Option<&str> {
    let idx = element.find("href=\"")?;
    let rest = &element[idx + 6..];
    let close = rest.find('"')?;
    Some(&rest[..close])
}

fn strip_declaration(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(stripped) = trimmed.strip_prefix("<?xml") {
        if let Some(end) = stripped.find("?>") {
            return &stripped[end + 2..];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_declaration_removes_prolog() {
        let s = "<?xml version=\"1.0\"?>\n<module><name>m</name></module>";
        assert_eq!(strip_declaration(s), "\n<module><name>m</name></module>");
        assert_eq!(strip_declaration("<module/>"), "<module/>");
    }

    #[test]
    fn href_extraction() {
        assert_eq!(
            extract_href("<xi:include href=\"core.xml\"/>"),
            Some("core.xml")
        );
        assert_eq!(extract_href("<xi:include/>"), None);
    }
}
