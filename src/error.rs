//! Error taxonomy.
//!
//! Configuration errors are fatal and only occur at startup. Wire errors
//! never propagate past the peer that produced them: the session is
//! terminated with a status code and other peers are unaffected.

use crate::types::{DataItemId, SignalId, StatusCodeId};
use thiserror::Error;

/// Startup-time protocol configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown data item name: {0}")]
    BadDataItemName(String),

    #[error("unknown data item id: {0}")]
    BadDataItemId(DataItemId),

    #[error("unknown signal/message name: {0}")]
    BadSignalName(String),

    #[error("unknown signal/message id: {0}")]
    BadSignalId(SignalId),

    #[error("unknown status code name: {0}")]
    BadStatusCodeName(String),

    #[error("unknown status code id: {0}")]
    BadStatusCodeId(StatusCodeId),

    #[error("unknown module name: {0}")]
    BadModuleName(String),

    #[error("status remap chain cannot terminate: configure at least one of Invalid_Data, Invalid_Message, Unknown_Message")]
    StatusRemap,

    #[error("bad protocol configuration: {0}")]
    BadProtocolConfig(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("XML parse failure: {0}")]
    Xml(String),
}

/// Failures while serializing or parsing wire bytes. An incoming message
/// that produces one of these terminates the peer session.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated: needed {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("data item {id} length {length} extends beyond the end of the message")]
    BadLength { id: DataItemId, length: usize },

    #[error("{0} bytes left over after reading all fields")]
    Residual(usize),

    #[error("value {value} does not fit in {width} bytes")]
    Overflow { value: u64, width: usize },

    #[error("signal prefix mismatch")]
    BadPrefix,

    #[error("{0}")]
    BadField(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
