//! Dynamic Link Exchange Protocol core.
//!
//! A configuration-driven implementation of the DLEP control plane: a
//! radio modem advertises link-layer characteristics to its attached
//! router over a negotiated TCP session, with UDP multicast discovery
//! and an optional modem-to-modem destination-advertisement
//! subprotocol. The wire grammar (signals, messages, data items, status
//! codes, field widths) comes entirely from an XML catalog, so one
//! build interoperates with multiple protocol drafts.

pub mod client;
pub mod codec;
pub mod dataitem;
pub mod destadvert;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod infobase;
pub mod message;
pub mod netutils;
pub mod peer;
pub mod protocfg;
pub mod service;
pub mod types;

pub use client::{ClientError, ClientParams, ConfigValue, DlepClient, TableClient};
pub use dataitem::{DataItem, DataItemValue, DataItemValueType, IpFlags};
pub use engine::{Engine, EngineError, Params};
pub use error::{ConfigError, WireError};
pub use message::{MessageError, ProtocolMessage, MAX_SIGNAL_SIZE};
pub use peer::{PeerInfo, PeerState};
pub use protocfg::{
    DataItemInfo, FailureMode, ModuleInfo, Occurs, ProtocolConfig, SignalInfo, StatusCodeInfo,
    SubDataItem, Units,
};
pub use service::ReturnStatus;
pub use types::{strings, DataItemId, ExtensionId, MacAddress, SignalId, StatusCodeId};
