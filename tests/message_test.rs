//! Frame assembly, stream reassembly, and whole-message validation.

use dlep::{
    ConfigValue, DataItem, DataItemValue, MacAddress, ProtocolMessage, ProtocolConfig,
    TableClient,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn catalog() -> Arc<ProtocolConfig> {
    Arc::new(
        ProtocolConfig::load(Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/dlep-rfc8175.xml"
        )))
        .expect("shipped catalog loads"),
    )
}

fn client(entries: &[(&str, ConfigValue)]) -> TableClient {
    let mut params = HashMap::new();
    for (name, value) in entries {
        params.insert(name.to_string(), value.clone());
    }
    TableClient::new(params)
}

#[test]
fn header_and_length_rewrite() {
    let cfg = catalog();
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Heartbeat").unwrap();
    // Messages have no prefix: id (2) + length (2).
    assert_eq!(pm.len(), 4);
    assert_eq!(pm.buffer(), &[0, 16, 0, 0]);

    // Signals carry the configured prefix.
    let offer = ProtocolMessage::with_header(cfg.clone(), "Peer_Offer").unwrap();
    assert!(offer.buffer().starts_with(b"DLEP"));

    // Adding a data item rewrites the length field.
    pm.add_mac(&MacAddress::from([1, 2, 3, 4, 5, 6])).unwrap();
    let expected_payload = 4 + 6; // data item header + MAC bytes
    assert_eq!(pm.buffer()[2..4], [0, expected_payload as u8]);
    assert_eq!(pm.len(), 4 + expected_payload);
}

#[test]
fn stream_reassembly() {
    let cfg = catalog();
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Destination_Down").unwrap();
    pm.add_mac(&MacAddress::from([1, 2, 3, 4, 5, 6])).unwrap();
    let bytes = pm.buffer().to_vec();

    // Not even a header yet.
    assert_eq!(ProtocolMessage::is_complete_message(&cfg, &bytes[..3]), None);
    // Full header: expected size known even if the payload is missing.
    assert_eq!(
        ProtocolMessage::is_complete_message(&cfg, &bytes[..4]),
        Some(bytes.len())
    );
    assert_eq!(
        ProtocolMessage::is_complete_message(&cfg, &bytes),
        Some(bytes.len())
    );

    // Parse back and check retrieval.
    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed.parse(&bytes, false).unwrap();
    assert_eq!(parsed.signal_name(), "Destination_Down");
    assert_eq!(
        parsed.get_mac().unwrap(),
        MacAddress::from([1, 2, 3, 4, 5, 6])
    );
}

#[test]
fn signal_prefix_checked() {
    let cfg = catalog();
    let offer = ProtocolMessage::with_header(cfg.clone(), "Peer_Offer").unwrap();
    let mut bytes = offer.buffer().to_vec();

    let mut ok = ProtocolMessage::new(cfg.clone());
    assert!(ok.parse(&bytes, true).is_ok());

    bytes[0] = b'X';
    let mut bad = ProtocolMessage::new(cfg.clone());
    assert!(bad.parse(&bytes, true).is_err());
}

#[test]
fn sender_side_validation() {
    let cfg = catalog();
    let client = client(&[("heartbeat-interval", ConfigValue::UInt(5))]);

    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Session_Initialization").unwrap();
    pm.add_heartbeat_interval(&client).unwrap();
    let bytes = pm.buffer().to_vec();

    // Only the router sends Session Initialization.
    let mut as_router = ProtocolMessage::new(cfg.clone());
    assert!(as_router.parse_and_validate(&bytes, false, false).is_ok());
    let mut as_modem = ProtocolMessage::new(cfg.clone());
    assert!(as_modem.parse_and_validate(&bytes, false, true).is_err());
}

#[test]
fn occurrence_validation_on_parse() {
    let cfg = catalog();
    // Destination Down needs a MAC Address; an empty one must fail.
    let pm = ProtocolMessage::with_header(cfg.clone(), "Destination_Down").unwrap();
    let mut parsed = ProtocolMessage::new(cfg.clone());
    let err = parsed
        .parse_and_validate(pm.buffer(), false, true)
        .unwrap_err();
    assert!(err.contains("MAC_Address"), "unexpected error: {}", err);
}

#[test]
fn heartbeat_interval_unit_conversion() {
    let cfg = catalog();
    // The catalog declares Heartbeat_Interval in milliseconds as u32.
    let client = client(&[("heartbeat-interval", ConfigValue::UInt(60))]);
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Session_Initialization").unwrap();
    pm.add_heartbeat_interval(&client).unwrap();
    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed.parse(pm.buffer(), false).unwrap();
    assert_eq!(parsed.get_heartbeat_interval().unwrap(), 60_000);
}

#[test]
fn peer_type_polymorphism() {
    let cfg = catalog();

    // With a flags byte (u8_string catalog): peer-flags fills field one.
    let client_with_flags = client(&[
        ("peer-type", ConfigValue::Str("radio".into())),
        ("peer-flags", ConfigValue::UInt(1)),
    ]);
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Peer_Offer").unwrap();
    pm.add_peer_type(&client_with_flags).unwrap();
    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed.parse(pm.buffer(), true).unwrap();
    assert_eq!(parsed.get_peer_type().unwrap(), "radio");

    // Absent peer-type parameter: the item is optional on this signal
    // and simply omitted.
    let no_type = client(&[]);
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Peer_Offer").unwrap();
    pm.add_peer_type(&no_type).unwrap();
    assert!(!pm.data_item_exists("Peer_Type"));
}

#[test]
fn status_soft_remap_on_send() {
    let cfg = catalog();
    // Invalid_Message is not in the RFC catalog; add_status remaps it
    // to Invalid_Data transparently.
    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Session_Termination").unwrap();
    pm.add_status("Invalid_Message", "test").unwrap();
    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed.parse(pm.buffer(), false).unwrap();
    assert_eq!(parsed.get_status().unwrap().as_deref(), Some("Invalid_Data"));
}

#[test]
fn common_data_items_and_getters() {
    let cfg = catalog();
    let client = client(&[
        ("heartbeat-interval", ConfigValue::UInt(5)),
        ("peer-type", ConfigValue::Str("sat".into())),
    ]);

    let mut pm = ProtocolMessage::with_header(cfg.clone(), "Session_Initialization").unwrap();
    pm.add_common_data_items(&client).unwrap();
    pm.add_heartbeat_interval(&client).unwrap();
    pm.add_extensions(&[2, 7]).unwrap();

    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed
        .parse_and_validate(pm.buffer(), false, false)
        .unwrap();
    assert_eq!(parsed.get_version().unwrap(), [1, 7]);
    assert_eq!(parsed.get_peer_type().unwrap(), "sat");
    assert_eq!(parsed.get_extensions().unwrap(), vec![2, 7]);
    assert!(parsed.get_experiment_names().unwrap().is_empty());

    // Metrics and IP addresses filter.
    let mut up = ProtocolMessage::with_header(cfg.clone(), "Destination_Up").unwrap();
    up.add_mac(&MacAddress::from([0, 1, 2, 3, 4, 5])).unwrap();
    up.add_data_item(
        DataItem::new("Latency", DataItemValue::U64(10), &cfg, None).unwrap(),
    )
    .unwrap();
    let mut parsed = ProtocolMessage::new(cfg.clone());
    parsed.parse(up.buffer(), false).unwrap();
    assert_eq!(parsed.metrics_and_ipaddrs().unwrap().len(), 1);
    assert_eq!(parsed.data_items_no_mac().unwrap().len(), 1);
    assert_eq!(parsed.data_items().len(), 2);
}
