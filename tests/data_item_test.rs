//! Data item round-trips and validation laws, driven by the shipped
//! protocol catalog.

use dlep::codec::Decoder;
use dlep::{DataItem, DataItemValue, MacAddress, ProtocolConfig};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

fn catalog() -> ProtocolConfig {
    ProtocolConfig::load(Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/config/dlep-rfc8175.xml"
    )))
    .expect("shipped catalog loads")
}

/// A catalog with one parent data item carrying sub data items, one of
/// them with a scope-local id.
const SUB_ITEM_XML: &str = r#"<?xml version="1.0"?>
<dlep>
    <field_sizes>
        <signal_length>2</signal_length>
        <signal_id>2</signal_id>
        <data_item_length>2</data_item_length>
        <data_item_id>2</data_item_id>
        <extension_id>2</extension_id>
        <status_code>1</status_code>
    </field_sizes>
    <module>
        <name>test</name>
        <status_code><name>Unknown_Message</name><id>128</id></status_code>
        <status_code><name>Invalid_Message</name><id>129</id></status_code>
        <data_item>
            <name>Hop_Count</name>
            <id>30</id>
            <type>u8</type>
        </data_item>
        <data_item>
            <name>Hop_Control</name>
            <type>u16</type>
        </data_item>
        <data_item>
            <name>Multi_Hop</name>
            <id>31</id>
            <type>sub_data_items</type>
            <sub_data_item>
                <name>Hop_Count</name>
                <occurs>1</occurs>
            </sub_data_item>
            <sub_data_item>
                <name>Hop_Control</name>
                <id>2</id>
                <occurs>0-1</occurs>
            </sub_data_item>
        </data_item>
    </module>
</dlep>"#;

fn round_trip(cfg: &ProtocolConfig, name: &str, value: DataItemValue) {
    let di = DataItem::new(name, value, cfg, None).expect("known data item");
    assert_eq!(di.validate(cfg, None), Ok(()), "{} should validate", name);

    let bytes = di.serialize(cfg).expect("serializes");
    let header = cfg.data_item_id_size() + cfg.data_item_length_size();
    assert!(bytes.len() >= header);

    let mut dec = Decoder::new(&bytes);
    let parsed = DataItem::deserialize(&mut dec, cfg, None).expect("parses back");
    assert!(dec.is_exhausted());
    assert_eq!(parsed, di, "wire round trip for {}", name);

    let text = di.to_text(cfg, None).expect("textualizes");
    let reparsed = DataItem::from_text(&text, cfg, None).expect("text parses back");
    assert_eq!(reparsed, di, "text round trip for {}: {:?}", name, text);
}

#[test]
fn wire_and_text_round_trips() {
    let cfg = catalog();
    round_trip(&cfg, "Status", DataItemValue::U8Str(0, "ok".into()));
    round_trip(
        &cfg,
        "IPv4_Connection_Point",
        DataItemValue::U8Ipv4U16(0, Ipv4Addr::new(10, 0, 0, 1), 12345),
    );
    round_trip(
        &cfg,
        "IPv6_Connection_Point",
        DataItemValue::U8Ipv6U16(0, Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 854),
    );
    round_trip(&cfg, "Peer_Type", DataItemValue::U8Str(1, "radio".into()));
    round_trip(&cfg, "Heartbeat_Interval", DataItemValue::U32(60_000));
    round_trip(&cfg, "Extensions_Supported", DataItemValue::VExtId(vec![1, 2]));
    round_trip(
        &cfg,
        "MAC_Address",
        DataItemValue::Mac("01:02:03:04:05:06".parse().unwrap()),
    );
    round_trip(
        &cfg,
        "IPv4_Address",
        DataItemValue::U8Ipv4(1, Ipv4Addr::new(192, 0, 2, 1)),
    );
    round_trip(
        &cfg,
        "IPv6_Address",
        DataItemValue::U8Ipv6(1, Ipv6Addr::LOCALHOST),
    );
    round_trip(
        &cfg,
        "IPv4_Attached_Subnet",
        DataItemValue::U8Ipv4U8(1, Ipv4Addr::new(10, 1, 0, 0), 16),
    );
    round_trip(
        &cfg,
        "IPv6_Attached_Subnet",
        DataItemValue::U8Ipv6U8(0, Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 64),
    );
    round_trip(&cfg, "Maximum_Data_Rate_Receive", DataItemValue::U64(100_000_000));
    round_trip(&cfg, "Latency", DataItemValue::U64(250));
    round_trip(&cfg, "Resources", DataItemValue::U8(100));
    round_trip(&cfg, "Maximum_Transmission_Unit", DataItemValue::U16(1500));
    round_trip(&cfg, "Version", DataItemValue::A2U16([1, 7]));
    round_trip(&cfg, "Port", DataItemValue::U16(854));
    round_trip(
        &cfg,
        "Experimental_Definition",
        DataItemValue::Str("experiment-1".into()),
    );
}

#[test]
fn serialized_length_counts_payload_only() {
    let cfg = catalog();
    // u64 metric: 2 id + 2 length + 8 payload.
    let di = DataItem::new("Latency", DataItemValue::U64(7), &cfg, None).unwrap();
    assert_eq!(di.serialize(&cfg).unwrap().len(), 12);

    // mac: 2 + 2 + 6
    let mac = DataItem::new(
        "MAC_Address",
        DataItemValue::Mac(MacAddress::from([1, 2, 3, 4, 5, 6])),
        &cfg,
        None,
    )
    .unwrap();
    assert_eq!(mac.serialize(&cfg).unwrap().len(), 10);
}

#[test]
fn connection_point_port_omitted_when_zero() {
    let cfg = catalog();
    let with_port = DataItem::new(
        "IPv4_Connection_Point",
        DataItemValue::U8Ipv4U16(0, Ipv4Addr::new(10, 0, 0, 1), 854),
        &cfg,
        None,
    )
    .unwrap();
    let without_port = DataItem::new(
        "IPv4_Connection_Point",
        DataItemValue::U8Ipv4U16(0, Ipv4Addr::new(10, 0, 0, 1), 0),
        &cfg,
        None,
    )
    .unwrap();

    // flag + 4 address bytes, then the optional 2-byte port.
    let header = 4;
    assert_eq!(with_port.serialize(&cfg).unwrap().len(), header + 5 + 2);
    assert_eq!(without_port.serialize(&cfg).unwrap().len(), header + 5);

    // Port presence is inferred from the remaining length on parse.
    let bytes = without_port.serialize(&cfg).unwrap();
    let mut dec = Decoder::new(&bytes);
    let parsed = DataItem::deserialize(&mut dec, &cfg, None).unwrap();
    assert_eq!(parsed, without_port);
}

#[test]
fn truncated_and_oversized_payloads_fail() {
    let cfg = catalog();
    let di = DataItem::new("Heartbeat_Interval", DataItemValue::U32(5000), &cfg, None).unwrap();
    let bytes = di.serialize(&cfg).unwrap();

    // Chop off payload bytes: header promises more than is present.
    let mut dec = Decoder::new(&bytes[..bytes.len() - 1]);
    assert!(DataItem::deserialize(&mut dec, &cfg, None).is_err());

    // Declare a longer length than the u32 shape consumes.
    let mut padded = bytes.clone();
    padded[3] = 5; // length 4 -> 5
    padded.push(0);
    let mut dec = Decoder::new(&padded);
    assert!(DataItem::deserialize(&mut dec, &cfg, None).is_err());
}

#[test]
fn validation_laws() {
    let cfg = catalog();

    // Wrong shape for the configured type.
    let wrong = DataItem::new("Latency", DataItemValue::U8(1), &cfg, None).unwrap();
    assert!(wrong.validate(&cfg, None).is_err());

    // Percentage bound.
    let ok = DataItem::new("Resources", DataItemValue::U8(100), &cfg, None).unwrap();
    assert_eq!(ok.validate(&cfg, None), Ok(()));
    let over = DataItem::new("Resources", DataItemValue::U8(101), &cfg, None).unwrap();
    assert!(over.validate(&cfg, None).is_err());

    // Prefix bounds: 32 for IPv4, 128 for IPv6.
    let v4 = DataItem::new(
        "IPv4_Attached_Subnet",
        DataItemValue::U8Ipv4U8(1, Ipv4Addr::new(10, 0, 0, 0), 33),
        &cfg,
        None,
    )
    .unwrap();
    assert!(v4.validate(&cfg, None).is_err());
    let v6 = DataItem::new(
        "IPv6_Attached_Subnet",
        DataItemValue::U8Ipv6U8(1, Ipv6Addr::LOCALHOST, 129),
        &cfg,
        None,
    )
    .unwrap();
    assert!(v6.validate(&cfg, None).is_err());
    let v6_ok = DataItem::new(
        "IPv6_Attached_Subnet",
        DataItemValue::U8Ipv6U8(1, Ipv6Addr::LOCALHOST, 128),
        &cfg,
        None,
    )
    .unwrap();
    assert_eq!(v6_ok.validate(&cfg, None), Ok(()));

    // Add/drop flag must be 0 or 1.
    let flag = DataItem::new(
        "IPv4_Address",
        DataItemValue::U8Ipv4(2, Ipv4Addr::new(10, 0, 0, 1)),
        &cfg,
        None,
    )
    .unwrap();
    assert!(flag.validate(&cfg, None).is_err());

    // Status code ids must be configured.
    let bad_status = DataItem::new("Status", DataItemValue::U8Str(77, "".into()), &cfg, None).unwrap();
    assert!(bad_status.validate(&cfg, None).is_err());
    let good_status = DataItem::new("Status", DataItemValue::U8Str(0, "".into()), &cfg, None).unwrap();
    assert_eq!(good_status.validate(&cfg, None), Ok(()));
}

#[test]
fn occurrence_constraints() {
    let cfg = catalog();
    let allowed = cfg
        .get_signal_info("Session_Termination")
        .unwrap()
        .data_items
        .clone();
    let status = DataItem::new("Status", DataItemValue::U8Str(0, "".into()), &cfg, None).unwrap();

    // Exactly-one: zero and two both fail.
    assert!(DataItem::validate_occurrences(&[], &allowed, &cfg, None).is_err());
    assert_eq!(
        DataItem::validate_occurrences(&[status.clone()], &allowed, &cfg, None),
        Ok(())
    );
    assert!(
        DataItem::validate_occurrences(&[status.clone(), status.clone()], &allowed, &cfg, None)
            .is_err()
    );

    // Unknown data items are rejected.
    let mac = DataItem::new(
        "MAC_Address",
        DataItemValue::Mac(MacAddress::from([0, 0, 0, 0, 0, 1])),
        &cfg,
        None,
    )
    .unwrap();
    assert!(DataItem::validate_occurrences(&[status, mac], &allowed, &cfg, None).is_err());
}

#[test]
fn sub_data_items_nest_and_scope_ids() {
    let cfg = ProtocolConfig::parse_str(SUB_ITEM_XML).unwrap();
    let parent_info = cfg.get_data_item_info("Multi_Hop").unwrap().clone();

    // Hop_Count keeps its top-level id inside the parent; Hop_Control
    // only exists inside the parent, under the scope-local id 2.
    assert_eq!(cfg.get_data_item_id("Hop_Count", Some(&parent_info)).unwrap(), 30);
    assert_eq!(cfg.get_data_item_id("Hop_Control", Some(&parent_info)).unwrap(), 2);
    assert!(cfg.get_data_item_id("Hop_Control", None).is_err());

    let hop_count = DataItem::new("Hop_Count", DataItemValue::U8(3), &cfg, Some(&parent_info)).unwrap();
    let hop_control =
        DataItem::new("Hop_Control", DataItemValue::U16(1), &cfg, Some(&parent_info)).unwrap();
    let parent = DataItem::new(
        "Multi_Hop",
        DataItemValue::SubDataItems(vec![hop_count.clone(), hop_control]),
        &cfg,
        None,
    )
    .unwrap();
    assert_eq!(parent.validate(&cfg, None), Ok(()));

    let bytes = parent.serialize(&cfg).unwrap();
    let mut dec = Decoder::new(&bytes);
    let parsed = DataItem::deserialize(&mut dec, &cfg, None).unwrap();
    assert_eq!(parsed, parent);

    let text = parent.to_text(&cfg, None).unwrap();
    let reparsed = DataItem::from_text(&text, &cfg, None).unwrap();
    assert_eq!(reparsed, parent);

    // Occurrence constraint inside the parent: Hop_Count is mandatory.
    let missing = DataItem::new(
        "Multi_Hop",
        DataItemValue::SubDataItems(vec![]),
        &cfg,
        None,
    )
    .unwrap();
    assert!(missing.validate(&cfg, None).is_err());
}

#[test]
fn string_with_spaces_does_not_round_trip_text() {
    let cfg = catalog();
    let di = DataItem::new(
        "Experimental_Definition",
        DataItemValue::Str("two words".into()),
        &cfg,
        None,
    )
    .unwrap();
    // Wire form is fine.
    let bytes = di.serialize(&cfg).unwrap();
    let mut dec = Decoder::new(&bytes);
    assert_eq!(DataItem::deserialize(&mut dec, &cfg, None).unwrap(), di);

    // Text form tokenizes on whitespace, so the value truncates.
    let text = di.to_text(&cfg, None).unwrap();
    let reparsed = DataItem::from_text(&text, &cfg, None).unwrap();
    assert_eq!(reparsed.value, DataItemValue::Str("two".into()));
}
