//! Catalog loading, resolution rules, and failure modes.

use dlep::{ConfigError, DataItemValueType, FailureMode, Occurs, ProtocolConfig};
use std::path::Path;

fn load(name: &str) -> ProtocolConfig {
    ProtocolConfig::load(&Path::new(env!("CARGO_MANIFEST_DIR")).join(name))
        .expect("catalog loads")
}

#[test]
fn core_catalog_resolves() {
    let cfg = load("config/dlep-rfc8175.xml");

    assert_eq!(cfg.version(), [1, 7]);
    assert_eq!(cfg.signal_prefix(), "DLEP");
    assert_eq!(cfg.signal_id_size(), 2);
    assert_eq!(cfg.signal_length_size(), 2);
    assert_eq!(cfg.data_item_id_size(), 2);
    assert_eq!(cfg.data_item_length_size(), 2);
    assert_eq!(cfg.extension_id_size(), 2);
    assert_eq!(cfg.status_code_size(), 1);

    // Signals and messages occupy distinct id spaces.
    let (discovery, is_signal) = cfg.get_signal_id("Peer_Discovery").unwrap();
    assert_eq!((discovery, is_signal), (1, true));
    let (init, is_signal) = cfg.get_signal_id("Session_Initialization").unwrap();
    assert_eq!((init, is_signal), (1, false));
    assert_eq!(cfg.get_signal_name(1).unwrap(), "Peer_Discovery");
    assert_eq!(cfg.get_message_name(1).unwrap(), "Session_Initialization");

    assert_eq!(
        cfg.get_message_response_name("Session_Initialization").unwrap(),
        Some("Session_Initialization_Response")
    );
    assert_eq!(cfg.get_message_response_name("Heartbeat").unwrap(), None);

    // Data item lookups.
    assert_eq!(cfg.get_data_item_id("MAC_Address", None).unwrap(), 7);
    assert_eq!(cfg.get_data_item_name(7, None).unwrap(), "MAC_Address");
    assert_eq!(
        cfg.get_data_item_value_type("Status").unwrap(),
        DataItemValueType::U8Str
    );
    assert!(cfg.is_metric(16, None).unwrap());
    assert!(!cfg.is_metric(7, None).unwrap());
    assert!(cfg.is_ipaddr(8, None).unwrap());
    assert!(!cfg.is_ipaddr(16, None).unwrap());

    // Status codes and failure modes.
    assert_eq!(cfg.get_status_code_id("Success").unwrap(), 0);
    assert_eq!(cfg.get_status_code_name(132).unwrap(), "Timed_Out");
    assert_eq!(
        cfg.get_status_code_info("Success").unwrap().failure_mode,
        FailureMode::Continue
    );
    assert_eq!(
        cfg.get_status_code_info("Timed_Out").unwrap().failure_mode,
        FailureMode::Terminate
    );

    // Sender permissions.
    let init_info = cfg.get_signal_info("Session_Initialization").unwrap();
    assert!(init_info.router_sends && !init_info.modem_sends);
    let offer = cfg.get_signal_info("Peer_Offer").unwrap();
    assert!(offer.modem_sends && !offer.router_sends);

    // Occurs parsing.
    let status_ref = init_info
        .data_items
        .iter()
        .find(|d| d.name == "Heartbeat_Interval")
        .unwrap();
    assert_eq!(status_ref.occurs, Occurs::One);

    // No extensions in the core catalog.
    assert!(cfg.extension_ids().is_empty());
    assert!(cfg.experiment_names().is_empty());

    // Unknown names are typed errors.
    assert!(matches!(
        cfg.get_data_item_id("Bogus", None),
        Err(ConfigError::BadDataItemName(_))
    ));
    assert!(matches!(
        cfg.get_signal_id("Bogus"),
        Err(ConfigError::BadSignalName(_))
    ));
    assert!(matches!(
        cfg.get_status_code_name(200),
        Err(ConfigError::BadStatusCodeId(200))
    ));
}

#[test]
fn extension_module_augments_base_signals() {
    let cfg = load("config/dlep-latency-range.xml");

    assert_eq!(cfg.extension_ids(), vec![1]);
    assert_eq!(cfg.experiment_names(), vec!["latency-range".to_string()]);
    assert_eq!(
        cfg.get_data_item_value_type("Latency_Range").unwrap(),
        DataItemValueType::U64U64
    );

    // The extension reference added its item to existing signals
    // without redefining them.
    let lr_id = cfg.get_data_item_id("Latency_Range", None).unwrap();
    for signal in [
        "Session_Initialization_Response",
        "Destination_Up",
        "Destination_Update",
    ] {
        let info = cfg.get_signal_info(signal).unwrap();
        assert!(
            info.data_items.iter().any(|d| d.id == lr_id),
            "{} should allow Latency_Range",
            signal
        );
    }

    let module = cfg.get_module_info("latency-range").unwrap();
    assert_eq!(module.extension_id, Some(1));
    assert_eq!(module.data_items, vec!["Latency_Range".to_string()]);
}

#[test]
fn duplicate_ids_and_names_are_rejected() {
    let dup_id = r#"<?xml version="1.0"?>
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
        <name>m</name>
        <status_code><name>Unknown_Message</name><id>128</id></status_code>
        <status_code><name>Invalid_Message</name><id>129</id></status_code>
        <data_item><name>A</name><id>1</id><type>u8</type></data_item>
        <data_item><name>B</name><id>1</id><type>u8</type></data_item>
    </module>
</dlep>"#;
    assert!(ProtocolConfig::parse_str(dup_id).is_err());

    let dup_signal = r#"<?xml version="1.0"?>
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
        <name>m</name>
        <status_code><name>Unknown_Message</name><id>128</id></status_code>
        <status_code><name>Invalid_Message</name><id>129</id></status_code>
        <signal><name>S</name><id>1</id><message>true</message><sender>both</sender></signal>
        <signal><name>S</name><id>2</id><message>true</message><sender>both</sender></signal>
    </module>
</dlep>"#;
    assert!(ProtocolConfig::parse_str(dup_signal).is_err());
}

#[test]
fn unknown_references_are_rejected() {
    let bad_ref = r#"<?xml version="1.0"?>
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
        <name>m</name>
        <status_code><name>Unknown_Message</name><id>128</id></status_code>
        <status_code><name>Invalid_Message</name><id>129</id></status_code>
        <signal>
            <name>S</name><id>1</id><message>true</message><sender>both</sender>
            <data_item><name>Missing</name><occurs>1</occurs></data_item>
        </signal>
    </module>
</dlep>"#;
    assert!(matches!(
        ProtocolConfig::parse_str(bad_ref),
        Err(ConfigError::BadDataItemName(_))
    ));

    let bad_value_type = r#"<?xml version="1.0"?>
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
        <name>m</name>
        <status_code><name>Unknown_Message</name><id>128</id></status_code>
        <status_code><name>Invalid_Message</name><id>129</id></status_code>
        <data_item><name>A</name><id>1</id><type>u128</type></data_item>
    </module>
</dlep>"#;
    assert!(ProtocolConfig::parse_str(bad_value_type).is_err());
}

#[test]
fn status_remap_chain_must_terminate() {
    // No Unknown_Message, Invalid_Message, or Invalid_Data: the remap
    // chain cannot land anywhere.
    let no_anchor = r#"<?xml version="1.0"?>
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
        <name>m</name>
        <status_code><name>Success</name><id>0</id></status_code>
    </module>
</dlep>"#;
    assert!(matches!(
        ProtocolConfig::parse_str(no_anchor),
        Err(ConfigError::StatusRemap)
    ));
}

#[test]
fn status_soft_remap_resolution() {
    let cfg = load("config/dlep-rfc8175.xml");
    // Invalid_Message is not an RFC status; it lands on Invalid_Data.
    assert_eq!(cfg.resolve_status_name("Invalid_Message"), "Invalid_Data");
    // Configured names resolve to themselves.
    assert_eq!(cfg.resolve_status_name("Not_Interested"), "Not_Interested");
    // Anything unknown lands on Unknown_Message.
    assert_eq!(cfg.resolve_status_name("Frobnicated"), "Unknown_Message");
}
