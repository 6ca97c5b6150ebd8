//! Destination advertisement: wire codec, database lifecycle, and the
//! rf-id translation toward the information base.

use dlep::destadvert::{
    decode_advertisement, encode_advertisement, DestAdvert, DestAdvertInfo, EntryState,
};
use dlep::engine::{DlepCore, Params};
use dlep::infobase::InfoBase;
use dlep::types::now;
use dlep::{MacAddress, ProtocolConfig, TableClient};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn rf_id(last: u8) -> MacAddress {
    MacAddress::new(vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
}

fn dest(last: u8) -> MacAddress {
    MacAddress::from([2, 0, 0, 0, 0, last])
}

fn advert(rf: &MacAddress, dests: &[MacAddress], seq: u32) -> DestAdvertInfo {
    DestAdvertInfo {
        report_interval: 5,
        uptime: 100,
        sequence_number: seq,
        rf_id: rf.clone(),
        destinations: dests.to_vec(),
        ..Default::default()
    }
}

fn make_core() -> DlepCore {
    let cfg = Arc::new(
        ProtocolConfig::load(Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config/dlep-rfc8175.xml"
        )))
        .expect("shipped catalog loads"),
    );
    let client = Arc::new(TableClient::new(HashMap::new()));
    let params = Params::from_client(client.as_ref()).expect("params resolve");
    DlepCore {
        cfg,
        client,
        params,
        is_modem: true,
        peers: HashMap::new(),
        info_base: InfoBase::new(),
        dest_advert: Some(DestAdvert::new(rf_id(0), 5, 2, 3)),
        terminated: false,
    }
}

#[test]
fn advertisement_codec_round_trip() {
    let info = advert(&rf_id(1), &[dest(1), dest(2)], 42);
    let bytes = encode_advertisement(&info).unwrap();
    let back = decode_advertisement(&bytes).unwrap();
    assert_eq!(back, info);

    assert!(decode_advertisement(&[0xff, 0x00, 0x01]).is_err());
}

#[test]
fn own_advertisement_lists_declared_destinations() {
    let mut da = DestAdvert::new(rf_id(0), 5, 0, 0);
    da.add_destination(&dest(1));
    da.add_destination(&dest(2));
    da.del_destination(&dest(1));

    let info = da.next_advertisement();
    assert_eq!(info.rf_id, rf_id(0));
    assert_eq!(info.destinations, vec![dest(2)]);
    assert_eq!(info.report_interval, 5);
    assert_eq!(info.sequence_number, 1);
    assert_eq!(da.next_advertisement().sequence_number, 2);
}

#[test]
fn advertisement_before_declare_up_stays_down() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(1), &[dest(1)], 1));

    let da = core.dest_advert.as_ref().unwrap();
    let entry = da.db.get(&rf_id(1)).unwrap();
    assert_eq!(entry.state, EntryState::Down);
    assert!(!entry.placeholder);
    // Nothing reaches the information base until the client says up.
    assert!(core.info_base.destinations().is_empty());
}

#[test]
fn declare_up_raises_advertised_destinations() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(1), &[dest(1), dest(2)], 1));

    assert!(core.advert_declare_up(&rf_id(1), vec![]));
    assert!(core.info_base.destinations().contains(&dest(1)));
    assert!(core.info_base.destinations().contains(&dest(2)));
    // The raw rf-id itself never becomes a destination.
    assert!(!core.info_base.destinations().contains(&rf_id(1)));

    // Declaring up twice reports destination-exists.
    assert!(!core.advert_declare_up(&rf_id(1), vec![]));
}

#[test]
fn advertisement_diff_synthesizes_up_and_down() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(1), &[dest(1), dest(2)], 1));
    assert!(core.advert_declare_up(&rf_id(1), vec![]));

    // dest(2) disappears, dest(3) appears.
    core.handle_advertisement(advert(&rf_id(1), &[dest(1), dest(3)], 2));
    assert!(core.info_base.destinations().contains(&dest(1)));
    assert!(!core.info_base.destinations().contains(&dest(2)));
    assert!(core.info_base.destinations().contains(&dest(3)));
}

#[test]
fn placeholder_matches_later_advertisement() {
    let mut core = make_core();
    // Client declares the rf-id up before anything was heard.
    assert!(core.advert_declare_up(&rf_id(1), vec![]));
    {
        let da = core.dest_advert.as_ref().unwrap();
        let entry = da.db.get(&rf_id(1)).unwrap();
        assert!(entry.placeholder);
        assert_eq!(entry.state, EntryState::Up);
    }
    assert!(core.info_base.destinations().is_empty());

    // First advertisement converts the placeholder into real ups.
    core.handle_advertisement(advert(&rf_id(1), &[dest(7)], 1));
    assert!(core.info_base.destinations().contains(&dest(7)));
}

#[test]
fn declare_down_lowers_destinations() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(1), &[dest(1)], 1));
    assert!(core.advert_declare_up(&rf_id(1), vec![]));
    assert!(core.info_base.destinations().contains(&dest(1)));

    assert!(core.advert_declare_down(&rf_id(1)));
    assert!(!core.info_base.destinations().contains(&dest(1)));
    // Down twice reports not-found.
    assert!(!core.advert_declare_down(&rf_id(1)));
}

#[test]
fn purge_expires_stale_entries() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(1), &[dest(1)], 1));
    assert!(core.advert_declare_up(&rf_id(1), vec![]));

    // Fresh entry survives the sweep.
    core.purge_advertisements(now());
    assert!(core.dest_advert.as_ref().unwrap().db.contains_key(&rf_id(1)));

    // Older than expire-count (3) x report-interval (5): removed, and
    // its destinations go down.
    core.purge_advertisements(now() + 16);
    assert!(!core.dest_advert.as_ref().unwrap().db.contains_key(&rf_id(1)));
    assert!(!core.info_base.destinations().contains(&dest(1)));
}

#[test]
fn purge_drops_old_placeholders() {
    let mut core = make_core();
    assert!(core.advert_declare_up(&rf_id(9), vec![]));

    // hold-interval is 2 on this core.
    core.purge_advertisements(now() + 1);
    assert!(core.dest_advert.as_ref().unwrap().db.contains_key(&rf_id(9)));
    core.purge_advertisements(now() + 3);
    assert!(!core.dest_advert.as_ref().unwrap().db.contains_key(&rf_id(9)));
}

#[test]
fn own_loopback_is_ignored() {
    let mut core = make_core();
    core.handle_advertisement(advert(&rf_id(0), &[dest(1)], 1));
    assert!(core.dest_advert.as_ref().unwrap().db.is_empty());
}
