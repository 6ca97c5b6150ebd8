//! End-to-end engine test: a modem and a router on loopback TCP, no
//! multicast. Exercises session establishment, destination
//! synchronization, IP invariants, and teardown through the public
//! service API.

use dlep::{
    ConfigValue, DataItem, DataItemValue, DlepClient, Engine, MacAddress, PeerInfo,
    ReturnStatus, TableClient,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingClient {
    params: TableClient,
    events: Mutex<Vec<String>>,
}

impl RecordingClient {
    fn new(local_type: &str, port: u16) -> Arc<Self> {
        let mut params = HashMap::new();
        params.insert(
            "local-type".to_string(),
            ConfigValue::Str(local_type.to_string()),
        );
        params.insert(
            "protocol-config-file".to_string(),
            ConfigValue::Str(
                concat!(env!("CARGO_MANIFEST_DIR"), "/config/dlep-rfc8175.xml").to_string(),
            ),
        );
        params.insert(
            "session-address".to_string(),
            ConfigValue::Addr(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        );
        params.insert("session-port".to_string(), ConfigValue::UInt(u64::from(port)));
        params.insert("discovery-enable".to_string(), ConfigValue::Bool(false));
        params.insert("heartbeat-interval".to_string(), ConfigValue::UInt(1));
        params.insert("heartbeat-threshold".to_string(), ConfigValue::UInt(4));
        params.insert("ack-timeout".to_string(), ConfigValue::UInt(1));
        params.insert("send-tries".to_string(), ConfigValue::UInt(3));
        Arc::new(Self {
            params: TableClient::new(params),
            events: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn has_event(&self, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.contains(needle))
    }
}

impl DlepClient for RecordingClient {
    fn get_config_parameter(&self, name: &str) -> Result<ConfigValue, dlep::ClientError> {
        self.params.get_config_parameter(name)
    }

    fn peer_up(&self, peer_info: &PeerInfo) {
        self.record(format!("peer_up {}", peer_info.peer_id));
    }

    fn peer_update(&self, peer_id: &str, _data_items: &[DataItem]) {
        self.record(format!("peer_update {}", peer_id));
    }

    fn peer_down(&self, peer_id: &str) {
        self.record(format!("peer_down {}", peer_id));
    }

    fn destination_up(&self, _peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) -> String {
        self.record(format!("destination_up {}", mac));
        String::new()
    }

    fn destination_update(&self, _peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) {
        self.record(format!("destination_update {}", mac));
    }

    fn destination_down(&self, _peer_id: &str, mac: &MacAddress) {
        self.record(format!("destination_down {}", mac));
    }

    fn linkchar_request(&self, _peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) {
        self.record(format!("linkchar_request {}", mac));
    }

    fn linkchar_reply(&self, _peer_id: &str, mac: &MacAddress, _data_items: &[DataItem]) {
        self.record(format!("linkchar_reply {}", mac));
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn peering_destinations_and_ip_invariants() {
    let port = 38543;
    let modem_client = RecordingClient::new("modem", port);
    let router_client = RecordingClient::new("router", port);

    let mut modem = Engine::new(modem_client.clone())
        .await
        .expect("modem engine starts");
    let mut router = Engine::new(router_client.clone())
        .await
        .expect("router engine starts");

    // Both sides reach InSession.
    {
        let modem_client = modem_client.clone();
        let router_client = router_client.clone();
        wait_until("peer_up on both sides", move || {
            modem_client.has_event("peer_up") && router_client.has_event("peer_up")
        })
        .await;
    }
    let modem_peers = modem.get_peers().await;
    let router_peers = router.get_peers().await;
    assert_eq!(modem_peers.len(), 1);
    assert_eq!(router_peers.len(), 1);
    assert!(modem_peers[0].contains(':'), "peer id is addr:port");

    let info = router.get_peer_info(&router_peers[0]).await.unwrap();
    assert_eq!(info.heartbeat_interval, 1_000);

    // Destination up propagates modem -> router.
    let mac: MacAddress = "01:02:03:04:05:06".parse().unwrap();
    assert_eq!(modem.destination_up(&mac, vec![]).await, ReturnStatus::Ok);
    {
        let router_client = router_client.clone();
        wait_until("destination_up on the router", move || {
            router_client.has_event("destination_up 01:02:03:04:05:06")
        })
        .await;
    }
    assert_eq!(
        modem.destination_up(&mac, vec![]).await,
        ReturnStatus::DestinationExists
    );

    // Destination update carrying an IP address lands in the router's
    // information base.
    let ip_add = DataItem::new(
        "IPv4_Address",
        DataItemValue::U8Ipv4(1, Ipv4Addr::new(10, 0, 0, 1)),
        &modem.protocol_config(),
        None,
    )
    .unwrap();
    assert_eq!(
        modem.destination_update(&mac, vec![ip_add.clone()]).await,
        ReturnStatus::Ok
    );
    {
        let router_client = router_client.clone();
        wait_until("destination_update on the router", move || {
            router_client.has_event("destination_update")
        })
        .await;
    }
    let router_peers2 = router.get_peers().await;
    let items = router
        .get_destination_info(&router_peers2[0], &mac)
        .await
        .unwrap();
    assert!(items.iter().any(|di| di.ip_equal(&ip_add)));

    // Destination down propagates, and a second down is a no-op error.
    assert_eq!(modem.destination_down(&mac).await, ReturnStatus::Ok);
    {
        let router_client = router_client.clone();
        wait_until("destination_down on the router", move || {
            router_client.has_event("destination_down")
        })
        .await;
    }
    assert_eq!(
        modem.destination_down(&mac).await,
        ReturnStatus::DestinationDoesNotExist
    );

    router.terminate().await;
    modem.terminate().await;
}

#[tokio::test]
async fn redundant_ip_add_takes_the_session_down() {
    let port = 38544;
    let modem_client = RecordingClient::new("modem", port);
    let router_client = RecordingClient::new("router", port);

    let mut modem = Engine::new(modem_client.clone())
        .await
        .expect("modem engine starts");
    let mut router = Engine::new(router_client.clone())
        .await
        .expect("router engine starts");

    {
        let modem_client = modem_client.clone();
        let router_client = router_client.clone();
        wait_until("peer_up on both sides", move || {
            modem_client.has_event("peer_up") && router_client.has_event("peer_up")
        })
        .await;
    }

    let mac: MacAddress = "0a:0b:0c:0d:0e:0f".parse().unwrap();
    assert_eq!(modem.destination_up(&mac, vec![]).await, ReturnStatus::Ok);

    let ip_add = DataItem::new(
        "IPv4_Address",
        DataItemValue::U8Ipv4(1, Ipv4Addr::new(10, 0, 0, 2)),
        &modem.protocol_config(),
        None,
    )
    .unwrap();

    // First add is fine; repeating it violates the invariant on the
    // router, which terminates the session with Inconsistent_Data.
    assert_eq!(
        modem.destination_update(&mac, vec![ip_add.clone()]).await,
        ReturnStatus::Ok
    );
    {
        let router_client = router_client.clone();
        wait_until("first update applied", move || {
            router_client.has_event("destination_update")
        })
        .await;
    }

    // The router already holds the address for this destination, so a
    // second add violates the invariant when the message arrives.
    assert_eq!(
        modem.destination_update(&mac, vec![ip_add]).await,
        ReturnStatus::Ok
    );

    {
        let modem_client = modem_client.clone();
        let router_client = router_client.clone();
        wait_until("peer_down on both sides", move || {
            modem_client.has_event("peer_down") && router_client.has_event("peer_down")
        })
        .await;
    }

    router.terminate().await;
    modem.terminate().await;
}
