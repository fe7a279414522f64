//! BLE-vs-WiFi-Direct selection and the peer-address ↔ identity maps.

use std::collections::HashMap;

use bitchat_core::{HashId, PeerAddress};

/// Which local radio a packet should go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transport {
    Ble,
    WiFiDirect,
}

/// What's known about a peer over BLE.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlePeerInfo {
    pub addr: PeerAddress,
    /// Received signal strength, in dBm (typically -30 to -100).
    pub rssi: i32,
    pub last_seen: u64,
}

/// What's known about a peer over WiFi-Direct.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WifiPeerInfo {
    pub addr: PeerAddress,
    pub last_seen: u64,
}

/// Single source of truth for BLE addresses, a process-wide singleton in
/// the app that owns it; internally it is just a plain map here, with
/// thread-safety left to the caller's lock.
#[derive(Debug, Default)]
pub struct BleFingerprintManager {
    peers: HashMap<PeerAddress, BlePeerInfo>,
}

impl BleFingerprintManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, info: BlePeerInfo) {
        self.peers.insert(info.addr.clone(), info);
    }

    pub fn get(&self, addr: &str) -> Option<&BlePeerInfo> {
        self.peers.get(addr)
    }

    pub fn remove(&mut self, addr: &str) {
        self.peers.remove(addr);
    }
}

/// Bidirectional `PeerAddress ↔ HashID` map for WiFi-Direct, since WiFi
/// addresses are stable enough to be worth remembering across sessions
/// (unlike BLE, which rotates its advertised address more aggressively).
#[derive(Debug, Default)]
pub struct PeerMapper {
    addr_to_hash: HashMap<PeerAddress, HashId>,
    hash_to_addr: HashMap<HashId, PeerAddress>,
}

impl PeerMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, addr: PeerAddress, hash: HashId) {
        if let Some(old_addr) = self.hash_to_addr.get(&hash) {
            self.addr_to_hash.remove(old_addr);
        }
        self.addr_to_hash.insert(addr.clone(), hash.clone());
        self.hash_to_addr.insert(hash, addr);
    }

    pub fn hash_for(&self, addr: &str) -> Option<&HashId> {
        self.addr_to_hash.get(addr)
    }

    pub fn addr_for(&self, hash: &str) -> Option<&PeerAddress> {
        self.hash_to_addr.get(hash)
    }
}

/// Selects BLE or WiFi-Direct per peer/packet and tracks usage counters.
#[derive(Debug, Default)]
pub struct TransportRouter {
    pub ble: BleFingerprintManager,
    pub peer_mapper: PeerMapper,
    ble_count: u64,
    wifi_count: u64,
}

impl TransportRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ble_count(&self) -> u64 {
        self.ble_count
    }

    pub fn wifi_count(&self) -> u64 {
        self.wifi_count
    }

    /// Decision table (first match wins), per the external interface
    /// contract. `ble`/`wifi` are the current reachability info for this
    /// peer, if any; `battery_percent` is the local device's battery.
    pub fn select(
        &mut self,
        ble: Option<&BlePeerInfo>,
        wifi: Option<&WifiPeerInfo>,
        battery_percent: u8,
        packet_size: usize,
    ) -> Transport {
        let choice = match (ble, wifi) {
            _ if battery_percent < 10 => Transport::Ble,
            (None, Some(_)) => Transport::WiFiDirect,
            (Some(_), None) => Transport::Ble,
            (Some(_), Some(_)) if packet_size > 10_000 => Transport::WiFiDirect,
            (Some(ble), Some(_)) if ble.rssi > -60 => Transport::Ble,
            (Some(ble), Some(_)) if ble.rssi < -80 => Transport::WiFiDirect,
            (Some(_), Some(_)) if battery_percent < 20 => Transport::Ble,
            (Some(_), Some(_)) => Transport::WiFiDirect,
            (None, None) => Transport::Ble,
        };
        match choice {
            Transport::Ble => self.ble_count += 1,
            Transport::WiFiDirect => self.wifi_count += 1,
        }
        choice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ble(rssi: i32) -> BlePeerInfo {
        BlePeerInfo {
            addr: "ble-addr".to_string(),
            rssi,
            last_seen: 0,
        }
    }

    fn wifi() -> WifiPeerInfo {
        WifiPeerInfo {
            addr: "wifi-addr".to_string(),
            last_seen: 0,
        }
    }

    #[test]
    fn router_scenario_from_the_design_doc() {
        let mut router = TransportRouter::new();

        // Battery 80%, both reachable, rssi=-50, payload 1 KB -> BLE.
        assert_eq!(router.select(Some(&ble(-50)), Some(&wifi()), 80, 1_000), Transport::Ble);

        // Same with payload 20 KB -> WiFi.
        assert_eq!(router.select(Some(&ble(-50)), Some(&wifi()), 80, 20_000), Transport::WiFiDirect);

        // Same with rssi=-85, payload 1 KB -> WiFi.
        assert_eq!(router.select(Some(&ble(-85)), Some(&wifi()), 80, 1_000), Transport::WiFiDirect);

        // Battery 8%, any config -> BLE.
        assert_eq!(router.select(Some(&ble(-85)), Some(&wifi()), 8, 20_000), Transport::Ble);
    }

    #[test]
    fn wifi_known_ble_unknown_prefers_wifi() {
        let mut router = TransportRouter::new();
        assert_eq!(router.select(None, Some(&wifi()), 80, 100), Transport::WiFiDirect);
    }

    #[test]
    fn ble_known_wifi_unknown_prefers_ble() {
        let mut router = TransportRouter::new();
        assert_eq!(router.select(Some(&ble(-50)), None, 80, 100), Transport::Ble);
    }

    #[test]
    fn neither_known_queues_on_ble() {
        let mut router = TransportRouter::new();
        assert_eq!(router.select(None, None, 80, 100), Transport::Ble);
    }

    #[test]
    fn low_battery_and_both_known_midrange_rssi_prefers_ble() {
        let mut router = TransportRouter::new();
        assert_eq!(router.select(Some(&ble(-70)), Some(&wifi()), 15, 100), Transport::Ble);
    }

    #[test]
    fn usage_counters_track_selections() {
        let mut router = TransportRouter::new();
        router.select(Some(&ble(-50)), Some(&wifi()), 80, 1_000);
        router.select(None, Some(&wifi()), 80, 100);
        assert_eq!(router.ble_count(), 1);
        assert_eq!(router.wifi_count(), 1);
    }

    #[test]
    fn peer_mapper_is_bidirectional_and_rebinds_stale_addresses() {
        let mut mapper = PeerMapper::new();
        mapper.bind("addr1".to_string(), "HASH0001".to_string());
        assert_eq!(mapper.hash_for("addr1"), Some(&"HASH0001".to_string()));
        assert_eq!(mapper.addr_for("HASH0001"), Some(&"addr1".to_string()));

        mapper.bind("addr2".to_string(), "HASH0001".to_string());
        assert_eq!(mapper.addr_for("HASH0001"), Some(&"addr2".to_string()));
        assert_eq!(mapper.hash_for("addr1"), None);
    }

    #[test]
    fn ble_fingerprint_manager_tracks_and_removes_peers() {
        let mut manager = BleFingerprintManager::new();
        manager.observe(ble(-60));
        assert!(manager.get("ble-addr").is_some());
        manager.remove("ble-addr");
        assert!(manager.get("ble-addr").is_none());
    }
}
