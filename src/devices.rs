//! Entity store: BSS and station records learned from capture, group key
//! slots, TDLS links, and the externally supplied key material pools.
//!
//! Records are created on demand as traffic references them. Group and
//! broadcast addresses never become entities of their own.

use std::collections::HashMap;

use crate::cipher::Cipher;
use crate::frame::MacAddress;
use crate::ie::{Akm, RsnInfo};
use crate::kdf::{psk_from_passphrase, Ptk, Tpk};
use crate::pn::ReplayCounter;

/// Per-TID replay counter slots: TIDs 0..15 plus one for non-QoS frames.
pub const TID_SLOTS: usize = 17;

/// GTK slots addressable by the frame key ID.
pub const GTK_SLOTS: usize = 4;
/// IGTK/BIGTK slots addressable by the MME key ID (4..5 IGTK, 6..7 BIGTK).
pub const IGTK_SLOTS: usize = 8;

/// An installed group key: GTK, IGTK, or BIGTK depending on the slot.
#[derive(Clone, Debug)]
pub struct GroupKey {
    pub cipher: Cipher,
    pub tk: Vec<u8>,
    pub rx: ReplayCounter,
    pub tx: ReplayCounter,
}

impl GroupKey {
    pub fn new(cipher: Cipher, tk: Vec<u8>) -> Self {
        GroupKey {
            cipher,
            tk,
            rx: ReplayCounter::new(),
            tx: ReplayCounter::new(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StaState {
    #[default]
    NotAuth,
    Auth,
    AuthAssoc,
}

/// A station associated (or associating) with a BSS.
#[derive(Clone, Debug)]
pub struct Station {
    pub addr: MacAddress,
    pub state: StaState,
    pub pairwise_cipher: Option<Cipher>,
    pub rsn: Option<RsnInfo>,
    /// Confirmed PTK, promoted from `tptk` once the handshake completes.
    pub ptk: Option<Ptk>,
    /// Candidate PTK derived from message 2, not yet confirmed.
    pub tptk: Option<Ptk>,
    pub anonce: Option<[u8; 32]>,
    pub snonce: Option<[u8; 32]>,
    /// Both ends advertised Extended Key ID for individually addressed
    /// frames, so key ID 1 is acceptable for unicast.
    pub extended_key_id: bool,
    /// One decrypt with the old counter value is tolerated after a failed
    /// trial, matching retransmission behavior.
    pub allow_duplicate: bool,
    pub rx_tods: [ReplayCounter; TID_SLOTS],
    pub rx_fromds: [ReplayCounter; TID_SLOTS],
    pub tx_tods: [ReplayCounter; TID_SLOTS],
    pub tx_fromds: [ReplayCounter; TID_SLOTS],
    /// Traffic volume per TID, counted whether or not a frame decrypts.
    pub tx_tid: [u64; TID_SLOTS],
    pub rx_tid: [u64; TID_SLOTS],
}

impl Station {
    pub fn new(addr: MacAddress) -> Self {
        Station {
            addr,
            state: StaState::NotAuth,
            pairwise_cipher: None,
            rsn: None,
            ptk: None,
            tptk: None,
            anonce: None,
            snonce: None,
            extended_key_id: false,
            allow_duplicate: false,
            rx_tods: Default::default(),
            rx_fromds: Default::default(),
            tx_tods: Default::default(),
            tx_fromds: Default::default(),
            tx_tid: [0; TID_SLOTS],
            rx_tid: [0; TID_SLOTS],
        }
    }

    /// Promote the candidate PTK and wipe every replay counter, since the
    /// new key restarts the packet number space.
    pub fn promote_tptk(&mut self) {
        if let Some(tptk) = self.tptk.take() {
            self.ptk = Some(tptk);
            self.reset_replay_counters();
        }
    }

    pub fn reset_replay_counters(&mut self) {
        for c in self
            .rx_tods
            .iter_mut()
            .chain(self.rx_fromds.iter_mut())
            .chain(self.tx_tods.iter_mut())
            .chain(self.tx_fromds.iter_mut())
        {
            c.reset();
        }
    }

    pub fn akm_uses_sha256(&self) -> bool {
        self.rsn
            .as_ref()
            .map(|rsn| rsn.akms.iter().any(Akm::uses_sha256))
            .unwrap_or(false)
    }
}

/// A BSS (or MBSS) learned from beacons, probe responses, or traffic.
#[derive(Clone, Debug, Default)]
pub struct Bss {
    pub bssid: MacAddress,
    pub ssid: Option<Vec<u8>>,
    pub rsn: Option<RsnInfo>,
    pub mesh: bool,
    pub gtk: [Option<GroupKey>; GTK_SLOTS],
    pub igtk: [Option<GroupKey>; IGTK_SLOTS],
    /// PMKs usable within this BSS: passphrase-derived once the SSID is
    /// known, plus any raw PMKs supplied on the command line.
    pub pmks: Vec<[u8; 32]>,
    pub stations: HashMap<MacAddress, Station>,
}

impl Bss {
    fn new(bssid: MacAddress) -> Self {
        Bss {
            bssid,
            ..Default::default()
        }
    }

    pub fn get_or_insert_sta(&mut self, addr: MacAddress) -> &mut Station {
        self.stations
            .entry(addr)
            .or_insert_with(|| Station::new(addr))
    }

    pub fn group_cipher(&self) -> Option<Cipher> {
        self.rsn.as_ref().and_then(|rsn| rsn.group_cipher)
    }

    pub fn group_mgmt_cipher(&self) -> Option<Cipher> {
        self.rsn
            .as_ref()
            .and_then(|rsn| rsn.group_mgmt_cipher)
            .or_else(|| {
                // MFP without an explicit selector defaults to BIP-CMAC-128.
                self.rsn
                    .as_ref()
                    .filter(|rsn| rsn.mfp_capable())
                    .map(|_| Cipher::BipCmac128)
            })
    }

    pub fn mfp_required(&self) -> bool {
        self.rsn.as_ref().map(RsnInfo::mfp_required).unwrap_or(false)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TdlsState {
    #[default]
    NoLink,
    Pending,
    PendingConfirm,
    LinkUp,
}

/// A TDLS direct link between two stations of a BSS, keyed by the ordered
/// (initiator, responder) pair.
#[derive(Clone, Debug)]
pub struct TdlsLink {
    pub bssid: MacAddress,
    pub init: MacAddress,
    pub resp: MacAddress,
    pub state: TdlsState,
    pub dialog_token: u8,
    pub anonce: Option<[u8; 32]>,
    pub snonce: Option<[u8; 32]>,
    pub tpk: Option<Tpk>,
    pub rx_init_to_resp: [ReplayCounter; TID_SLOTS],
    pub rx_resp_to_init: [ReplayCounter; TID_SLOTS],
    pub tx: [ReplayCounter; TID_SLOTS],
}

impl TdlsLink {
    pub fn new(bssid: MacAddress, init: MacAddress, resp: MacAddress) -> Self {
        TdlsLink {
            bssid,
            init,
            resp,
            state: TdlsState::NoLink,
            dialog_token: 0,
            anonce: None,
            snonce: None,
            tpk: None,
            rx_init_to_resp: Default::default(),
            rx_resp_to_init: Default::default(),
            tx: Default::default(),
        }
    }

    pub fn reset_replay_counters(&mut self) {
        for c in self
            .rx_init_to_resp
            .iter_mut()
            .chain(self.rx_resp_to_init.iter_mut())
            .chain(self.tx.iter_mut())
        {
            c.reset();
        }
    }
}

/// Top-level store: every BSS, every TDLS link, and the key material pools
/// supplied up front.
#[derive(Clone, Debug, Default)]
pub struct Store {
    pub bss: HashMap<MacAddress, Bss>,
    pub tdls: Vec<TdlsLink>,
    /// Raw PMKs to try against every handshake.
    pub pmks: Vec<[u8; 32]>,
    /// Raw PTKs to try against traffic with no observed handshake.
    pub ptks: Vec<Ptk>,
    pub wep_keys: Vec<Vec<u8>>,
    pub passphrases: Vec<String>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Look up or create a BSS record. Group addresses are not identities.
    pub fn get_or_insert_bss(&mut self, bssid: MacAddress) -> Option<&mut Bss> {
        if bssid.is_group() {
            return None;
        }
        let pmks = self.pmks.clone();
        Some(self.bss.entry(bssid).or_insert_with(|| {
            let mut bss = Bss::new(bssid);
            bss.pmks = pmks;
            bss
        }))
    }

    pub fn get_bss(&self, bssid: &MacAddress) -> Option<&Bss> {
        self.bss.get(bssid)
    }

    pub fn get_bss_mut(&mut self, bssid: &MacAddress) -> Option<&mut Bss> {
        self.bss.get_mut(bssid)
    }

    pub fn get_sta_mut(
        &mut self,
        bssid: &MacAddress,
        addr: &MacAddress,
    ) -> Option<&mut Station> {
        self.bss.get_mut(bssid)?.stations.get_mut(addr)
    }

    /// Record an SSID for a BSS and derive PSKs from every configured
    /// passphrase the first time it is learned.
    pub fn learn_ssid(&mut self, bssid: MacAddress, ssid: &[u8]) {
        let passphrases = self.passphrases.clone();
        let Some(bss) = self.get_or_insert_bss(bssid) else {
            return;
        };
        if bss.ssid.as_deref() == Some(ssid) {
            return;
        }
        bss.ssid = Some(ssid.to_vec());
        for passphrase in &passphrases {
            let psk = psk_from_passphrase(passphrase, ssid);
            if !bss.pmks.contains(&psk) {
                bss.pmks.push(psk);
            }
        }
    }

    /// Find a TDLS link by its exact (initiator, responder) pair.
    pub fn tdls_link_mut(
        &mut self,
        bssid: &MacAddress,
        init: &MacAddress,
        resp: &MacAddress,
    ) -> Option<&mut TdlsLink> {
        self.tdls
            .iter_mut()
            .find(|l| l.bssid == *bssid && l.init == *init && l.resp == *resp)
    }

    /// Find a link between two peers in either direction.
    pub fn tdls_link_between_mut(
        &mut self,
        a: &MacAddress,
        b: &MacAddress,
    ) -> Option<&mut TdlsLink> {
        self.tdls.iter_mut().find(|l| {
            (l.init == *a && l.resp == *b) || (l.init == *b && l.resp == *a)
        })
    }

    pub fn get_or_insert_tdls(
        &mut self,
        bssid: MacAddress,
        init: MacAddress,
        resp: MacAddress,
    ) -> &mut TdlsLink {
        let idx = self
            .tdls
            .iter()
            .position(|l| l.bssid == bssid && l.init == init && l.resp == resp);
        match idx {
            Some(i) => &mut self.tdls[i],
            None => {
                self.tdls.push(TdlsLink::new(bssid, init, resp));
                self.tdls.last_mut().unwrap()
            }
        }
    }

    /// Drop the reverse-direction link for a pair whose setup just
    /// completed, so only one live record exists per peer pair.
    pub fn prune_reverse_tdls(&mut self, bssid: &MacAddress, init: &MacAddress, resp: &MacAddress) {
        self.tdls.retain(|l| {
            !(l.bssid == *bssid && l.init == *resp && l.resp == *init)
        });
    }

    pub fn add_pmk(&mut self, pmk: [u8; 32]) {
        if !self.pmks.contains(&pmk) {
            self.pmks.push(pmk);
        }
        for bss in self.bss.values_mut() {
            if !bss.pmks.contains(&pmk) {
                bss.pmks.push(pmk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn group_addresses_never_become_entities() {
        let mut store = Store::new();
        assert!(store.get_or_insert_bss(MacAddress::BROADCAST).is_none());
        assert!(store
            .get_or_insert_bss(MacAddress([0x01, 0, 0x5e, 0, 0, 1]))
            .is_none());
        assert!(store.get_or_insert_bss(mac(1)).is_some());
        assert_eq!(store.bss.len(), 1);
    }

    #[test]
    fn ssid_learning_derives_psks_from_passphrases() {
        let mut store = Store::new();
        store.passphrases.push("password".to_string());
        store.learn_ssid(mac(1), b"IEEE");
        let bss = store.get_bss(&mac(1)).unwrap();
        assert_eq!(bss.pmks.len(), 1);
        assert_eq!(bss.pmks[0][0], 0xf4);

        // Learning the same SSID again must not duplicate the PSK.
        store.learn_ssid(mac(1), b"IEEE");
        assert_eq!(store.get_bss(&mac(1)).unwrap().pmks.len(), 1);
    }

    #[test]
    fn tptk_promotion_resets_counters() {
        let mut sta = Station::new(mac(2));
        sta.tptk = Ptk::from_raw(&[0x11; 48]);
        sta.rx_tods[0].seed(crate::pn::Pn::new(99));
        sta.promote_tptk();
        assert!(sta.ptk.is_some());
        assert!(sta.tptk.is_none());
        assert!(sta.rx_tods[0].current().is_none());
    }

    #[test]
    fn reverse_tdls_link_is_pruned() {
        let mut store = Store::new();
        store.get_or_insert_tdls(mac(1), mac(2), mac(3));
        store.get_or_insert_tdls(mac(1), mac(3), mac(2));
        assert_eq!(store.tdls.len(), 2);
        store.prune_reverse_tdls(&mac(1), &mac(2), &mac(3));
        assert_eq!(store.tdls.len(), 1);
        assert_eq!(store.tdls[0].init, mac(2));
    }

    #[test]
    fn added_pmks_propagate_to_existing_bss_records() {
        let mut store = Store::new();
        store.get_or_insert_bss(mac(1));
        store.add_pmk([7; 32]);
        assert!(store.get_bss(&mac(1)).unwrap().pmks.contains(&[7; 32]));
        // And to records created afterwards.
        store.get_or_insert_bss(mac(2));
        assert!(store.get_bss(&mac(2)).unwrap().pmks.contains(&[7; 32]));
    }
}
