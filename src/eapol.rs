//! EAPOL-Key handling: parse the key descriptor, classify the handshake
//! message, derive candidate PTKs against every known PMK, and install the
//! group keys delivered in message 3 and in group rekeys.

use aes::Aes128;
use cmac::Cmac;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::cipher::Cipher;
use crate::devices::GroupKey;
use crate::frame::MacAddress;
use crate::kdf::{aes_unwrap, derive_ptk, Ptk};
use crate::pn::Pn;
use crate::runtime::SleuthRuntime;
use crate::status::MessageType;

pub const KEY_INFO_VERSION_MASK: u16 = 0x0007;
pub const KEY_INFO_PAIRWISE: u16 = 0x0008;
pub const KEY_INFO_INSTALL: u16 = 0x0040;
pub const KEY_INFO_ACK: u16 = 0x0080;
pub const KEY_INFO_MIC: u16 = 0x0100;
pub const KEY_INFO_SECURE: u16 = 0x0200;
pub const KEY_INFO_ENCRYPTED: u16 = 0x1000;

const DESC_TYPE_RSN: u8 = 2;
const DESC_TYPE_WPA: u8 = 254;

// Offset of the Key MIC field inside the full EAPOL frame.
const MIC_OFFSET: usize = 81;

#[derive(Clone, Debug)]
pub struct EapolKey {
    pub descriptor_type: u8,
    pub key_info: u16,
    pub key_length: u16,
    pub replay_counter: u64,
    pub key_nonce: [u8; 32],
    pub key_rsc: [u8; 8],
    pub key_mic: [u8; 16],
    pub key_data: Vec<u8>,
}

impl EapolKey {
    /// Parse an EAPOL frame (starting at the 802.1X header) as an EAPOL-Key
    /// descriptor with a 16-byte MIC field.
    pub fn parse(data: &[u8]) -> Result<Self, String> {
        if data.len() < 4 {
            return Err("EAPOL frame truncated".to_string());
        }
        if data[1] != 3 {
            return Err(format!("not an EAPOL-Key frame (type {})", data[1]));
        }
        let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let body = data
            .get(4..4 + body_len)
            .ok_or("EAPOL body length exceeds frame")?;
        if body.len() < 95 {
            return Err("EAPOL-Key descriptor truncated".to_string());
        }
        let descriptor_type = body[0];
        if descriptor_type != DESC_TYPE_RSN && descriptor_type != DESC_TYPE_WPA {
            return Err(format!("unknown key descriptor type {descriptor_type}"));
        }
        let key_info = u16::from_be_bytes([body[1], body[2]]);
        let key_length = u16::from_be_bytes([body[3], body[4]]);
        let replay_counter = u64::from_be_bytes(body[5..13].try_into().unwrap_or([0; 8]));
        let mut key_nonce = [0u8; 32];
        key_nonce.copy_from_slice(&body[13..45]);
        let mut key_rsc = [0u8; 8];
        key_rsc.copy_from_slice(&body[61..69]);
        let mut key_mic = [0u8; 16];
        key_mic.copy_from_slice(&body[77..93]);
        let key_data_len = u16::from_be_bytes([body[93], body[94]]) as usize;
        let key_data = body
            .get(95..95 + key_data_len)
            .ok_or("EAPOL key data length exceeds body")?
            .to_vec();
        Ok(EapolKey {
            descriptor_type,
            key_info,
            key_length,
            replay_counter,
            key_nonce,
            key_rsc,
            key_mic,
            key_data,
        })
    }

    pub fn rsc_pn(&self) -> Pn {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&self.key_rsc[..6]);
        Pn::from_le_bytes(&bytes)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyMsg {
    M1,
    M2,
    M3,
    M4,
    Group1,
    Group2,
}

pub fn classify(key: &EapolKey) -> KeyMsg {
    let info = key.key_info;
    if info & KEY_INFO_PAIRWISE != 0 {
        if info & KEY_INFO_ACK != 0 {
            if info & KEY_INFO_MIC == 0 {
                KeyMsg::M1
            } else {
                KeyMsg::M3
            }
        } else if info & KEY_INFO_SECURE == 0 {
            KeyMsg::M2
        } else {
            KeyMsg::M4
        }
    } else if info & KEY_INFO_ACK != 0 {
        KeyMsg::Group1
    } else {
        KeyMsg::Group2
    }
}

/// Verify the Key MIC over the full EAPOL frame with the MIC field zeroed.
/// Descriptor version 2 is HMAC-SHA1-128, version 3 (and the SHA256 AKMs)
/// AES-128-CMAC. Version 1 (HMAC-MD5) is not supported.
pub fn verify_mic(kck: &[u8], key_info: u16, eapol: &[u8], mic: &[u8; 16]) -> Option<bool> {
    if eapol.len() < MIC_OFFSET + 16 {
        return Some(false);
    }
    let mut buf = eapol.to_vec();
    buf[MIC_OFFSET..MIC_OFFSET + 16].fill(0);
    match key_info & KEY_INFO_VERSION_MASK {
        2 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(kck).ok()?;
            mac.update(&buf);
            Some(mac.finalize().into_bytes()[..16] == mic[..])
        }
        3 => {
            let mut mac = Cmac::<Aes128>::new_from_slice(kck).ok()?;
            mac.update(&buf);
            Some(mac.finalize().into_bytes()[..] == mic[..])
        }
        _ => None,
    }
}

/// One KDE (or IE) from a decrypted Key Data field.
enum Kde<'a> {
    Gtk { key_id: u8, gtk: &'a [u8] },
    Igtk { key_id: u16, ipn: [u8; 6], igtk: &'a [u8] },
    Other,
}

fn iter_kdes(data: &[u8]) -> Vec<Kde<'_>> {
    let mut out = Vec::new();
    let mut rest = data;
    while rest.len() >= 2 {
        let id = rest[0];
        let len = rest[1] as usize;
        if id == 0xdd && len == 0 {
            break; // key data padding
        }
        let Some(payload) = rest.get(2..2 + len) else {
            break;
        };
        if id == 0xdd && len >= 4 && payload[0..3] == [0x00, 0x0f, 0xac] {
            let body = &payload[4..];
            match payload[3] {
                1 if body.len() > 2 => out.push(Kde::Gtk {
                    key_id: body[0] & 0x03,
                    gtk: &body[2..],
                }),
                9 if body.len() > 8 => {
                    let mut ipn = [0u8; 6];
                    ipn.copy_from_slice(&body[2..8]);
                    out.push(Kde::Igtk {
                        key_id: u16::from_le_bytes([body[0], body[1]]),
                        ipn,
                        igtk: &body[8..],
                    });
                }
                _ => out.push(Kde::Other),
            }
        } else {
            out.push(Kde::Other);
        }
        rest = &rest[2 + len..];
    }
    out
}

fn group_cipher_for_len(hint: Option<Cipher>, len: usize) -> Option<Cipher> {
    match hint {
        Some(c) if c.tk_len() == Some(len) => Some(c),
        _ => match len {
            32 => Some(Cipher::Tkip),
            16 => Some(Cipher::Ccmp),
            _ => None,
        },
    }
}

fn install_group_keys(rt: &mut SleuthRuntime, bssid: MacAddress, key: &EapolKey, key_data: &[u8]) {
    let rsc = key.rsc_pn();
    let Some(bss) = rt.store.get_bss_mut(&bssid) else {
        return;
    };
    let group_hint = bss.group_cipher();
    let mgmt_cipher = bss.group_mgmt_cipher();
    let mut events = Vec::new();

    for kde in iter_kdes(key_data) {
        match kde {
            Kde::Gtk { key_id, gtk } => {
                let Some(cipher) = group_cipher_for_len(group_hint, gtk.len()) else {
                    events.push((
                        MessageType::Warning,
                        format!("GTK KDE with unusable key length {}", gtk.len()),
                    ));
                    continue;
                };
                let mut group = GroupKey::new(cipher, gtk.to_vec());
                group.rx.seed(rsc);
                bss.gtk[key_id as usize & 0x03] = Some(group);
                events.push((
                    MessageType::Info,
                    format!("learned GTK (id {key_id}, {cipher}) for {bssid}"),
                ));
            }
            Kde::Igtk { key_id, ipn, igtk } => {
                if !(4..8).contains(&key_id) {
                    events.push((
                        MessageType::Warning,
                        format!("IGTK KDE with key id {key_id} outside 4..7"),
                    ));
                    continue;
                }
                let cipher = match mgmt_cipher {
                    Some(c) if c.tk_len() == Some(igtk.len()) => c,
                    _ if igtk.len() == 16 => Cipher::BipCmac128,
                    _ if igtk.len() == 32 => Cipher::BipCmac256,
                    _ => {
                        events.push((
                            MessageType::Warning,
                            format!("IGTK KDE with unusable key length {}", igtk.len()),
                        ));
                        continue;
                    }
                };
                let mut group = GroupKey::new(cipher, igtk.to_vec());
                group.rx.seed(Pn::from_le_bytes(&ipn));
                bss.igtk[key_id as usize & 0x07] = Some(group);
                events.push((
                    MessageType::Info,
                    format!("learned IGTK (id {key_id}, {cipher}) for {bssid}"),
                ));
            }
            Kde::Other => {}
        }
    }
    for (message_type, content) in events {
        rt.log(message_type, content);
    }
}

/// Decrypt the Key Data field of message 3 / group message 1 using the KEK.
fn decrypt_key_data(key: &EapolKey, kek: &[u8]) -> Option<Vec<u8>> {
    if key.key_info & KEY_INFO_ENCRYPTED == 0 {
        return Some(key.key_data.clone());
    }
    aes_unwrap(kek, &key.key_data).ok()
}

/// Entry point for an EAPOL frame seen on the air. `src`/`dst` are the
/// station-level sender and receiver; frames from the BSSID come from the
/// authenticator.
pub fn rx_eapol(
    rt: &mut SleuthRuntime,
    bssid: MacAddress,
    src: MacAddress,
    dst: MacAddress,
    data: &[u8],
) -> Result<(), String> {
    rt.counters.eapol_frames += 1;
    let key = EapolKey::parse(data)?;
    let from_ap = src == bssid;
    let sta_addr = if from_ap { dst } else { src };

    match classify(&key) {
        KeyMsg::M1 => {
            if let Some(bss) = rt.store.get_or_insert_bss(bssid) {
                let sta = bss.get_or_insert_sta(sta_addr);
                sta.anonce = Some(key.key_nonce);
            }
            rt.log(
                MessageType::Trace,
                format!("EAPOL M1 {bssid} -> {sta_addr}"),
            );
        }
        KeyMsg::M2 => rx_m2(rt, bssid, sta_addr, &key, data),
        KeyMsg::M3 => rx_m3(rt, bssid, sta_addr, &key, data),
        KeyMsg::M4 => {
            let mut confirmed = false;
            if let Some(sta) = rt.store.get_sta_mut(&bssid, &sta_addr) {
                if sta.tptk.is_some() {
                    sta.promote_tptk();
                    confirmed = true;
                }
            }
            if confirmed {
                rt.log(
                    MessageType::Info,
                    format!("4-way handshake complete for {sta_addr} in {bssid}"),
                );
            }
        }
        KeyMsg::Group1 => rx_group1(rt, bssid, sta_addr, &key, data),
        KeyMsg::Group2 => {}
    }
    Ok(())
}

fn sta_ptk_params(rt: &SleuthRuntime, bssid: &MacAddress, sta_addr: &MacAddress) -> (bool, usize) {
    let sta = rt
        .store
        .get_bss(bssid)
        .and_then(|bss| bss.stations.get(sta_addr));
    let use_sha256 = sta.map(|s| s.akm_uses_sha256()).unwrap_or(false);
    let tk_len = sta
        .and_then(|s| s.pairwise_cipher)
        .and_then(|c| c.tk_len())
        .unwrap_or(16);
    (use_sha256, tk_len)
}

fn rx_m2(
    rt: &mut SleuthRuntime,
    bssid: MacAddress,
    sta_addr: MacAddress,
    key: &EapolKey,
    eapol: &[u8],
) {
    let Some(anonce) = rt
        .store
        .get_bss(&bssid)
        .and_then(|bss| bss.stations.get(&sta_addr))
        .and_then(|sta| sta.anonce)
    else {
        rt.log(
            MessageType::Warning,
            format!("EAPOL M2 from {sta_addr} without a captured M1"),
        );
        return;
    };
    let snonce = key.key_nonce;
    let (use_sha256, tk_len) = sta_ptk_params(rt, &bssid, &sta_addr);
    let pmks = rt
        .store
        .get_bss(&bssid)
        .map(|bss| bss.pmks.clone())
        .unwrap_or_default();

    let mut derived: Option<Ptk> = None;
    for pmk in &pmks {
        let ptk = derive_ptk(pmk, &bssid, &sta_addr, &anonce, &snonce, use_sha256, tk_len);
        match verify_mic(&ptk.kck, key.key_info, eapol, &key.key_mic) {
            Some(true) => {
                derived = Some(ptk);
                break;
            }
            Some(false) => {}
            None => {
                rt.log(
                    MessageType::Warning,
                    format!(
                        "unsupported EAPOL key descriptor version {}",
                        key.key_info & KEY_INFO_VERSION_MASK
                    ),
                );
                return;
            }
        }
    }

    match derived {
        Some(ptk) => {
            if let Some(sta) = rt.store.get_sta_mut(&bssid, &sta_addr) {
                sta.snonce = Some(snonce);
                sta.tptk = Some(ptk);
            }
            rt.log(
                MessageType::Info,
                format!("derived candidate PTK for {sta_addr} in {bssid}"),
            );
        }
        None if !pmks.is_empty() => rt.log(
            MessageType::Warning,
            format!("no configured PMK matches the M2 MIC from {sta_addr}"),
        ),
        None => {}
    }
}

fn rx_m3(
    rt: &mut SleuthRuntime,
    bssid: MacAddress,
    sta_addr: MacAddress,
    key: &EapolKey,
    eapol: &[u8],
) {
    let ptk = rt
        .store
        .get_bss(&bssid)
        .and_then(|bss| bss.stations.get(&sta_addr))
        .and_then(|sta| sta.tptk.clone().or_else(|| sta.ptk.clone()));
    let Some(ptk) = ptk else {
        return;
    };
    if verify_mic(&ptk.kck, key.key_info, eapol, &key.key_mic) != Some(true) {
        rt.log(
            MessageType::Warning,
            format!("EAPOL M3 MIC mismatch for {sta_addr} in {bssid}"),
        );
        return;
    }
    if let Some(key_data) = decrypt_key_data(key, &ptk.kek) {
        install_group_keys(rt, bssid, key, &key_data);
    } else {
        rt.log(
            MessageType::Warning,
            format!("failed to unwrap M3 key data for {sta_addr} in {bssid}"),
        );
    }
}

fn rx_group1(
    rt: &mut SleuthRuntime,
    bssid: MacAddress,
    sta_addr: MacAddress,
    key: &EapolKey,
    eapol: &[u8],
) {
    let ptk = rt
        .store
        .get_bss(&bssid)
        .and_then(|bss| bss.stations.get(&sta_addr))
        .and_then(|sta| sta.ptk.clone());
    let Some(ptk) = ptk else {
        return;
    };
    if verify_mic(&ptk.kck, key.key_info, eapol, &key.key_mic) != Some(true) {
        rt.log(
            MessageType::Warning,
            format!("group rekey MIC mismatch for {sta_addr} in {bssid}"),
        );
        return;
    }
    if let Some(key_data) = decrypt_key_data(key, &ptk.kek) {
        install_group_keys(rt, bssid, key, &key_data);
    }
}
