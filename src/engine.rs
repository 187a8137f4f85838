//! Key trial and replay engine.
//!
//! Every protected frame runs the same two-phase scheme: build an ordered
//! candidate key list from the store without touching any state, try the
//! pure codec against each candidate, and only then apply side effects
//! (counter advancement, TPTK promotion, trial-key adoption) for the one
//! that worked. A frame no candidate decrypts leaves the store exactly as
//! it found it, apart from the duplicate-tolerance flag.

use crate::bip;
use crate::cipher::Cipher;
use crate::devices::TdlsState;
use crate::frame::{Dot11Header, DsMode, FrameType, MacAddress, TID_NON_QOS};
use crate::ie::Mme;
use crate::kdf::Ptk;
use crate::pn::Pn;
use crate::runtime::SleuthRuntime;
use crate::status::MessageType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource {
    Ptk,
    Tptk,
    Trial,
    ZeroTk,
    Gtk(u8),
    Igtk(u16),
    Tpk,
    Wep,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Ptk => write!(f, "PTK"),
            KeySource::Tptk => write!(f, "TPTK"),
            KeySource::Trial => write!(f, "trial PTK"),
            KeySource::ZeroTk => write!(f, "all-zero TK"),
            KeySource::Gtk(id) => write!(f, "GTK[{id}]"),
            KeySource::Igtk(id) => write!(f, "IGTK[{id}]"),
            KeySource::Tpk => write!(f, "TPK"),
            KeySource::Wep => write!(f, "WEP key"),
        }
    }
}

/// Guess the pairwise cipher from the protected frame body when neither the
/// association nor the RSN IE told us. ExtIV set with the TKIP WEPSeed
/// relation in byte 1 means TKIP, ExtIV without it CCMP, no ExtIV WEP.
pub fn guess_cipher(body: &[u8]) -> Cipher {
    if body.len() >= 8 && body[3] & 0x20 != 0 {
        if body[1] == (body[0] | 0x20) & 0x7f {
            Cipher::Tkip
        } else {
            Cipher::Ccmp
        }
    } else {
        Cipher::Wep
    }
}

struct Candidate {
    source: KeySource,
    tk: Vec<u8>,
    ptk: Option<Ptk>,
}

/// Decrypt an individually addressed protected data or robust management
/// frame between a station and its AP.
pub fn decrypt_unicast(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Option<Vec<u8>> {
    let bssid = hdr.bssid();
    let sta_addr = hdr.station_addr();
    if sta_addr.is_group() {
        return None;
    }
    let is_mgmt = hdr.fc.ftype() == FrameType::Management;
    // Direction is from the station when it transmitted the frame.
    let from_sta = match hdr.ds_mode() {
        DsMode::ToDs => true,
        DsMode::FromDs => false,
        _ => hdr.addr2 != bssid,
    };

    let (cipher, ext_key_id, allow_dup, counter_current) = {
        let bss = rt.store.get_or_insert_bss(bssid)?;
        let bss_pairwise = bss
            .rsn
            .as_ref()
            .and_then(|rsn| rsn.pairwise_ciphers.first().copied());
        let sta = bss.get_or_insert_sta(sta_addr);
        let cipher = sta
            .pairwise_cipher
            .or(bss_pairwise)
            .unwrap_or_else(|| guess_cipher(body));
        let slot = if is_mgmt { TID_NON_QOS } else { hdr.tid() };
        let counter = if from_sta {
            &sta.rx_tods[slot]
        } else {
            &sta.rx_fromds[slot]
        };
        (cipher, sta.extended_key_id, sta.allow_duplicate, *counter)
    };

    if cipher == Cipher::Wep {
        return decrypt_unicast_wep(rt, hdr, body);
    }

    let prot = match cipher.parse_header(body) {
        Ok(prot) => prot,
        Err(e) => {
            rt.counters.decrypt_failures += 1;
            rt.log(
                MessageType::Trace,
                format!("{cipher} header unusable from {}: {e}", hdr.addr2),
            );
            return None;
        }
    };

    if !prot.ext_iv {
        // TKIP and the CCMP/GCMP families all require ExtIV.
        rt.log(
            MessageType::Warning,
            format!("ExtIV not set in {cipher} frame from {}", hdr.addr2),
        );
        if rt.strict {
            return None;
        }
    }
    if prot.key_id != 0 {
        let acceptable = ext_key_id && prot.key_id == 1;
        if !acceptable {
            rt.log(
                MessageType::Warning,
                format!(
                    "unexpected key ID {} on individually addressed frame from {}",
                    prot.key_id, hdr.addr2
                ),
            );
            if rt.strict {
                return None;
            }
        }
    }
    if !prot.reserved_ok {
        rt.log(
            MessageType::Warning,
            format!("reserved cipher header bits set in frame from {}", hdr.addr2),
        );
        if rt.strict {
            return None;
        }
    }

    let duplicate = allow_dup && counter_current.current() == Some(prot.pn);
    if counter_current.is_replay(prot.pn) && !duplicate {
        rt.counters.replays += 1;
        rt.log(
            MessageType::Warning,
            format!(
                "replay detected from {} (PN {} not above {})",
                hdr.addr2,
                prot.pn,
                counter_current
                    .current()
                    .map(|pn| pn.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        );
        if rt.strict {
            return None;
        }
    }

    let candidates = unicast_candidates(rt, &bssid, &sta_addr, cipher);
    let mut hit: Option<(KeySource, Option<Ptk>, Vec<u8>)> = None;
    for cand in &candidates {
        if let Ok(plaintext) = cipher.decrypt(&cand.tk, hdr, body) {
            hit = Some((cand.source.clone(), cand.ptk.clone(), plaintext));
            break;
        }
    }

    let slot = if is_mgmt { TID_NON_QOS } else { hdr.tid() };
    match hit {
        Some((source, adopted, plaintext)) => {
            rt.counters.decrypted += 1;
            if let Some(sta) = rt.store.get_sta_mut(&bssid, &sta_addr) {
                match source {
                    KeySource::Tptk => sta.promote_tptk(),
                    KeySource::Trial => sta.ptk = adopted,
                    _ => {}
                }
                let counter = if from_sta {
                    &mut sta.rx_tods[slot]
                } else {
                    &mut sta.rx_fromds[slot]
                };
                counter.advance(prot.pn);
                sta.allow_duplicate = false;
            }
            rt.log(
                MessageType::Trace,
                format!("decrypted {cipher} frame from {} using {source}", hdr.addr2),
            );
            Some(plaintext)
        }
        None => {
            rt.counters.decrypt_failures += 1;
            if let Some(sta) = rt.store.get_sta_mut(&bssid, &sta_addr) {
                sta.allow_duplicate = true;
            }
            rt.log(
                MessageType::Trace,
                format!(
                    "unable to decrypt {cipher} frame from {} ({} candidate keys)",
                    hdr.addr2,
                    candidates.len()
                ),
            );
            None
        }
    }
}

fn unicast_candidates(
    rt: &SleuthRuntime,
    bssid: &MacAddress,
    sta_addr: &MacAddress,
    cipher: Cipher,
) -> Vec<Candidate> {
    let tk_len = cipher.tk_len();
    let mut out = Vec::new();
    let sta = rt
        .store
        .get_bss(bssid)
        .and_then(|bss| bss.stations.get(sta_addr));
    if let Some(ptk) = sta.and_then(|s| s.ptk.as_ref()) {
        if tk_len == Some(ptk.tk.len()) {
            out.push(Candidate {
                source: KeySource::Ptk,
                tk: ptk.tk.clone(),
                ptk: None,
            });
        }
    }
    if let Some(tptk) = sta.and_then(|s| s.tptk.as_ref()) {
        if tk_len == Some(tptk.tk.len()) {
            out.push(Candidate {
                source: KeySource::Tptk,
                tk: tptk.tk.clone(),
                ptk: None,
            });
        }
    }
    for ptk in &rt.store.ptks {
        if tk_len == Some(ptk.tk.len()) {
            out.push(Candidate {
                source: KeySource::Trial,
                tk: ptk.tk.clone(),
                ptk: Some(ptk.clone()),
            });
        }
    }
    // Last resort when no pairwise key is known from any source: some
    // implementations leak frames protected with an all-zero TK.
    if out.is_empty() {
        if let Some(len) = tk_len {
            out.push(Candidate {
                source: KeySource::ZeroTk,
                tk: vec![0; len],
                ptk: None,
            });
        }
    }
    out
}

fn decrypt_unicast_wep(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    body: &[u8],
) -> Option<Vec<u8>> {
    let keys = rt.store.wep_keys.clone();
    for key in &keys {
        if let Ok(plaintext) = Cipher::Wep.decrypt(key, hdr, body) {
            rt.counters.decrypted += 1;
            rt.log(
                MessageType::Trace,
                format!("decrypted frame from {} using {}", hdr.addr2, KeySource::Wep),
            );
            return Some(plaintext);
        }
    }
    rt.counters.decrypt_failures += 1;
    rt.log(
        MessageType::Trace,
        format!(
            "unable to decrypt WEP frame from {} ({} keys tried)",
            hdr.addr2,
            keys.len()
        ),
    );
    None
}

/// Decrypt a group-addressed data frame using the GTK slot selected by the
/// frame's key ID.
pub fn decrypt_group_data(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    body: &[u8],
) -> Option<Vec<u8>> {
    let bssid = hdr.bssid();
    if body.len() < 4 {
        return None;
    }
    // Key ID byte sits at the same offset for WEP, TKIP, and CCMP/GCMP.
    let key_id = body[3] >> 6;
    let ext_iv = body[3] & 0x20 != 0;

    if !ext_iv {
        // WEP-protected group frame, no replay state to keep.
        return decrypt_unicast_wep(rt, hdr, body);
    }

    let (cipher, tk, counter) = {
        let bss = rt.store.get_bss(&bssid)?;
        let group = match bss.gtk[key_id as usize & 0x03].as_ref() {
            Some(group) => group,
            None => {
                rt.log(
                    MessageType::Trace,
                    format!("no GTK[{key_id}] known for {bssid}"),
                );
                rt.counters.decrypt_failures += 1;
                return None;
            }
        };
        (group.cipher, group.tk.clone(), group.rx)
    };

    let prot = cipher.parse_header(body).ok()?;
    if counter.is_replay(prot.pn) {
        rt.counters.replays += 1;
        rt.log(
            MessageType::Warning,
            format!(
                "group frame replay from {bssid} (PN {} not above {})",
                prot.pn,
                counter
                    .current()
                    .map(|pn| pn.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        );
        if rt.strict {
            return None;
        }
    }

    match cipher.decrypt(&tk, hdr, body) {
        Ok(plaintext) => {
            rt.counters.decrypted += 1;
            if let Some(bss) = rt.store.get_bss_mut(&bssid) {
                if let Some(group) = bss.gtk[key_id as usize & 0x03].as_mut() {
                    group.rx.advance(prot.pn);
                }
            }
            rt.log(
                MessageType::Trace,
                format!(
                    "decrypted group {cipher} frame from {bssid} using {}",
                    KeySource::Gtk(key_id)
                ),
            );
            Some(plaintext)
        }
        Err(_) => {
            rt.counters.decrypt_failures += 1;
            rt.log(
                MessageType::Trace,
                format!("unable to decrypt group frame from {bssid} with GTK[{key_id}]"),
            );
            None
        }
    }
}

/// Locate the Management MME at the tail of a robust group-addressed
/// management frame body. Returns (mme, mic offset in body).
fn find_mme(body: &[u8]) -> Option<(Mme, usize)> {
    for mic_len in [8usize, 16] {
        let full = 2 + 2 + 6 + mic_len;
        if body.len() < full {
            continue;
        }
        let start = body.len() - full;
        if body[start] == crate::ie::IE_MME && body[start + 1] as usize == full - 2 {
            let mme = Mme::parse(&body[start + 2..])?;
            return Some((mme, body.len() - mic_len));
        }
    }
    None
}

/// Verify BIP protection on a group-addressed robust management frame.
/// Returns None when there is no MME or no matching IGTK to check against.
pub fn verify_group_mgmt(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    body: &[u8],
) -> Option<bool> {
    let bssid = hdr.bssid();
    let (mme, mic_offset) = match find_mme(body) {
        Some(found) => found,
        None => {
            let mfp = rt
                .store
                .get_bss(&bssid)
                .map(|bss| bss.mfp_required())
                .unwrap_or(false);
            if mfp {
                rt.log(
                    MessageType::Warning,
                    format!("unprotected group management frame from {bssid} despite MFP"),
                );
            }
            return None;
        }
    };

    let slot = mme.key_id as usize & 0x07;
    let (cipher, igtk, counter) = {
        let bss = rt.store.get_bss(&bssid)?;
        let group = match bss.igtk[slot].as_ref() {
            Some(group) => group,
            None => {
                rt.log(
                    MessageType::Trace,
                    format!("no IGTK[{}] known for {bssid}", mme.key_id),
                );
                return None;
            }
        };
        (group.cipher, group.tk.clone(), group.rx)
    };
    if cipher.mic_len() != mme.mic.len() {
        rt.log(
            MessageType::Warning,
            format!(
                "MME MIC length {} does not match {cipher} for {bssid}",
                mme.mic.len()
            ),
        );
        return Some(false);
    }

    let ipn = Pn::from_le_bytes(&mme.ipn);
    if counter.is_replay(ipn) {
        rt.counters.replays += 1;
        rt.log(
            MessageType::Warning,
            format!(
                "BIP replay from {bssid} (IPN {ipn} not above {})",
                counter
                    .current()
                    .map(|pn| pn.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        );
        if rt.strict {
            return Some(false);
        }
    }

    let valid = bip::verify(cipher, &igtk, hdr, body, mic_offset, &mme.mic, ipn).ok()?;
    if valid {
        if let Some(bss) = rt.store.get_bss_mut(&bssid) {
            if let Some(group) = bss.igtk[slot].as_mut() {
                group.rx.advance(ipn);
            }
        }
        rt.log(
            MessageType::Trace,
            format!(
                "verified {cipher} protection from {bssid} using {}",
                KeySource::Igtk(mme.key_id)
            ),
        );
    } else {
        rt.counters.decrypt_failures += 1;
        rt.log(
            MessageType::Warning,
            format!("BIP MIC mismatch on group management frame from {bssid}"),
        );
    }
    Some(valid)
}

/// Decrypt a TDLS direct-link data frame. Returns None when no usable link
/// exists between the two peers, letting the caller fall back to the
/// infrastructure path.
pub fn decrypt_tdls(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Option<Vec<u8>> {
    let src = hdr.addr2;
    let dst = hdr.addr1;
    let idx = rt.store.tdls.iter().position(|l| {
        l.tpk.is_some()
            && l.state != TdlsState::NoLink
            && ((l.init == src && l.resp == dst) || (l.init == dst && l.resp == src))
    })?;
    let link = &rt.store.tdls[idx];
    let tk = link.tpk.as_ref()?.tk;
    let from_init = link.init == src;
    let slot = hdr.tid();
    let counter = if from_init {
        link.rx_init_to_resp[slot]
    } else {
        link.rx_resp_to_init[slot]
    };

    let cipher = Cipher::Ccmp;
    let prot = cipher.parse_header(body).ok()?;
    if counter.is_replay(prot.pn) {
        rt.counters.replays += 1;
        rt.log(
            MessageType::Warning,
            format!(
                "TDLS replay from {src} (PN {} not above {})",
                prot.pn,
                counter
                    .current()
                    .map(|pn| pn.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        );
        if rt.strict {
            return None;
        }
    }

    match cipher.decrypt(&tk, hdr, body) {
        Ok(plaintext) => {
            rt.counters.decrypted += 1;
            let link = &mut rt.store.tdls[idx];
            let counter = if from_init {
                &mut link.rx_init_to_resp[slot]
            } else {
                &mut link.rx_resp_to_init[slot]
            };
            counter.advance(prot.pn);
            rt.log(
                MessageType::Trace,
                format!("decrypted TDLS frame {src} -> {dst} using {}", KeySource::Tpk),
            );
            Some(plaintext)
        }
        Err(_) => {
            rt.counters.decrypt_failures += 1;
            rt.log(
                MessageType::Trace,
                format!("unable to decrypt TDLS frame {src} -> {dst}"),
            );
            None
        }
    }
}
