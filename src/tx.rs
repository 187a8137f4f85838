//! Frame protection for injection: take a plaintext 802.11 frame, pick the
//! right installed key for its addressing, assign the next packet number on
//! the transmit counter, and emit the protected frame ready to send.

use crate::cipher::Cipher;
use crate::devices::TdlsState;
use crate::frame::{Dot11Header, DsMode, FrameType, TID_NON_QOS, FC_PROTECTED};
use crate::ie::IE_MME;
use crate::pn::Pn;
use crate::runtime::SleuthRuntime;
use crate::status::MessageType;

/// Protect a plaintext frame with the appropriate installed key. Group
/// management frames get an MME appended; everything else gets the
/// Protected bit and a cipher header.
pub fn protect_frame(rt: &mut SleuthRuntime, frame: &[u8]) -> Result<Vec<u8>, String> {
    let hdr = Dot11Header::parse(frame)?;
    let out = match hdr.fc.ftype() {
        FrameType::Management if hdr.addr1.is_group() => protect_group_mgmt(rt, &hdr, frame)?,
        FrameType::Management => {
            let (cipher, tk, pn) = unicast_key(rt, &hdr, TID_NON_QOS)?;
            seal(&hdr, frame, cipher, &tk, pn, 0)?
        }
        FrameType::Data => {
            if hdr.ds_mode() == DsMode::Direct {
                if let Some((tk, pn)) = tdls_key(rt, &hdr) {
                    seal(&hdr, frame, Cipher::Ccmp, &tk, pn, 0)?
                } else {
                    let (cipher, tk, pn) = unicast_key(rt, &hdr, hdr.tid())?;
                    seal(&hdr, frame, cipher, &tk, pn, 0)?
                }
            } else if hdr.addr1.is_group() {
                let (cipher, tk, pn, key_id) = group_key(rt, &hdr)?;
                seal(&hdr, frame, cipher, &tk, pn, key_id)?
            } else {
                let (cipher, tk, pn) = unicast_key(rt, &hdr, hdr.tid())?;
                seal(&hdr, frame, cipher, &tk, pn, 0)?
            }
        }
        _ => return Err("cannot protect control frames".to_string()),
    };
    rt.counters.injected += 1;
    rt.log(
        MessageType::Trace,
        format!("protected injected frame to {}", hdr.addr1),
    );
    Ok(out)
}

/// Encrypt the body and reassemble the frame with the Protected bit set.
fn seal(
    hdr: &Dot11Header,
    frame: &[u8],
    cipher: Cipher,
    tk: &[u8],
    pn: Pn,
    key_id: u8,
) -> Result<Vec<u8>, String> {
    let mut sealed_hdr = hdr.clone();
    sealed_hdr.fc.0 |= FC_PROTECTED;
    let body = cipher
        .encrypt(tk, &sealed_hdr, &frame[hdr.hdr_len..], pn, key_id)
        .map_err(|e| format!("{cipher} encryption failed: {e}"))?;
    let mut out = frame[..hdr.hdr_len].to_vec();
    out[0..2].copy_from_slice(&sealed_hdr.fc.0.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn unicast_key(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    slot: usize,
) -> Result<(Cipher, Vec<u8>, Pn), String> {
    let bssid = hdr.bssid();
    let sta_addr = hdr.station_addr();
    let from_sta = hdr.addr2 != bssid;
    let sta = rt
        .store
        .get_sta_mut(&bssid, &sta_addr)
        .ok_or_else(|| format!("no station record for {sta_addr}"))?;
    let ptk = sta
        .ptk
        .as_ref()
        .ok_or_else(|| format!("no PTK known for {sta_addr}"))?;
    let cipher = sta.pairwise_cipher.unwrap_or(match ptk.tk.len() {
        32 => Cipher::Tkip,
        _ => Cipher::Ccmp,
    });
    let tk = ptk.tk.clone();
    let counter = if from_sta {
        &mut sta.tx_tods[slot]
    } else {
        &mut sta.tx_fromds[slot]
    };
    Ok((cipher, tk, counter.next_pn()))
}

fn tdls_key(rt: &mut SleuthRuntime, hdr: &Dot11Header) -> Option<(Vec<u8>, Pn)> {
    let slot = hdr.tid();
    let link = rt.store.tdls.iter_mut().find(|l| {
        l.state == TdlsState::LinkUp
            && l.tpk.is_some()
            && ((l.init == hdr.addr2 && l.resp == hdr.addr1)
                || (l.init == hdr.addr1 && l.resp == hdr.addr2))
    })?;
    let tk = link.tpk.as_ref()?.tk.to_vec();
    Some((tk, link.tx[slot].next_pn()))
}

fn group_key(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
) -> Result<(Cipher, Vec<u8>, Pn, u8), String> {
    let bssid = hdr.bssid();
    let bss = rt
        .store
        .get_bss_mut(&bssid)
        .ok_or_else(|| format!("no BSS record for {bssid}"))?;
    for (i, slot) in bss.gtk.iter_mut().enumerate() {
        if let Some(group) = slot.as_mut() {
            return Ok((
                group.cipher,
                group.tk.clone(),
                group.tx.next_pn(),
                i as u8,
            ));
        }
    }
    Err(format!("no GTK installed for {bssid}"))
}

fn protect_group_mgmt(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    frame: &[u8],
) -> Result<Vec<u8>, String> {
    let bssid = hdr.bssid();
    let bss = rt
        .store
        .get_bss_mut(&bssid)
        .ok_or_else(|| format!("no BSS record for {bssid}"))?;
    let (key_id, cipher, igtk, ipn) = bss
        .igtk
        .iter_mut()
        .enumerate()
        .find_map(|(i, slot)| {
            slot.as_mut()
                .map(|group| (i as u16, group.cipher, group.tk.clone(), group.tx.next_pn()))
        })
        .ok_or_else(|| format!("no IGTK installed for {bssid}"))?;

    let mic_len = cipher.mic_len();
    let mut out = frame.to_vec();
    out.push(IE_MME);
    out.push((2 + 6 + mic_len) as u8);
    out.extend_from_slice(&key_id.to_le_bytes());
    out.extend_from_slice(&ipn.to_le_bytes());
    let mic_offset = out.len();
    out.extend_from_slice(&vec![0u8; mic_len]);

    let mic = cipher
        .bip_mic(&igtk, hdr, &out[hdr.hdr_len..], ipn)
        .map_err(|e| format!("{cipher} MIC failed: {e}"))?;
    out[mic_offset..].copy_from_slice(&mic);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arguments;
    use crate::devices::GroupKey;
    use crate::engine;
    use crate::frame::MacAddress;
    use crate::kdf::{Ptk, Tpk};

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    fn runtime() -> SleuthRuntime {
        SleuthRuntime::new(&Arguments::default()).unwrap()
    }

    fn install_ptk(rt: &mut SleuthRuntime, tk: &[u8]) {
        let mut raw = vec![0x55; 32];
        raw.extend_from_slice(tk);
        let bss = rt.store.get_or_insert_bss(mac(1)).unwrap();
        bss.get_or_insert_sta(mac(2)).ptk = Ptk::from_raw(&raw);
    }

    fn plaintext_qos_data() -> Vec<u8> {
        let fc: u16 = 0x0088 | crate::frame::FC_TO_DS;
        let mut frame = vec![0u8; 26];
        frame[0..2].copy_from_slice(&fc.to_le_bytes());
        frame[4..10].copy_from_slice(&mac(1).0);
        frame[10..16].copy_from_slice(&mac(2).0);
        frame[16..22].copy_from_slice(&mac(1).0);
        frame.extend_from_slice(b"\xaa\xaa\x03\x00\x00\x00\x08\x00payload");
        frame
    }

    #[test]
    fn protected_data_frame_decrypts_back_through_the_engine() {
        let mut rt = runtime();
        let tk: Vec<u8> = (0..16).collect();
        install_ptk(&mut rt, &tk);
        let plain = plaintext_qos_data();
        let sealed = protect_frame(&mut rt, &plain).unwrap();
        assert_ne!(sealed[hdr_len(&plain)..], plain[hdr_len(&plain)..]);

        let hdr = Dot11Header::parse(&sealed).unwrap();
        assert!(hdr.fc.protected());
        let decrypted = engine::decrypt_unicast(&mut rt, &hdr, &sealed[hdr.hdr_len..]).unwrap();
        assert_eq!(decrypted, plain[hdr.hdr_len..]);
    }

    fn hdr_len(frame: &[u8]) -> usize {
        Dot11Header::parse(frame).unwrap().hdr_len
    }

    #[test]
    fn transmit_counter_advances_per_frame() {
        let mut rt = runtime();
        install_ptk(&mut rt, &(0..16).collect::<Vec<u8>>());
        let plain = plaintext_qos_data();
        let a = protect_frame(&mut rt, &plain).unwrap();
        let b = protect_frame(&mut rt, &plain).unwrap();
        let off = hdr_len(&plain);
        let pn = |f: &[u8]| crate::ccmp::parse_header(&f[off..]).unwrap().pn;
        assert_eq!(pn(&a), Pn::new(1));
        assert_eq!(pn(&b), Pn::new(2));
        assert_eq!(rt.counters.injected, 2);
    }

    #[test]
    fn group_mgmt_frame_gets_a_verifiable_mme() {
        let mut rt = runtime();
        {
            let bss = rt.store.get_or_insert_bss(mac(1)).unwrap();
            bss.igtk[4] = Some(GroupKey::new(Cipher::BipCmac128, (0..16).collect()));
        }
        let fc: u16 = 0x00c0; // deauth
        let mut frame = vec![0u8; 24];
        frame[0..2].copy_from_slice(&fc.to_le_bytes());
        frame[4..10].copy_from_slice(&MacAddress::BROADCAST.0);
        frame[10..16].copy_from_slice(&mac(1).0);
        frame[16..22].copy_from_slice(&mac(1).0);
        frame.extend_from_slice(&[7, 0]); // reason

        let sealed = protect_frame(&mut rt, &frame).unwrap();
        let hdr = Dot11Header::parse(&sealed).unwrap();
        assert_eq!(
            engine::verify_group_mgmt(&mut rt, &hdr, &sealed[hdr.hdr_len..]),
            Some(true)
        );
    }

    #[test]
    fn tdls_frames_use_the_tpk() {
        let mut rt = runtime();
        let tpk = Tpk {
            kck: [1; 16],
            tk: [2; 16],
        };
        {
            let link = rt.store.get_or_insert_tdls(mac(1), mac(2), mac(3));
            link.state = TdlsState::LinkUp;
            link.tpk = Some(tpk);
        }
        let fc: u16 = 0x0088; // QoS data, direct
        let mut frame = vec![0u8; 26];
        frame[0..2].copy_from_slice(&fc.to_le_bytes());
        frame[4..10].copy_from_slice(&mac(3).0);
        frame[10..16].copy_from_slice(&mac(2).0);
        frame[16..22].copy_from_slice(&mac(1).0);
        frame.extend_from_slice(b"\xaa\xaa\x03\x00\x00\x00\x08\x00direct");

        let sealed = protect_frame(&mut rt, &frame).unwrap();
        let hdr = Dot11Header::parse(&sealed).unwrap();
        let decrypted = engine::decrypt_tdls(&mut rt, &hdr, &sealed[hdr.hdr_len..]).unwrap();
        assert_eq!(decrypted, frame[hdr.hdr_len..]);
    }

    #[test]
    fn missing_keys_are_an_error() {
        let mut rt = runtime();
        assert!(protect_frame(&mut rt, &plaintext_qos_data()).is_err());
    }
}
