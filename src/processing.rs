//! Frame dispatch: FCS validation, MAC header parsing, and routing into the
//! management tracker, the decryption engine, and the EAPOL/TDLS handlers.

use crate::devices::StaState;
use crate::eapol;
use crate::engine;
use crate::frame::{
    parse_amsdu, parse_llc_snap, strip_mesh_control, Dot11Header, DsMode, FrameType, MacAddress,
    ETHERTYPE_EAPOL, ETHERTYPE_TDLS, STYPE_ACTION, STYPE_ASSOC_REQ, STYPE_ASSOC_RESP, STYPE_AUTH,
    STYPE_BEACON, STYPE_DEAUTH, STYPE_DISASSOC, STYPE_PROBE_RESP, STYPE_REASSOC_REQ,
    STYPE_REASSOC_RESP,
};
use crate::ie::{find_ie, parse_rsn_ie, IE_MESH_ID, IE_RSN, IE_SSID};
use crate::runtime::SleuthRuntime;
use crate::status::MessageType;
use crate::tdls;

/// Process one captured 802.11 frame. `fcs_present` says whether the last
/// four bytes are the frame check sequence.
pub fn process_frame(
    rt: &mut SleuthRuntime,
    frame: &[u8],
    fcs_present: bool,
) -> Result<(), String> {
    rt.counters.frames += 1;

    let data = if fcs_present {
        if frame.len() < 4 {
            return Err("frame shorter than its FCS".to_string());
        }
        let (body, fcs) = frame.split_at(frame.len() - 4);
        let expected = u32::from_le_bytes(fcs.try_into().unwrap_or([0; 4]));
        if crc32fast::hash(body) != expected {
            rt.counters.fcs_failures += 1;
            rt.log(MessageType::Trace, "dropping frame with bad FCS".to_string());
            return Ok(());
        }
        body
    } else {
        frame
    };

    let hdr = Dot11Header::parse(data)?;
    match hdr.fc.ftype() {
        FrameType::Management => rx_mgmt(rt, &hdr, &data[hdr.hdr_len..]),
        FrameType::Data => rx_data(rt, &hdr, data),
        FrameType::Control | FrameType::Extension => Ok(()),
    }
}

/// IEs of a beacon or probe response start after the fixed timestamp,
/// interval, and capability fields.
const BEACON_IES_OFFSET: usize = 12;

fn rx_mgmt(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Result<(), String> {
    match hdr.fc.subtype() {
        STYPE_BEACON | STYPE_PROBE_RESP => rx_beacon(rt, hdr, body),
        STYPE_ASSOC_REQ => rx_assoc_req(rt, hdr, body.get(4..).unwrap_or(&[])),
        STYPE_REASSOC_REQ => rx_assoc_req(rt, hdr, body.get(10..).unwrap_or(&[])),
        STYPE_ASSOC_RESP | STYPE_REASSOC_RESP => rx_assoc_resp(rt, hdr, body),
        STYPE_AUTH => rx_auth(rt, hdr),
        STYPE_DEAUTH | STYPE_DISASSOC => rx_deauth_disassoc(rt, hdr, body),
        STYPE_ACTION => rx_action(rt, hdr, body),
        _ => Ok(()),
    }
}

fn rx_beacon(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Result<(), String> {
    let bssid = hdr.bssid();
    let ies = body.get(BEACON_IES_OFFSET..).unwrap_or(&[]);
    if let Some(ssid) = find_ie(ies, IE_SSID) {
        if !ssid.is_empty() {
            rt.store.learn_ssid(bssid, ssid);
        }
    }
    let rsn = find_ie(ies, IE_RSN).and_then(|payload| parse_rsn_ie(payload).ok());
    let mesh = find_ie(ies, IE_MESH_ID).is_some();
    if let Some(bss) = rt.store.get_or_insert_bss(bssid) {
        if let Some(rsn) = rsn {
            bss.rsn = Some(rsn);
        }
        if mesh {
            bss.mesh = true;
        }
    }
    Ok(())
}

fn rx_assoc_req(rt: &mut SleuthRuntime, hdr: &Dot11Header, ies: &[u8]) -> Result<(), String> {
    let bssid = hdr.bssid();
    let sta_addr = hdr.sa();
    let rsn = find_ie(ies, IE_RSN).and_then(|payload| parse_rsn_ie(payload).ok());
    if let Some(bss) = rt.store.get_or_insert_bss(bssid) {
        let bss_ext_key_id = bss
            .rsn
            .as_ref()
            .map(|rsn| rsn.extended_key_id())
            .unwrap_or(false);
        let sta = bss.get_or_insert_sta(sta_addr);
        if let Some(rsn) = rsn {
            sta.pairwise_cipher = rsn.pairwise_ciphers.first().copied();
            sta.extended_key_id = bss_ext_key_id && rsn.extended_key_id();
            sta.rsn = Some(rsn);
        }
    }
    Ok(())
}

fn rx_assoc_resp(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Result<(), String> {
    let status = body
        .get(2..4)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .unwrap_or(1);
    if status != 0 {
        return Ok(());
    }
    let bssid = hdr.bssid();
    let sta_addr = hdr.da();
    if let Some(bss) = rt.store.get_or_insert_bss(bssid) {
        bss.get_or_insert_sta(sta_addr).state = StaState::AuthAssoc;
    }
    Ok(())
}

fn rx_auth(rt: &mut SleuthRuntime, hdr: &Dot11Header) -> Result<(), String> {
    let bssid = hdr.bssid();
    let sta_addr = if hdr.addr2 == bssid { hdr.da() } else { hdr.sa() };
    if sta_addr.is_group() {
        return Ok(());
    }
    if let Some(bss) = rt.store.get_or_insert_bss(bssid) {
        let sta = bss.get_or_insert_sta(sta_addr);
        if sta.state == StaState::NotAuth {
            sta.state = StaState::Auth;
        }
    }
    Ok(())
}

fn rx_deauth_disassoc(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    body: &[u8],
) -> Result<(), String> {
    let bssid = hdr.bssid();
    let disassoc = hdr.fc.subtype() == STYPE_DISASSOC;

    if hdr.addr1.is_group() {
        // Group-addressed robust management frames must carry an MME when
        // the BSS negotiated MFP; per-station state is left alone either way.
        engine::verify_group_mgmt(rt, hdr, body);
        return Ok(());
    }

    if hdr.fc.protected() {
        if engine::decrypt_unicast(rt, hdr, body).is_none() {
            return Ok(());
        }
    } else {
        let mfp = rt
            .store
            .get_bss(&bssid)
            .map(|bss| bss.mfp_required())
            .unwrap_or(false);
        if mfp {
            rt.log(
                MessageType::Warning,
                format!(
                    "unprotected {} from {} despite MFP",
                    if disassoc { "disassociation" } else { "deauthentication" },
                    hdr.addr2
                ),
            );
            if rt.strict {
                return Ok(());
            }
        }
    }

    let sta_addr = hdr.station_addr();
    if sta_addr.is_group() {
        return Ok(());
    }
    if let Some(sta) = rt.store.get_sta_mut(&bssid, &sta_addr) {
        sta.state = if disassoc {
            StaState::Auth
        } else {
            StaState::NotAuth
        };
    }
    Ok(())
}

fn rx_action(rt: &mut SleuthRuntime, hdr: &Dot11Header, body: &[u8]) -> Result<(), String> {
    if hdr.addr1.is_group() {
        engine::verify_group_mgmt(rt, hdr, body);
        return Ok(());
    }
    if hdr.fc.protected() {
        engine::decrypt_unicast(rt, hdr, body);
    }
    Ok(())
}

fn rx_data(rt: &mut SleuthRuntime, hdr: &Dot11Header, data: &[u8]) -> Result<(), String> {
    if hdr.fc.is_null_data() {
        return Ok(());
    }

    // Per-TID traffic accounting happens before any decrypt attempt, so
    // frames we cannot decrypt are still counted.
    let sta_addr = hdr.station_addr();
    if !sta_addr.is_group() {
        let from_sta = match hdr.ds_mode() {
            DsMode::ToDs => true,
            DsMode::FromDs => false,
            _ => hdr.addr2 != hdr.bssid(),
        };
        let tid = hdr.tid();
        if let Some(bss) = rt.store.get_or_insert_bss(hdr.bssid()) {
            let sta = bss.get_or_insert_sta(sta_addr);
            if from_sta {
                sta.tx_tid[tid] += 1;
            } else {
                sta.rx_tid[tid] += 1;
            }
        }
    }

    let body = &data[hdr.hdr_len..];

    let plaintext;
    let msdu: &[u8] = if hdr.fc.protected() {
        let decrypted = match hdr.ds_mode() {
            DsMode::Direct => engine::decrypt_tdls(rt, hdr, body)
                .or_else(|| engine::decrypt_unicast(rt, hdr, body)),
            _ if hdr.addr1.is_group() => engine::decrypt_group_data(rt, hdr, body),
            _ => engine::decrypt_unicast(rt, hdr, body),
        };
        match decrypted {
            Some(pt) => {
                if rt.collect_decrypted {
                    let mut rebuilt = data[..hdr.hdr_len].to_vec();
                    rebuilt[1] &= !((crate::frame::FC_PROTECTED >> 8) as u8);
                    rebuilt.extend_from_slice(&pt);
                    rt.decrypted_frames.push((rt.frame_ts, rebuilt));
                }
                plaintext = pt;
                &plaintext
            }
            None => return Ok(()),
        }
    } else {
        body
    };

    let mesh = rt
        .store
        .get_bss(&hdr.bssid())
        .map(|bss| bss.mesh)
        .unwrap_or(false);

    if hdr.amsdu() {
        let subframes = parse_amsdu(msdu);
        let frames: Vec<(MacAddress, MacAddress, Vec<u8>)> = subframes
            .iter()
            .map(|sub| (sub.sa, sub.da, sub.payload.to_vec()))
            .collect();
        for (sa, da, payload) in frames {
            rx_msdu(rt, hdr, sa, da, &payload);
        }
        return Ok(());
    }

    let msdu = if mesh {
        match strip_mesh_control(msdu) {
            Some(stripped) => stripped,
            None => return Ok(()),
        }
    } else {
        msdu
    };
    let owned = msdu.to_vec();
    rx_msdu(rt, hdr, hdr.sa(), hdr.da(), &owned);
    Ok(())
}

fn rx_msdu(
    rt: &mut SleuthRuntime,
    hdr: &Dot11Header,
    sa: MacAddress,
    da: MacAddress,
    msdu: &[u8],
) {
    let Some((ethertype, payload)) = parse_llc_snap(msdu) else {
        return;
    };
    let result = match ethertype {
        ETHERTYPE_EAPOL => eapol::rx_eapol(rt, hdr.bssid(), sa, da, payload),
        ETHERTYPE_TDLS => tdls::rx_tdls(rt, payload),
        _ => Ok(()),
    };
    if let Err(e) = result {
        rt.log(
            MessageType::Warning,
            format!("failed to handle {ethertype:#06x} payload from {sa}: {e}"),
        );
    }
}
