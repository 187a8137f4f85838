//! TDLS setup tracking: parse the encapsulated action frames, derive the
//! TPK from the exchanged nonces, verify the FTIE MICs, and drive the
//! per-link state machine the direct-path decrypter keys off.

use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::devices::TdlsState;
use crate::frame::MacAddress;
use crate::ie::{find_ie_full, FtIe, LinkIdentifier, IE_FT, IE_LINK_ID, IE_RSN, IE_TIMEOUT_INTERVAL};
use crate::kdf::derive_tpk;
use crate::runtime::SleuthRuntime;
use crate::status::MessageType;

pub const TDLS_PAYLOAD_TYPE: u8 = 2;
pub const CATEGORY_TDLS: u8 = 12;

pub const ACTION_SETUP_REQUEST: u8 = 0;
pub const ACTION_SETUP_RESPONSE: u8 = 1;
pub const ACTION_SETUP_CONFIRM: u8 = 2;
pub const ACTION_TEARDOWN: u8 = 3;

/// FTIE MIC location within the full element (id, len, mic control, MIC).
const FTIE_MIC_START: usize = 4;
const FTIE_MIC_END: usize = 20;

/// MIC over a TDLS setup response (transaction 2) or confirm (transaction
/// 3): initiator and responder addresses, the transaction number, then the
/// Link Identifier, RSN, Timeout Interval, and FT elements in full, with
/// the FTIE MIC field zeroed.
pub fn calc_setup_mic(
    kck: &[u8; 16],
    init: &MacAddress,
    resp: &MacAddress,
    trans_seq: u8,
    lnkid_full: &[u8],
    rsn_full: &[u8],
    timeout_full: &[u8],
    ftie_full: &[u8],
) -> Option<[u8; 16]> {
    if ftie_full.len() < FTIE_MIC_END {
        return None;
    }
    let mut mac = Cmac::<Aes128>::new_from_slice(kck).ok()?;
    mac.update(&init.0);
    mac.update(&resp.0);
    mac.update(&[trans_seq]);
    mac.update(lnkid_full);
    mac.update(rsn_full);
    mac.update(timeout_full);
    let mut ftie = ftie_full.to_vec();
    ftie[FTIE_MIC_START..FTIE_MIC_END].fill(0);
    mac.update(&ftie);
    Some(mac.finalize().into_bytes().into())
}

/// MIC over a teardown (transaction 4): the Link Identifier in full, the
/// reason code, dialog token, transaction number, then the zeroed FTIE.
pub fn calc_teardown_mic(
    kck: &[u8; 16],
    lnkid_full: &[u8],
    reason: u16,
    dialog_token: u8,
    ftie_full: &[u8],
) -> Option<[u8; 16]> {
    if ftie_full.len() < FTIE_MIC_END {
        return None;
    }
    let mut mac = Cmac::<Aes128>::new_from_slice(kck).ok()?;
    mac.update(lnkid_full);
    mac.update(&reason.to_le_bytes());
    mac.update(&[dialog_token]);
    mac.update(&[4u8]);
    let mut ftie = ftie_full.to_vec();
    ftie[FTIE_MIC_START..FTIE_MIC_END].fill(0);
    mac.update(&ftie);
    Some(mac.finalize().into_bytes().into())
}

struct SetupIes<'a> {
    lnkid: LinkIdentifier,
    lnkid_full: &'a [u8],
    rsn_full: Option<&'a [u8]>,
    timeout_full: Option<&'a [u8]>,
    ftie: Option<FtIe>,
    ftie_full: Option<&'a [u8]>,
}

fn parse_setup_ies(ies: &[u8]) -> Option<SetupIes<'_>> {
    let lnkid_full = find_ie_full(ies, IE_LINK_ID)?;
    let lnkid = LinkIdentifier::parse(&lnkid_full[2..])?;
    let ftie_full = find_ie_full(ies, IE_FT);
    Some(SetupIes {
        lnkid,
        lnkid_full,
        rsn_full: find_ie_full(ies, IE_RSN),
        timeout_full: find_ie_full(ies, IE_TIMEOUT_INTERVAL),
        ftie: ftie_full.and_then(|f| FtIe::parse(&f[2..])),
        ftie_full,
    })
}

/// Entry point for a TDLS frame: the LLC payload after the 0x890d
/// ethertype, starting at the payload type byte.
pub fn rx_tdls(rt: &mut SleuthRuntime, payload: &[u8]) -> Result<(), String> {
    if payload.len() < 3 {
        return Err("TDLS frame truncated".to_string());
    }
    if payload[0] != TDLS_PAYLOAD_TYPE {
        return Err(format!("unexpected TDLS payload type {}", payload[0]));
    }
    if payload[1] != CATEGORY_TDLS {
        return Err(format!("unexpected TDLS category {}", payload[1]));
    }
    rt.counters.tdls_actions += 1;
    let action = payload[2];
    let rest = &payload[3..];
    match action {
        ACTION_SETUP_REQUEST => rx_setup_request(rt, rest),
        ACTION_SETUP_RESPONSE => rx_setup_response(rt, rest),
        ACTION_SETUP_CONFIRM => rx_setup_confirm(rt, rest),
        ACTION_TEARDOWN => rx_teardown(rt, rest),
        other => {
            rt.log(
                MessageType::Trace,
                format!("ignoring TDLS action {other}"),
            );
            Ok(())
        }
    }
}

fn rx_setup_request(rt: &mut SleuthRuntime, data: &[u8]) -> Result<(), String> {
    // Dialog token, capability, then IEs.
    if data.len() < 3 {
        return Err("TDLS setup request truncated".to_string());
    }
    let dialog_token = data[0];
    let ies = &data[3..];
    let Some(setup) = parse_setup_ies(ies) else {
        return Err("TDLS setup request without Link Identifier".to_string());
    };
    let snonce = setup.ftie.as_ref().map(|f| f.snonce);
    let lnkid = setup.lnkid;
    let link = rt
        .store
        .get_or_insert_tdls(lnkid.bssid, lnkid.initiator, lnkid.responder);
    link.state = TdlsState::Pending;
    link.dialog_token = dialog_token;
    link.snonce = snonce;
    link.anonce = None;
    link.tpk = None;
    rt.log(
        MessageType::Info,
        format!(
            "TDLS setup request {} -> {} (token {dialog_token})",
            lnkid.initiator, lnkid.responder
        ),
    );
    Ok(())
}

fn rx_setup_response(rt: &mut SleuthRuntime, data: &[u8]) -> Result<(), String> {
    if data.len() < 3 {
        return Err("TDLS setup response truncated".to_string());
    }
    let status = u16::from_le_bytes([data[0], data[1]]);
    let dialog_token = data[2];
    if status != 0 {
        fail_by_dialog_token(rt, dialog_token, status);
        return Ok(());
    }
    if data.len() < 5 {
        return Err("TDLS setup response truncated".to_string());
    }
    let ies = &data[5..];
    let Some(setup) = parse_setup_ies(ies) else {
        return Err("TDLS setup response without Link Identifier".to_string());
    };
    let lnkid = setup.lnkid;
    let Some(ftie) = setup.ftie.as_ref() else {
        rt.log(
            MessageType::Warning,
            format!(
                "TDLS setup response {} -> {} without FTIE",
                lnkid.responder, lnkid.initiator
            ),
        );
        return Ok(());
    };

    let tpk = derive_tpk(
        &ftie.snonce,
        &ftie.anonce,
        &lnkid.initiator,
        &lnkid.responder,
        &lnkid.bssid,
    );

    let mut mic_ok = None;
    if let (Some(rsn), Some(timeout), Some(ftie_full)) =
        (setup.rsn_full, setup.timeout_full, setup.ftie_full)
    {
        let computed = calc_setup_mic(
            &tpk.kck,
            &lnkid.initiator,
            &lnkid.responder,
            2,
            setup.lnkid_full,
            rsn,
            timeout,
            ftie_full,
        );
        mic_ok = computed.map(|m| m == ftie.mic);
    }
    match mic_ok {
        Some(true) => rt.log(
            MessageType::Info,
            format!(
                "TDLS setup response MIC valid {} -> {}",
                lnkid.responder, lnkid.initiator
            ),
        ),
        Some(false) => rt.log(
            MessageType::Warning,
            format!(
                "TDLS setup response MIC mismatch {} -> {}",
                lnkid.responder, lnkid.initiator
            ),
        ),
        None => rt.log(
            MessageType::Trace,
            format!(
                "TDLS setup response {} -> {} missing elements for MIC check",
                lnkid.responder, lnkid.initiator
            ),
        ),
    }
    if rt.strict && mic_ok == Some(false) {
        return Ok(());
    }

    let anonce = ftie.anonce;
    let snonce = ftie.snonce;
    let link = rt
        .store
        .get_or_insert_tdls(lnkid.bssid, lnkid.initiator, lnkid.responder);
    link.dialog_token = dialog_token;
    link.anonce = Some(anonce);
    link.snonce = Some(snonce);
    link.tpk = Some(tpk);
    link.state = TdlsState::PendingConfirm;
    Ok(())
}

fn rx_setup_confirm(rt: &mut SleuthRuntime, data: &[u8]) -> Result<(), String> {
    if data.len() < 3 {
        return Err("TDLS setup confirm truncated".to_string());
    }
    let status = u16::from_le_bytes([data[0], data[1]]);
    let dialog_token = data[2];
    if status != 0 {
        fail_by_dialog_token(rt, dialog_token, status);
        return Ok(());
    }
    let ies = &data[3..];
    let Some(setup) = parse_setup_ies(ies) else {
        return Err("TDLS setup confirm without Link Identifier".to_string());
    };
    let lnkid = setup.lnkid;

    let kck = rt
        .store
        .tdls_link_mut(&lnkid.bssid, &lnkid.initiator, &lnkid.responder)
        .and_then(|link| link.tpk.as_ref().map(|tpk| tpk.kck));
    let Some(kck) = kck else {
        rt.log(
            MessageType::Warning,
            format!(
                "TDLS setup confirm {} -> {} with no pending link",
                lnkid.initiator, lnkid.responder
            ),
        );
        return Ok(());
    };

    let mut mic_ok = None;
    if let (Some(rsn), Some(timeout), Some(ftie_full), Some(ftie)) = (
        setup.rsn_full,
        setup.timeout_full,
        setup.ftie_full,
        setup.ftie.as_ref(),
    ) {
        let computed = calc_setup_mic(
            &kck,
            &lnkid.initiator,
            &lnkid.responder,
            3,
            setup.lnkid_full,
            rsn,
            timeout,
            ftie_full,
        );
        mic_ok = computed.map(|m| m == ftie.mic);
    }
    if mic_ok == Some(false) {
        rt.log(
            MessageType::Warning,
            format!(
                "TDLS setup confirm MIC mismatch {} -> {}",
                lnkid.initiator, lnkid.responder
            ),
        );
        if rt.strict {
            return Ok(());
        }
    }

    if let Some(link) =
        rt.store
            .tdls_link_mut(&lnkid.bssid, &lnkid.initiator, &lnkid.responder)
    {
        link.state = TdlsState::LinkUp;
        link.reset_replay_counters();
    }
    rt.store
        .prune_reverse_tdls(&lnkid.bssid, &lnkid.initiator, &lnkid.responder);
    rt.log(
        MessageType::Info,
        format!(
            "TDLS link up {} <-> {}",
            lnkid.initiator, lnkid.responder
        ),
    );
    Ok(())
}

fn rx_teardown(rt: &mut SleuthRuntime, data: &[u8]) -> Result<(), String> {
    if data.len() < 2 {
        return Err("TDLS teardown truncated".to_string());
    }
    let reason = u16::from_le_bytes([data[0], data[1]]);
    let ies = &data[2..];
    let Some(setup) = parse_setup_ies(ies) else {
        return Err("TDLS teardown without Link Identifier".to_string());
    };
    let lnkid = setup.lnkid;

    let link_info = rt
        .store
        .tdls_link_between_mut(&lnkid.initiator, &lnkid.responder)
        .map(|link| (link.dialog_token, link.tpk.as_ref().map(|tpk| tpk.kck)));
    let Some((dialog_token, kck)) = link_info else {
        rt.log(
            MessageType::Trace,
            format!(
                "TDLS teardown for unknown link {} <-> {}",
                lnkid.initiator, lnkid.responder
            ),
        );
        return Ok(());
    };

    if let (Some(kck), Some(ftie_full), Some(ftie)) =
        (kck, setup.ftie_full, setup.ftie.as_ref())
    {
        let computed =
            calc_teardown_mic(&kck, setup.lnkid_full, reason, dialog_token, ftie_full);
        if computed.map(|m| m == ftie.mic) == Some(false) {
            rt.log(
                MessageType::Warning,
                format!(
                    "TDLS teardown MIC mismatch {} <-> {}",
                    lnkid.initiator, lnkid.responder
                ),
            );
            if rt.strict {
                return Ok(());
            }
        }
    }

    if let Some(link) = rt
        .store
        .tdls_link_between_mut(&lnkid.initiator, &lnkid.responder)
    {
        link.state = TdlsState::NoLink;
        link.tpk = None;
        link.reset_replay_counters();
    }
    rt.log(
        MessageType::Info,
        format!(
            "TDLS teardown {} <-> {} (reason {reason})",
            lnkid.initiator, lnkid.responder
        ),
    );
    Ok(())
}

/// A nonzero status code carries no Link Identifier we can trust, so the
/// pending link is found through the dialog token instead.
fn fail_by_dialog_token(rt: &mut SleuthRuntime, dialog_token: u8, status: u16) {
    let mut found = None;
    for link in rt.store.tdls.iter_mut() {
        if link.dialog_token == dialog_token
            && matches!(link.state, TdlsState::Pending | TdlsState::PendingConfirm)
        {
            link.state = TdlsState::NoLink;
            link.tpk = None;
            found = Some((link.init, link.resp));
            break;
        }
    }
    match found {
        Some((init, resp)) => rt.log(
            MessageType::Info,
            format!("TDLS setup failed for {init} -> {resp} (status {status})"),
        ),
        None => rt.log(
            MessageType::Trace,
            format!("TDLS failure status {status} with unknown dialog token {dialog_token}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arguments;
    use crate::kdf::Tpk;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    fn runtime() -> SleuthRuntime {
        SleuthRuntime::new(&Arguments::default()).unwrap()
    }

    fn lnkid_ie(bssid: MacAddress, init: MacAddress, resp: MacAddress) -> Vec<u8> {
        let mut ie = vec![IE_LINK_ID, 18];
        ie.extend_from_slice(&bssid.0);
        ie.extend_from_slice(&init.0);
        ie.extend_from_slice(&resp.0);
        ie
    }

    fn rsn_ie() -> Vec<u8> {
        let mut ie = vec![IE_RSN, 20];
        ie.extend_from_slice(&1u16.to_le_bytes());
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 7]); // group: no group traffic
        ie.extend_from_slice(&1u16.to_le_bytes());
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 4]);
        ie.extend_from_slice(&1u16.to_le_bytes());
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 7]); // TDLS AKM
        ie.extend_from_slice(&0u16.to_le_bytes());
        ie
    }

    fn timeout_ie() -> Vec<u8> {
        let mut ie = vec![IE_TIMEOUT_INTERVAL, 5, 2];
        ie.extend_from_slice(&3600u32.to_le_bytes());
        ie
    }

    fn ftie(anonce: &[u8; 32], snonce: &[u8; 32], mic: &[u8; 16]) -> Vec<u8> {
        let mut ie = vec![IE_FT, 82];
        ie.extend_from_slice(&0u16.to_le_bytes());
        ie.extend_from_slice(mic);
        ie.extend_from_slice(anonce);
        ie.extend_from_slice(snonce);
        ie
    }

    fn setup_request(token: u8, ies: &[Vec<u8>]) -> Vec<u8> {
        let mut frame = vec![TDLS_PAYLOAD_TYPE, CATEGORY_TDLS, ACTION_SETUP_REQUEST];
        frame.push(token);
        frame.extend_from_slice(&[0, 0]); // capability
        for ie in ies {
            frame.extend_from_slice(ie);
        }
        frame
    }

    fn setup_response(status: u16, token: u8, ies: &[Vec<u8>]) -> Vec<u8> {
        let mut frame = vec![TDLS_PAYLOAD_TYPE, CATEGORY_TDLS, ACTION_SETUP_RESPONSE];
        frame.extend_from_slice(&status.to_le_bytes());
        frame.push(token);
        frame.extend_from_slice(&[0, 0]); // capability
        for ie in ies {
            frame.extend_from_slice(ie);
        }
        frame
    }

    fn setup_confirm(status: u16, token: u8, ies: &[Vec<u8>]) -> Vec<u8> {
        let mut frame = vec![TDLS_PAYLOAD_TYPE, CATEGORY_TDLS, ACTION_SETUP_CONFIRM];
        frame.extend_from_slice(&status.to_le_bytes());
        frame.push(token);
        for ie in ies {
            frame.extend_from_slice(ie);
        }
        frame
    }

    struct Exchange {
        bssid: MacAddress,
        init: MacAddress,
        resp: MacAddress,
        anonce: [u8; 32],
        snonce: [u8; 32],
        tpk: Tpk,
    }

    impl Exchange {
        fn new() -> Self {
            let bssid = mac(1);
            let init = mac(2);
            let resp = mac(3);
            let anonce = [0xaa; 32];
            let snonce = [0xbb; 32];
            let tpk = derive_tpk(&snonce, &anonce, &init, &resp, &bssid);
            Exchange {
                bssid,
                init,
                resp,
                anonce,
                snonce,
                tpk,
            }
        }

        fn signed_ies(&self, trans_seq: u8) -> Vec<Vec<u8>> {
            let lnkid = lnkid_ie(self.bssid, self.init, self.resp);
            let rsn = rsn_ie();
            let timeout = timeout_ie();
            let unsigned = ftie(&self.anonce, &self.snonce, &[0; 16]);
            let mic = calc_setup_mic(
                &self.tpk.kck,
                &self.init,
                &self.resp,
                trans_seq,
                &lnkid,
                &rsn,
                &timeout,
                &unsigned,
            )
            .unwrap();
            vec![lnkid, rsn, timeout, ftie(&self.anonce, &self.snonce, &mic)]
        }
    }

    fn run_setup(rt: &mut SleuthRuntime, ex: &Exchange) {
        let req_ies = vec![
            lnkid_ie(ex.bssid, ex.init, ex.resp),
            rsn_ie(),
            timeout_ie(),
            ftie(&[0; 32], &ex.snonce, &[0; 16]),
        ];
        rx_tdls(rt, &setup_request(7, &req_ies)).unwrap();
        rx_tdls(rt, &setup_response(0, 7, &ex.signed_ies(2))).unwrap();
        rx_tdls(rt, &setup_confirm(0, 7, &ex.signed_ies(3))).unwrap();
    }

    #[test]
    fn full_setup_reaches_link_up_with_derived_tpk() {
        let mut rt = runtime();
        let ex = Exchange::new();
        run_setup(&mut rt, &ex);
        let link = rt
            .store
            .tdls_link_mut(&ex.bssid, &ex.init, &ex.resp)
            .unwrap();
        assert_eq!(link.state, TdlsState::LinkUp);
        assert_eq!(link.tpk, Some(ex.tpk));
        assert!(rt.status_log.contains("TDLS link up"));
        assert!(!rt.status_log.contains("MIC mismatch"));
    }

    #[test]
    fn flipped_mic_byte_is_reported() {
        let mut rt = runtime();
        let ex = Exchange::new();
        let req_ies = vec![
            lnkid_ie(ex.bssid, ex.init, ex.resp),
            rsn_ie(),
            timeout_ie(),
            ftie(&[0; 32], &ex.snonce, &[0; 16]),
        ];
        rx_tdls(&mut rt, &setup_request(7, &req_ies)).unwrap();
        let mut ies = ex.signed_ies(2);
        ies[3][FTIE_MIC_START] ^= 1;
        rx_tdls(&mut rt, &setup_response(0, 7, &ies)).unwrap();
        assert!(rt.status_log.contains("setup response MIC mismatch"));
    }

    #[test]
    fn confirm_prunes_the_reverse_direction_link() {
        let mut rt = runtime();
        let ex = Exchange::new();
        // A stale half-open link in the other direction.
        rt.store.get_or_insert_tdls(ex.bssid, ex.resp, ex.init);
        run_setup(&mut rt, &ex);
        assert_eq!(rt.store.tdls.len(), 1);
        assert_eq!(rt.store.tdls[0].init, ex.init);

        // Re-running the confirm is idempotent.
        rx_tdls(&mut rt, &setup_confirm(0, 7, &ex.signed_ies(3))).unwrap();
        assert_eq!(rt.store.tdls.len(), 1);
        assert_eq!(rt.store.tdls[0].state, TdlsState::LinkUp);
    }

    #[test]
    fn teardown_brings_the_link_down() {
        let mut rt = runtime();
        let ex = Exchange::new();
        run_setup(&mut rt, &ex);

        let lnkid = lnkid_ie(ex.bssid, ex.init, ex.resp);
        let reason = 3u16;
        let unsigned = ftie(&ex.anonce, &ex.snonce, &[0; 16]);
        let mic = calc_teardown_mic(&ex.tpk.kck, &lnkid, reason, 7, &unsigned).unwrap();
        let mut frame = vec![TDLS_PAYLOAD_TYPE, CATEGORY_TDLS, ACTION_TEARDOWN];
        frame.extend_from_slice(&reason.to_le_bytes());
        frame.extend_from_slice(&lnkid);
        frame.extend_from_slice(&ftie(&ex.anonce, &ex.snonce, &mic));
        rx_tdls(&mut rt, &frame).unwrap();

        let link = rt
            .store
            .tdls_link_mut(&ex.bssid, &ex.init, &ex.resp)
            .unwrap();
        assert_eq!(link.state, TdlsState::NoLink);
        assert!(link.tpk.is_none());
    }

    #[test]
    fn nonzero_status_fails_the_pending_link_by_dialog_token() {
        let mut rt = runtime();
        let ex = Exchange::new();
        let req_ies = vec![
            lnkid_ie(ex.bssid, ex.init, ex.resp),
            ftie(&[0; 32], &ex.snonce, &[0; 16]),
        ];
        rx_tdls(&mut rt, &setup_request(9, &req_ies)).unwrap();
        rx_tdls(&mut rt, &setup_response(37, 9, &[])).unwrap();
        let link = rt
            .store
            .tdls_link_mut(&ex.bssid, &ex.init, &ex.resp)
            .unwrap();
        assert_eq!(link.state, TdlsState::NoLink);
        assert!(rt.status_log.contains("status 37"));
    }
}
