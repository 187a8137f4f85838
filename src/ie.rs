//! Information element parsing: RSN security parameters plus the handful of
//! elements the TDLS and BIP paths need (Link Identifier, Timeout Interval,
//! FT, MME).

use crate::cipher::Cipher;
use crate::frame::MacAddress;

pub const IE_SSID: u8 = 0;
pub const IE_RSN: u8 = 48;
pub const IE_FT: u8 = 55;
pub const IE_TIMEOUT_INTERVAL: u8 = 56;
pub const IE_MME: u8 = 76;
pub const IE_LINK_ID: u8 = 101;
pub const IE_MESH_ID: u8 = 114;

const RSN_OUI: [u8; 3] = [0x00, 0x0f, 0xac];

/// Iterator over (id, payload) pairs in an IE blob. Truncated trailing
/// elements are silently dropped (malformed input is never fatal).
pub struct IeIter<'a> {
    data: &'a [u8],
}

impl<'a> IeIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        IeIter { data }
    }
}

impl<'a> Iterator for IeIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 2 {
            return None;
        }
        let id = self.data[0];
        let len = self.data[1] as usize;
        if self.data.len() < 2 + len {
            return None;
        }
        let payload = &self.data[2..2 + len];
        self.data = &self.data[2 + len..];
        Some((id, payload))
    }
}

pub fn find_ie(data: &[u8], id: u8) -> Option<&[u8]> {
    IeIter::new(data).find(|(i, _)| *i == id).map(|(_, p)| p)
}

/// Like `find_ie` but returns the element including its two-byte header,
/// which the TDLS MIC AADs are computed over.
pub fn find_ie_full(data: &[u8], id: u8) -> Option<&[u8]> {
    let mut rest = data;
    while rest.len() >= 2 {
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            return None;
        }
        if rest[0] == id {
            return Some(&rest[..2 + len]);
        }
        rest = &rest[2 + len..];
    }
    None
}

/// RSN AKM suite (00-0F-AC selector type).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Akm {
    Dot1x,
    Psk,
    FtDot1x,
    FtPsk,
    Dot1xSha256,
    PskSha256,
    Tdls,
    Sae,
    FtSae,
    Other(u8),
}

impl Akm {
    pub fn from_selector(suite_type: u8) -> Self {
        match suite_type {
            1 => Akm::Dot1x,
            2 => Akm::Psk,
            3 => Akm::FtDot1x,
            4 => Akm::FtPsk,
            5 => Akm::Dot1xSha256,
            6 => Akm::PskSha256,
            7 => Akm::Tdls,
            8 => Akm::Sae,
            9 => Akm::FtSae,
            other => Akm::Other(other),
        }
    }

    /// Whether PTK derivation uses KDF-SHA256 instead of the SHA1 PRF.
    pub fn uses_sha256(&self) -> bool {
        !matches!(self, Akm::Dot1x | Akm::Psk)
    }
}

fn cipher_from_selector(suite: &[u8]) -> Option<Cipher> {
    if suite.len() != 4 || suite[0..3] != RSN_OUI {
        return None;
    }
    match suite[3] {
        1 | 5 => Some(Cipher::Wep),
        2 => Some(Cipher::Tkip),
        4 => Some(Cipher::Ccmp),
        6 => Some(Cipher::BipCmac128),
        8 => Some(Cipher::Gcmp),
        9 => Some(Cipher::Gcmp256),
        10 => Some(Cipher::Ccmp256),
        11 => Some(Cipher::BipGmac128),
        12 => Some(Cipher::BipGmac256),
        13 => Some(Cipher::BipCmac256),
        _ => None,
    }
}

/// Negotiated security parameters from an RSN IE.
#[derive(Clone, Debug, Default)]
pub struct RsnInfo {
    pub group_cipher: Option<Cipher>,
    pub pairwise_ciphers: Vec<Cipher>,
    pub akms: Vec<Akm>,
    pub capabilities: u16,
    pub group_mgmt_cipher: Option<Cipher>,
}

impl RsnInfo {
    pub fn mfp_capable(&self) -> bool {
        self.capabilities & 0x0080 != 0
    }

    pub fn mfp_required(&self) -> bool {
        self.capabilities & 0x0040 != 0
    }

    pub fn extended_key_id(&self) -> bool {
        self.capabilities & 0x2000 != 0
    }
}

/// Parse the payload of an RSN IE. Elements cut short after a complete
/// field are accepted with defaults, matching the tool's preference for
/// extracting whatever a damaged capture still carries.
pub fn parse_rsn_ie(data: &[u8]) -> Result<RsnInfo, String> {
    if data.len() < 2 {
        return Err("RSN IE too short".to_string());
    }
    let version = u16::from_le_bytes([data[0], data[1]]);
    if version != 1 {
        return Err(format!("Unsupported RSN version {}", version));
    }
    let mut info = RsnInfo::default();
    let mut pos = 2;

    if data.len() < pos + 4 {
        return Ok(info);
    }
    info.group_cipher = cipher_from_selector(&data[pos..pos + 4]);
    pos += 4;

    if data.len() < pos + 2 {
        return Ok(info);
    }
    let pairwise_count = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    for _ in 0..pairwise_count {
        if data.len() < pos + 4 {
            return Ok(info);
        }
        if let Some(cipher) = cipher_from_selector(&data[pos..pos + 4]) {
            info.pairwise_ciphers.push(cipher);
        }
        pos += 4;
    }

    if data.len() < pos + 2 {
        return Ok(info);
    }
    let akm_count = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    for _ in 0..akm_count {
        if data.len() < pos + 4 {
            return Ok(info);
        }
        if data[pos..pos + 3] == RSN_OUI {
            info.akms.push(Akm::from_selector(data[pos + 3]));
        }
        pos += 4;
    }

    if data.len() >= pos + 2 {
        info.capabilities = u16::from_le_bytes([data[pos], data[pos + 1]]);
        pos += 2;
    }

    // Optional PMKID list, then optional group management cipher.
    if data.len() >= pos + 2 {
        let pmkid_count = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2 + pmkid_count * 16;
        if data.len() >= pos + 4 {
            info.group_mgmt_cipher = cipher_from_selector(&data[pos..pos + 4]);
        }
    }

    Ok(info)
}

/// TDLS Link Identifier element: which BSS the link lives in and who the
/// initiator/responder are. Transition keying is based on this, not on the
/// frame's own addressing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkIdentifier {
    pub bssid: MacAddress,
    pub initiator: MacAddress,
    pub responder: MacAddress,
}

impl LinkIdentifier {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 18 {
            return None;
        }
        Some(LinkIdentifier {
            bssid: MacAddress::from_slice(&payload[0..6])?,
            initiator: MacAddress::from_slice(&payload[6..12])?,
            responder: MacAddress::from_slice(&payload[12..18])?,
        })
    }
}

/// FT element as used by TDLS: MIC plus both nonces.
#[derive(Clone, Debug)]
pub struct FtIe {
    pub mic_control: u16,
    pub mic: [u8; 16],
    pub anonce: [u8; 32],
    pub snonce: [u8; 32],
}

impl FtIe {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 82 {
            return None;
        }
        Some(FtIe {
            mic_control: u16::from_le_bytes([payload[0], payload[1]]),
            mic: payload[2..18].try_into().ok()?,
            anonce: payload[18..50].try_into().ok()?,
            snonce: payload[50..82].try_into().ok()?,
        })
    }

    /// Offset of the MIC within the element payload (after the two
    /// MIC Control bytes), used to zero it for MIC computation.
    pub const MIC_OFFSET: usize = 2;
}

/// Management MIC element (BIP).
#[derive(Clone, Debug)]
pub struct Mme {
    pub key_id: u16,
    pub ipn: [u8; 6],
    pub mic: Vec<u8>,
}

impl Mme {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 16 {
            return None;
        }
        let mic = payload[8..].to_vec();
        if mic.len() != 8 && mic.len() != 16 {
            return None;
        }
        Some(Mme {
            key_id: u16::from_le_bytes([payload[0], payload[1]]),
            ipn: payload[2..8].try_into().ok()?,
            mic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rsn() -> Vec<u8> {
        let mut ie = Vec::new();
        ie.extend_from_slice(&1u16.to_le_bytes()); // version
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 4]); // group CCMP
        ie.extend_from_slice(&2u16.to_le_bytes()); // pairwise count
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 4]);
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 9]);
        ie.extend_from_slice(&1u16.to_le_bytes()); // akm count
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 2]);
        ie.extend_from_slice(&0x00c0u16.to_le_bytes()); // MFPC | MFPR
        ie.extend_from_slice(&0u16.to_le_bytes()); // pmkid count
        ie.extend_from_slice(&[0x00, 0x0f, 0xac, 6]); // BIP-CMAC-128
        ie
    }

    #[test]
    fn rsn_parse_full() {
        let info = parse_rsn_ie(&sample_rsn()).unwrap();
        assert_eq!(info.group_cipher, Some(Cipher::Ccmp));
        assert_eq!(
            info.pairwise_ciphers,
            vec![Cipher::Ccmp, Cipher::Gcmp256]
        );
        assert_eq!(info.akms, vec![Akm::Psk]);
        assert!(info.mfp_capable() && info.mfp_required());
        assert!(!info.extended_key_id());
        assert_eq!(info.group_mgmt_cipher, Some(Cipher::BipCmac128));
    }

    #[test]
    fn rsn_parse_truncated() {
        let ie = &sample_rsn()[..8];
        let info = parse_rsn_ie(ie).unwrap();
        assert_eq!(info.group_cipher, Some(Cipher::Ccmp));
        assert!(info.pairwise_ciphers.is_empty());
    }

    #[test]
    fn ie_iteration_drops_truncated_tail() {
        let blob = [0u8, 2, 0xaa, 0xbb, 48, 10, 1, 2];
        let ies: Vec<(u8, &[u8])> = IeIter::new(&blob).collect();
        assert_eq!(ies.len(), 1);
        assert_eq!(ies[0].0, 0);
        assert!(find_ie(&blob, 48).is_none());
        assert_eq!(find_ie_full(&blob, 0).unwrap(), &[0u8, 2, 0xaa, 0xbb]);
    }

    #[test]
    fn link_identifier_parse() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1u8; 6]);
        payload.extend_from_slice(&[2u8; 6]);
        payload.extend_from_slice(&[3u8; 6]);
        let lnkid = LinkIdentifier::parse(&payload).unwrap();
        assert_eq!(lnkid.bssid, MacAddress([1u8; 6]));
        assert_eq!(lnkid.initiator, MacAddress([2u8; 6]));
        assert_eq!(lnkid.responder, MacAddress([3u8; 6]));
        assert!(LinkIdentifier::parse(&payload[..17]).is_none());
    }

    #[test]
    fn mme_parse() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u16.to_le_bytes());
        payload.extend_from_slice(&[9u8; 6]);
        payload.extend_from_slice(&[0u8; 8]);
        let mme = Mme::parse(&payload).unwrap();
        assert_eq!(mme.key_id, 4);
        assert_eq!(mme.mic.len(), 8);
    }
}
