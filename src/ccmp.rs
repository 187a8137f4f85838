//! CCMP and CCMP-256: AES-CCM with the 802.11 AAD/nonce construction.
//!
//! The AAD/nonce builder and the extended-IV header codec live here and are
//! shared with the GCMP codec, which uses the identical AAD and a 12-byte
//! variant of the nonce.

use aes::{Aes128, Aes256};
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U16, U8};
use ccm::Ccm;

use crate::cipher::{CryptoError, ProtectedHeader};
use crate::frame::{Dot11Header, FrameType, FC_MORE_DATA, FC_ORDER, FC_PROTECTED, FC_PWR_MGT, FC_RETRY};
use crate::pn::Pn;

type Ccmp128 = Ccm<Aes128, U8, U13>;
type Ccmp256 = Ccm<Aes256, U16, U13>;

/// Build the AAD and 13-byte CCM nonce for a frame. The frame control word
/// is masked per the 802.11 AAD rules (subtype bits of data frames, retry /
/// power-management / more-data, order bit of QoS frames) with the
/// Protected bit forced on; the sequence counter keeps only its fragment
/// number. Management frames set the nonce management flag instead of a
/// priority.
pub(crate) fn build_aad_nonce(hdr: &Dot11Header, pn: Pn) -> (Vec<u8>, [u8; 13]) {
    let mut fc = hdr.fc.0;
    let mut nonce_flags = 0u8;

    match hdr.fc.ftype() {
        FrameType::Data => {
            fc &= !0x0070; // mask subtype bits
            if hdr.qos.is_some() {
                nonce_flags = hdr.tid() as u8 & 0x0f;
                fc &= !FC_ORDER;
            }
        }
        FrameType::Management => nonce_flags = 0x10,
        _ => {}
    }
    fc &= !(FC_RETRY | FC_PWR_MGT | FC_MORE_DATA);
    fc |= FC_PROTECTED;

    let mut aad = Vec::with_capacity(30);
    aad.extend_from_slice(&fc.to_le_bytes());
    aad.extend_from_slice(&hdr.addr1.0);
    aad.extend_from_slice(&hdr.addr2.0);
    aad.extend_from_slice(&hdr.addr3.0);
    aad.extend_from_slice(&(hdr.seq_ctrl & 0x000f).to_le_bytes());
    if let Some(a4) = hdr.addr4 {
        aad.extend_from_slice(&a4.0);
    }
    if let Some(qc) = hdr.qos {
        // QoS Control with everything but the TID zeroed.
        aad.extend_from_slice(&[(qc & 0x000f) as u8, 0]);
    }

    let mut nonce = [0u8; 13];
    nonce[0] = nonce_flags;
    nonce[1..7].copy_from_slice(&hdr.addr2.0);
    nonce[7..13].copy_from_slice(&pn.to_be_bytes());
    (aad, nonce)
}

/// Parse the 8-byte extended-IV header shared by CCMP and GCMP.
pub fn parse_header(body: &[u8]) -> Result<ProtectedHeader, CryptoError> {
    if body.len() < 8 {
        return Err(CryptoError::TooShort);
    }
    let pn = u64::from(body[0])
        | u64::from(body[1]) << 8
        | u64::from(body[4]) << 16
        | u64::from(body[5]) << 24
        | u64::from(body[6]) << 32
        | u64::from(body[7]) << 40;
    Ok(ProtectedHeader {
        pn: Pn::new(pn),
        key_id: body[3] >> 6,
        ext_iv: body[3] & 0x20 != 0,
        reserved_ok: body[2] == 0 && body[3] & 0x1f == 0,
    })
}

pub(crate) fn write_header(pn: Pn, key_id: u8) -> [u8; 8] {
    let b = pn.to_le_bytes();
    [
        b[0],
        b[1],
        0,
        0x20 | (key_id & 0x03) << 6,
        b[2],
        b[3],
        b[4],
        b[5],
    ]
}

/// Decrypt a CCMP frame body (8-byte header + ciphertext + MIC). The key
/// length selects CCMP (16) or CCMP-256 (32).
pub fn decrypt(tk: &[u8], hdr: &Dot11Header, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mic_len = match tk.len() {
        16 => 8,
        32 => 16,
        other => return Err(CryptoError::KeyLength(other)),
    };
    if body.len() < 8 + mic_len {
        return Err(CryptoError::TooShort);
    }
    let prot = parse_header(body)?;
    let (aad, nonce) = build_aad_nonce(hdr, prot.pn);
    let payload = Payload {
        msg: &body[8..],
        aad: &aad,
    };
    let result = match tk.len() {
        16 => Ccmp128::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .decrypt((&nonce).into(), payload),
        _ => Ccmp256::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .decrypt((&nonce).into(), payload),
    };
    result.map_err(|_| CryptoError::Integrity)
}

/// Encrypt a plaintext MSDU under CCMP/CCMP-256 for the given PN.
pub fn encrypt(
    tk: &[u8],
    hdr: &Dot11Header,
    plaintext: &[u8],
    pn: Pn,
    key_id: u8,
) -> Result<Vec<u8>, CryptoError> {
    if tk.len() != 16 && tk.len() != 32 {
        return Err(CryptoError::KeyLength(tk.len()));
    }
    let (aad, nonce) = build_aad_nonce(hdr, pn);
    let payload = Payload {
        msg: plaintext,
        aad: &aad,
    };
    let ct = match tk.len() {
        16 => Ccmp128::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .encrypt((&nonce).into(), payload),
        _ => Ccmp256::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .encrypt((&nonce).into(), payload),
    }
    .map_err(|_| CryptoError::Integrity)?;

    let mut out = Vec::with_capacity(8 + ct.len());
    out.extend_from_slice(&write_header(pn, key_id));
    out.extend_from_slice(&ct);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FC_TO_DS;

    fn qos_header() -> Dot11Header {
        let fc: u16 = 0x0088 | FC_TO_DS;
        let mut bytes = vec![0u8; 26];
        bytes[0..2].copy_from_slice(&fc.to_le_bytes());
        bytes[4..10].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        bytes[10..16].copy_from_slice(&[0x02, 0, 0, 0, 0, 2]);
        bytes[16..22].copy_from_slice(&[0x02, 0, 0, 0, 0, 3]);
        bytes[22..24].copy_from_slice(&0x1230u16.to_le_bytes());
        bytes[24] = 0x06;
        Dot11Header::parse(&bytes).unwrap()
    }

    #[test]
    fn header_codec_round_trip() {
        let pn = Pn::new(0x0123_4567_89ab);
        let header = write_header(pn, 1);
        let prot = parse_header(&header).unwrap();
        assert_eq!(prot.pn, pn);
        assert_eq!(prot.key_id, 1);
        assert!(prot.ext_iv);
        assert!(prot.reserved_ok);
    }

    #[test]
    fn reserved_bits_flagged() {
        let mut header = write_header(Pn::new(1), 0);
        header[2] = 0xff;
        assert!(!parse_header(&header).unwrap().reserved_ok);
    }

    #[test]
    fn aad_masks_mutable_bits() {
        let hdr = qos_header();
        let mut retry_hdr = hdr.clone();
        retry_hdr.fc.0 |= FC_RETRY;
        retry_hdr.seq_ctrl = 0x9990;
        let (aad_a, nonce_a) = build_aad_nonce(&hdr, Pn::new(42));
        let (aad_b, nonce_b) = build_aad_nonce(&retry_hdr, Pn::new(42));
        // Retry bit and sequence number must not affect the AAD.
        assert_eq!(aad_a, aad_b);
        assert_eq!(nonce_a, nonce_b);
        assert_eq!(nonce_a[0], 6); // TID in the priority slot
    }

    #[test]
    fn round_trip_ccmp_and_ccmp256() {
        let hdr = qos_header();
        let plaintext = b"ccmp protected payload".to_vec();
        for tk_len in [16usize, 32] {
            let tk: Vec<u8> = (0..tk_len as u8).collect();
            let body = encrypt(&tk, &hdr, &plaintext, Pn::new(0x1001), 0).unwrap();
            assert_eq!(body.len(), 8 + plaintext.len() + if tk_len == 16 { 8 } else { 16 });
            assert_eq!(decrypt(&tk, &hdr, &body).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_or_header_fails() {
        let hdr = qos_header();
        let tk: Vec<u8> = (0..16).collect();
        let body = encrypt(&tk, &hdr, b"payload", Pn::new(5), 0).unwrap();

        let other: Vec<u8> = (1..17).collect();
        assert_eq!(decrypt(&other, &hdr, &body), Err(CryptoError::Integrity));

        // Changing an addressed field breaks the AAD binding.
        let mut moved = hdr.clone();
        moved.addr3 = crate::frame::MacAddress([9; 6]);
        assert_eq!(decrypt(&tk, &moved, &body), Err(CryptoError::Integrity));
    }
}
