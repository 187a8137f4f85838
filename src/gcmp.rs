//! GCMP and GCMP-256: AES-GCM with the CCMP AAD construction and a
//! 12-byte nonce of transmitter address plus packet number. The extended-IV
//! header on the wire is identical to CCMP's.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

use crate::ccmp::{build_aad_nonce, write_header};
use crate::cipher::CryptoError;
use crate::frame::Dot11Header;
use crate::pn::Pn;

pub(crate) fn gcm_nonce(hdr: &Dot11Header, pn: Pn) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0..6].copy_from_slice(&hdr.addr2.0);
    nonce[6..12].copy_from_slice(&pn.to_be_bytes());
    nonce
}

/// Decrypt a GCMP frame body (8-byte header + ciphertext + 16-byte tag).
/// Key length selects GCMP (16) or GCMP-256 (32).
pub fn decrypt(tk: &[u8], hdr: &Dot11Header, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if tk.len() != 16 && tk.len() != 32 {
        return Err(CryptoError::KeyLength(tk.len()));
    }
    if body.len() < 8 + 16 {
        return Err(CryptoError::TooShort);
    }
    let prot = crate::ccmp::parse_header(body)?;
    let (aad, _) = build_aad_nonce(hdr, prot.pn);
    let nonce = gcm_nonce(hdr, prot.pn);
    let payload = Payload {
        msg: &body[8..],
        aad: &aad,
    };
    let result = match tk.len() {
        16 => Aes128Gcm::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .decrypt(Nonce::from_slice(&nonce), payload),
        _ => Aes256Gcm::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .decrypt(Nonce::from_slice(&nonce), payload),
    };
    result.map_err(|_| CryptoError::Integrity)
}

/// Encrypt a plaintext MSDU under GCMP/GCMP-256 for the given PN.
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
    let (aad, _) = build_aad_nonce(hdr, pn);
    let nonce = gcm_nonce(hdr, pn);
    let payload = Payload {
        msg: plaintext,
        aad: &aad,
    };
    let ct = match tk.len() {
        16 => Aes128Gcm::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .encrypt(Nonce::from_slice(&nonce), payload),
        _ => Aes256Gcm::new_from_slice(tk)
            .map_err(|_| CryptoError::KeyLength(tk.len()))?
            .encrypt(Nonce::from_slice(&nonce), payload),
    }
    .map_err(|_| CryptoError::Integrity)?;

    let mut out = Vec::with_capacity(8 + ct.len());
    out.extend_from_slice(&write_header(pn, key_id));
    out.extend_from_slice(&ct);
    Ok(out)
}
