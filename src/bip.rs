//! BIP: integrity-only protection for group-addressed robust management
//! frames. The CMAC flavors run AES-CMAC over AAD plus the frame body with
//! the MME MIC field zeroed; the GMAC flavors run AES-GMAC with a nonce of
//! transmitter address plus IPN over the same bytes.

use aes::{Aes128, Aes256};
use aes_gcm::aead::{Aead, KeyInit as GcmKeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use cmac::{Cmac, Mac};

use crate::cipher::{Cipher, CryptoError};
use crate::frame::{Dot11Header, FC_MORE_DATA, FC_PWR_MGT, FC_RETRY};
use crate::pn::Pn;

fn build_aad(hdr: &Dot11Header) -> [u8; 20] {
    let fc = hdr.fc.0 & !(FC_RETRY | FC_PWR_MGT | FC_MORE_DATA);
    let mut aad = [0u8; 20];
    aad[0..2].copy_from_slice(&fc.to_le_bytes());
    aad[2..8].copy_from_slice(&hdr.addr1.0);
    aad[8..14].copy_from_slice(&hdr.addr2.0);
    aad[14..20].copy_from_slice(&hdr.addr3.0);
    aad
}

/// Compute the BIP MIC for a management frame whose body already has the
/// MME MIC field zeroed. Returns 8 bytes for BIP-CMAC-128, 16 otherwise.
pub fn compute_mic(
    cipher: Cipher,
    igtk: &[u8],
    hdr: &Dot11Header,
    body_with_zeroed_mic: &[u8],
    ipn: Pn,
) -> Result<Vec<u8>, CryptoError> {
    let aad = build_aad(hdr);
    match cipher {
        Cipher::BipCmac128 => {
            let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(igtk)
                .map_err(|_| CryptoError::KeyLength(igtk.len()))?;
            mac.update(&aad);
            mac.update(body_with_zeroed_mic);
            Ok(mac.finalize().into_bytes()[..8].to_vec())
        }
        Cipher::BipCmac256 => {
            let mut mac = <Cmac<Aes256> as Mac>::new_from_slice(igtk)
                .map_err(|_| CryptoError::KeyLength(igtk.len()))?;
            mac.update(&aad);
            mac.update(body_with_zeroed_mic);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        Cipher::BipGmac128 | Cipher::BipGmac256 => {
            let mut nonce = [0u8; 12];
            nonce[0..6].copy_from_slice(&hdr.addr2.0);
            nonce[6..12].copy_from_slice(&ipn.to_be_bytes());
            let mut buf = Vec::with_capacity(aad.len() + body_with_zeroed_mic.len());
            buf.extend_from_slice(&aad);
            buf.extend_from_slice(body_with_zeroed_mic);
            let payload = Payload {
                msg: &[],
                aad: &buf,
            };
            let tag = match cipher {
                Cipher::BipGmac128 => Aes128Gcm::new_from_slice(igtk)
                    .map_err(|_| CryptoError::KeyLength(igtk.len()))?
                    .encrypt(Nonce::from_slice(&nonce), payload),
                _ => Aes256Gcm::new_from_slice(igtk)
                    .map_err(|_| CryptoError::KeyLength(igtk.len()))?
                    .encrypt(Nonce::from_slice(&nonce), payload),
            }
            .map_err(|_| CryptoError::Integrity)?;
            Ok(tag)
        }
        _ => Err(CryptoError::Unsupported),
    }
}

/// Verify a BIP MIC. `body` is the management frame body as captured;
/// `mic_offset` locates the MME MIC field within it.
pub fn verify(
    cipher: Cipher,
    igtk: &[u8],
    hdr: &Dot11Header,
    body: &[u8],
    mic_offset: usize,
    mic: &[u8],
    ipn: Pn,
) -> Result<bool, CryptoError> {
    if mic_offset + mic.len() > body.len() {
        return Err(CryptoError::TooShort);
    }
    let mut zeroed = body.to_vec();
    zeroed[mic_offset..mic_offset + mic.len()].fill(0);
    let computed = compute_mic(cipher, igtk, hdr, &zeroed, ipn)?;
    Ok(computed == mic)
}
