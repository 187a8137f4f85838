//! WEP: RC4 over a 3-byte IV prefix plus the declared key, with a CRC32
//! ICV for integrity. Failure is silent by design (no plaintext, no
//! diagnostics beyond the missing result); WEP carries no anti-replay
//! state at all.

use rc4::consts::{U16, U8};
use rc4::{KeyInit, Rc4, StreamCipher};

use crate::cipher::{CryptoError, ProtectedHeader};
use crate::pn::Pn;

pub(crate) fn rc4_apply(key: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
    match key.len() {
        8 => {
            let mut cipher =
                Rc4::<U8>::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
            cipher.apply_keystream(data);
        }
        16 => {
            let mut cipher =
                Rc4::<U16>::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?;
            cipher.apply_keystream(data);
        }
        other => return Err(CryptoError::KeyLength(other)),
    }
    Ok(())
}

fn seed_for(iv: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if key.len() != 5 && key.len() != 13 {
        return Err(CryptoError::KeyLength(key.len()));
    }
    let mut seed = Vec::with_capacity(3 + key.len());
    seed.extend_from_slice(iv);
    seed.extend_from_slice(key);
    Ok(seed)
}

/// Decrypt a WEP frame body (IV header + ciphertext + ICV).
pub fn decrypt(key: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if body.len() < 8 {
        return Err(CryptoError::TooShort);
    }
    let seed = seed_for(&body[0..3], key)?;
    let mut data = body[4..].to_vec();
    rc4_apply(&seed, &mut data)?;

    let icv_offset = data.len() - 4;
    let expected = u32::from_le_bytes(data[icv_offset..].try_into().unwrap_or([0; 4]));
    if crc32fast::hash(&data[..icv_offset]) != expected {
        return Err(CryptoError::Integrity);
    }
    data.truncate(icv_offset);
    Ok(data)
}

/// Encrypt a plaintext MSDU. The IV comes from the low 24 bits of the
/// caller's packet counter so injected frames keep moving forward.
pub fn encrypt(key: &[u8], plaintext: &[u8], pn: Pn, key_id: u8) -> Result<Vec<u8>, CryptoError> {
    let pn_bytes = pn.to_le_bytes();
    let iv = [pn_bytes[0], pn_bytes[1], pn_bytes[2]];
    let seed = seed_for(&iv, key)?;

    let mut data = Vec::with_capacity(plaintext.len() + 4);
    data.extend_from_slice(plaintext);
    data.extend_from_slice(&crc32fast::hash(plaintext).to_le_bytes());
    rc4_apply(&seed, &mut data)?;

    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&iv);
    out.push((key_id & 0x03) << 6);
    out.extend_from_slice(&data);
    Ok(out)
}

pub fn parse_header(body: &[u8]) -> Result<ProtectedHeader, CryptoError> {
    if body.len() < 4 {
        return Err(CryptoError::TooShort);
    }
    let iv = u64::from(body[0]) | u64::from(body[1]) << 8 | u64::from(body[2]) << 16;
    Ok(ProtectedHeader {
        pn: Pn::new(iv),
        key_id: body[3] >> 6,
        ext_iv: false,
        reserved_ok: body[3] & 0x3f == 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_both_key_lengths() {
        for key in [&b"abcde"[..], &b"abcdefghijklm"[..]] {
            let plaintext = b"The quick brown fox";
            let body = encrypt(key, plaintext, Pn::new(0x1234), 2).unwrap();
            assert_eq!(body[3] >> 6, 2);
            let recovered = decrypt(key, &body).unwrap();
            assert_eq!(recovered, plaintext);
        }
    }

    #[test]
    fn wrong_key_fails_icv() {
        let body = encrypt(b"abcde", b"payload bytes", Pn::new(1), 0).unwrap();
        assert_eq!(decrypt(b"edcba", &body), Err(CryptoError::Integrity));
    }

    #[test]
    fn corrupted_ciphertext_fails_icv() {
        let mut body = encrypt(b"abcde", b"payload bytes", Pn::new(1), 0).unwrap();
        let last = body.len() - 6;
        body[last] ^= 0x01;
        assert_eq!(decrypt(b"abcde", &body), Err(CryptoError::Integrity));
    }

    #[test]
    fn invalid_key_length_rejected() {
        assert_eq!(
            decrypt(b"toolongkeyforwep!", &[0u8; 12]),
            Err(CryptoError::KeyLength(17))
        );
    }
}
