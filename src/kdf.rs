//! Key derivation: the 802.11 SHA1 PRF and SHA256 KDF, passphrase-to-PSK
//! mapping, PTK/TPK derivation, and the RFC 3394 key unwrap used for EAPOL
//! Key Data.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128, Aes256};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::cipher::CryptoError;
use crate::frame::MacAddress;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Pairwise Transient Key split into its three parts. KCK and KEK are
/// 16 bytes for the PSK-family AKMs handled here; TK length follows the
/// pairwise cipher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ptk {
    pub kck: Vec<u8>,
    pub kek: Vec<u8>,
    pub tk: Vec<u8>,
}

impl Ptk {
    /// Split an externally supplied raw PTK (KCK16 | KEK16 | TK).
    pub fn from_raw(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 48 {
            return None;
        }
        Some(Ptk {
            kck: bytes[0..16].to_vec(),
            kek: bytes[16..32].to_vec(),
            tk: bytes[32..].to_vec(),
        })
    }
}

/// TDLS Peer Key: KCK for the setup MICs, TK for the direct-link data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tpk {
    pub kck: [u8; 16],
    pub tk: [u8; 16],
}

/// IEEE 802.11 PRF (HMAC-SHA1 with a zero separator and an 8-bit counter
/// appended, counter starting at 0).
pub fn prf_sha1(key: &[u8], label: &str, data: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 20);
    let mut counter = 0u8;
    while out.len() < out_len {
        let mut mac = match <HmacSha1 as Mac>::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return vec![0; out_len],
        };
        mac.update(label.as_bytes());
        mac.update(&[0u8]);
        mac.update(data);
        mac.update(&[counter]);
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(out_len);
    out
}

/// IEEE 802.11 KDF (counter-mode HMAC-SHA256; 16-bit little-endian counter
/// from 1 in front, output length in bits appended).
pub fn kdf_sha256(key: &[u8], label: &str, data: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len + 32);
    let length_bits = (out_len * 8) as u16;
    let mut counter = 1u16;
    while out.len() < out_len {
        let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return vec![0; out_len],
        };
        mac.update(&counter.to_le_bytes());
        mac.update(label.as_bytes());
        mac.update(data);
        mac.update(&length_bits.to_le_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(out_len);
    out
}

/// Passphrase to PSK: PBKDF2-HMAC-SHA1, 4096 iterations, 32 bytes.
pub fn psk_from_passphrase(passphrase: &str, ssid: &[u8]) -> [u8; 32] {
    let mut psk = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(passphrase.as_bytes(), ssid, 4096, &mut psk);
    psk
}

fn minmax_concat<'a>(a: &'a [u8], b: &'a [u8], out: &mut Vec<u8>) {
    if a <= b {
        out.extend_from_slice(a);
        out.extend_from_slice(b);
    } else {
        out.extend_from_slice(b);
        out.extend_from_slice(a);
    }
}

/// Derive the PTK from a PMK and the 4-way handshake nonces.
pub fn derive_ptk(
    pmk: &[u8],
    aa: &MacAddress,
    spa: &MacAddress,
    anonce: &[u8; 32],
    snonce: &[u8; 32],
    use_sha256: bool,
    tk_len: usize,
) -> Ptk {
    let mut data = Vec::with_capacity(12 + 64);
    minmax_concat(&aa.0, &spa.0, &mut data);
    minmax_concat(anonce, snonce, &mut data);

    let out_len = 16 + 16 + tk_len;
    let raw = if use_sha256 {
        kdf_sha256(pmk, "Pairwise key expansion", &data, out_len)
    } else {
        prf_sha1(pmk, "Pairwise key expansion", &data, out_len)
    };
    Ptk {
        kck: raw[0..16].to_vec(),
        kek: raw[16..32].to_vec(),
        tk: raw[32..].to_vec(),
    }
}

/// Derive the TDLS Peer Key.
///
/// TPK-Key-Input = SHA-256(min(SNonce, ANonce) || max(SNonce, ANonce)),
/// TPK-Key-Data = KDF(input, "TDLS PMK", min(MAC_I, MAC_R) || max || BSSID),
/// split KCK16 | TK16.
pub fn derive_tpk(
    snonce: &[u8; 32],
    anonce: &[u8; 32],
    mac_i: &MacAddress,
    mac_r: &MacAddress,
    bssid: &MacAddress,
) -> Tpk {
    let mut nonces = Vec::with_capacity(64);
    minmax_concat(snonce, anonce, &mut nonces);
    let key_input = Sha256::digest(&nonces);

    let mut data = Vec::with_capacity(18);
    minmax_concat(&mac_i.0, &mac_r.0, &mut data);
    data.extend_from_slice(&bssid.0);

    let raw = kdf_sha256(&key_input, "TDLS PMK", &data, 32);
    let mut tpk = Tpk {
        kck: [0; 16],
        tk: [0; 16],
    };
    tpk.kck.copy_from_slice(&raw[0..16]);
    tpk.tk.copy_from_slice(&raw[16..32]);
    tpk
}

/// RFC 3394 AES key unwrap (KEK of 16 or 32 bytes).
pub fn aes_unwrap(kek: &[u8], wrapped: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
        return Err(CryptoError::TooShort);
    }
    enum Kw {
        A128(Aes128),
        A256(Aes256),
    }
    let cipher = match kek.len() {
        16 => Kw::A128(Aes128::new_from_slice(kek).map_err(|_| CryptoError::KeyLength(16))?),
        32 => Kw::A256(Aes256::new_from_slice(kek).map_err(|_| CryptoError::KeyLength(32))?),
        other => return Err(CryptoError::KeyLength(other)),
    };

    let n = wrapped.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&wrapped[0..8]);
    let mut r: Vec<[u8; 8]> = wrapped[8..]
        .chunks_exact(8)
        .map(|c| c.try_into().unwrap_or([0; 8]))
        .collect();

    for j in (0..6).rev() {
        for i in (1..=n).rev() {
            let t = (n * j + i) as u64;
            let mut block = [0u8; 16];
            block[0..8].copy_from_slice(&a);
            for (k, b) in t.to_be_bytes().iter().enumerate() {
                block[k] ^= b;
            }
            block[8..16].copy_from_slice(&r[i - 1]);
            let ga = GenericArray::from_mut_slice(&mut block);
            match &cipher {
                Kw::A128(c) => c.decrypt_block(ga),
                Kw::A256(c) => c.decrypt_block(ga),
            }
            a.copy_from_slice(&block[0..8]);
            r[i - 1].copy_from_slice(&block[8..16]);
        }
    }

    if a != [0xa6; 8] {
        return Err(CryptoError::Integrity);
    }
    Ok(r.concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::slice_to_hex_string;

    #[test]
    fn psk_known_vector() {
        // IEEE 802.11i test vector: "password" / "IEEE".
        let psk = psk_from_passphrase("password", b"IEEE");
        assert_eq!(
            slice_to_hex_string(&psk),
            "f42c6fc52df0ebef9ebb4b90b38a5f902e83fe1b135a70e23aed762e9710a12e"
        );
    }

    #[test]
    fn prf_expands_to_arbitrary_lengths() {
        let key = [0x0b; 20];
        let short = prf_sha1(&key, "prefix", b"data", 16);
        let long = prf_sha1(&key, "prefix", b"data", 48);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 48);
        assert_eq!(&long[..16], &short[..]);
        assert_ne!(&long[..20], &long[20..40]);
    }

    #[test]
    fn ptk_is_symmetric_in_address_and_nonce_order() {
        let pmk = [7u8; 32];
        let aa = MacAddress([0x02, 0, 0, 0, 0, 1]);
        let spa = MacAddress([0x02, 0, 0, 0, 0, 2]);
        let anonce = [0xaa; 32];
        let snonce = [0xbb; 32];
        let a = derive_ptk(&pmk, &aa, &spa, &anonce, &snonce, false, 16);
        let b = derive_ptk(&pmk, &spa, &aa, &anonce, &snonce, false, 16);
        assert_eq!(a, b);
        assert_eq!(a.tk.len(), 16);
        let sha256 = derive_ptk(&pmk, &aa, &spa, &anonce, &snonce, true, 16);
        assert_ne!(a, sha256);
    }

    #[test]
    fn tpk_is_symmetric() {
        let mac_i = MacAddress([0x02, 0, 0, 0, 0, 1]);
        let mac_r = MacAddress([0x02, 0, 0, 0, 0, 2]);
        let bssid = MacAddress([0x02, 0, 0, 0, 0, 3]);
        let sn = [1u8; 32];
        let an = [2u8; 32];
        let a = derive_tpk(&sn, &an, &mac_i, &mac_r, &bssid);
        let b = derive_tpk(&an, &sn, &mac_r, &mac_i, &bssid);
        assert_eq!(a, b);
        let other = derive_tpk(&sn, &an, &mac_i, &mac_r, &MacAddress([9; 6]));
        assert_ne!(a, other);
    }

    #[test]
    fn key_unwrap_round_trip() {
        // RFC 3394 section 4.1 test vector.
        let kek: Vec<u8> = (0..16).collect();
        let wrapped = [
            0x1f, 0xa6, 0x8b, 0x0a, 0x81, 0x12, 0xb4, 0x47, 0xae, 0xf3, 0x4b, 0xd8, 0xfb, 0x5a,
            0x7b, 0x82, 0x9d, 0x3e, 0x86, 0x23, 0x71, 0xd2, 0xcf, 0xe5,
        ];
        let plain = aes_unwrap(&kek, &wrapped).unwrap();
        assert_eq!(
            slice_to_hex_string(&plain),
            "00112233445566778899aabbccddeeff"
        );
    }

    #[test]
    fn key_unwrap_rejects_bad_integrity() {
        let kek: Vec<u8> = (0..16).collect();
        let mut wrapped = [0u8; 24];
        wrapped[0] = 1;
        assert_eq!(aes_unwrap(&kek, &wrapped), Err(CryptoError::Integrity));
    }

    #[test]
    fn raw_ptk_split() {
        let raw: Vec<u8> = (0..64).collect();
        let ptk = Ptk::from_raw(&raw).unwrap();
        assert_eq!(ptk.kck.len(), 16);
        assert_eq!(ptk.kek.len(), 16);
        assert_eq!(ptk.tk.len(), 32);
        assert!(Ptk::from_raw(&raw[..40]).is_none());
    }
}
