//! TKIP: two-phase key mixing into a per-packet RC4 key, Michael MIC over a
//! DA/SA/priority pseudo-header plus the plaintext, and the WEP-style CRC32
//! ICV underneath. Both Michael and the ICV must pass.
//!
//! The 16-bit mixing S-box is derived from the AES S-box (high byte
//! `2*S(i)`, low byte `3*S(i)` in GF(2^8)); it is computed once at first
//! use rather than pasted in as a table.

use std::sync::OnceLock;

use crate::cipher::{CryptoError, ProtectedHeader};
use crate::frame::Dot11Header;
use crate::pn::Pn;
use crate::wep::rc4_apply;

fn aes_sbox() -> [u8; 256] {
    let mut sbox = [0u8; 256];
    sbox[0] = 0x63;
    let mut p: u8 = 1;
    let mut q: u8 = 1;
    loop {
        // p *= 3 in GF(2^8)
        p = p ^ (p << 1) ^ if p & 0x80 != 0 { 0x1b } else { 0 };
        // q /= 3
        q ^= q << 1;
        q ^= q << 2;
        q ^= q << 4;
        if q & 0x80 != 0 {
            q ^= 0x09;
        }
        let x = q ^ q.rotate_left(1) ^ q.rotate_left(2) ^ q.rotate_left(3) ^ q.rotate_left(4);
        sbox[p as usize] = x ^ 0x63;
        if p == 1 {
            break;
        }
    }
    sbox
}

fn mix_sbox() -> &'static [u16; 256] {
    static SBOX: OnceLock<[u16; 256]> = OnceLock::new();
    SBOX.get_or_init(|| {
        let aes = aes_sbox();
        let mut table = [0u16; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let s = aes[i];
            let x2 = s << 1 ^ if s & 0x80 != 0 { 0x1b } else { 0 };
            *entry = (x2 as u16) << 8 | (s ^ x2) as u16;
        }
        table
    })
}

fn s(v: u16) -> u16 {
    let table = mix_sbox();
    table[(v & 0xff) as usize] ^ table[(v >> 8) as usize].swap_bytes()
}

fn mk16(hi: u8, lo: u8) -> u16 {
    (hi as u16) << 8 | lo as u16
}

/// Phase 1 key mixing over the transmitter address and the upper 32 bits
/// of the TSC.
fn phase1(tk: &[u8], ta: &[u8; 6], iv32: u32) -> [u16; 5] {
    let mut p = [
        iv32 as u16,
        (iv32 >> 16) as u16,
        mk16(ta[1], ta[0]),
        mk16(ta[3], ta[2]),
        mk16(ta[5], ta[4]),
    ];
    for i in 0..8u16 {
        let j = (2 * (i & 1)) as usize;
        p[0] = p[0].wrapping_add(s(p[4] ^ mk16(tk[1 + j], tk[j])));
        p[1] = p[1].wrapping_add(s(p[0] ^ mk16(tk[5 + j], tk[4 + j])));
        p[2] = p[2].wrapping_add(s(p[1] ^ mk16(tk[9 + j], tk[8 + j])));
        p[3] = p[3].wrapping_add(s(p[2] ^ mk16(tk[13 + j], tk[12 + j])));
        p[4] = p[4]
            .wrapping_add(s(p[3] ^ mk16(tk[1 + j], tk[j])))
            .wrapping_add(i);
    }
    p
}

/// Phase 2 key mixing over the lower 16 bits of the TSC, producing the
/// 16-byte per-packet RC4 key.
fn phase2(p1k: &[u16; 5], tk: &[u8], iv16: u16) -> [u8; 16] {
    let mut ppk = [p1k[0], p1k[1], p1k[2], p1k[3], p1k[4], p1k[4].wrapping_add(iv16)];

    ppk[0] = ppk[0].wrapping_add(s(ppk[5] ^ mk16(tk[1], tk[0])));
    ppk[1] = ppk[1].wrapping_add(s(ppk[0] ^ mk16(tk[3], tk[2])));
    ppk[2] = ppk[2].wrapping_add(s(ppk[1] ^ mk16(tk[5], tk[4])));
    ppk[3] = ppk[3].wrapping_add(s(ppk[2] ^ mk16(tk[7], tk[6])));
    ppk[4] = ppk[4].wrapping_add(s(ppk[3] ^ mk16(tk[9], tk[8])));
    ppk[5] = ppk[5].wrapping_add(s(ppk[4] ^ mk16(tk[11], tk[10])));

    ppk[0] = ppk[0].wrapping_add((ppk[5] ^ mk16(tk[13], tk[12])).rotate_right(1));
    ppk[1] = ppk[1].wrapping_add((ppk[0] ^ mk16(tk[15], tk[14])).rotate_right(1));
    ppk[2] = ppk[2].wrapping_add(ppk[1].rotate_right(1));
    ppk[3] = ppk[3].wrapping_add(ppk[2].rotate_right(1));
    ppk[4] = ppk[4].wrapping_add(ppk[3].rotate_right(1));
    ppk[5] = ppk[5].wrapping_add(ppk[4].rotate_right(1));

    let mut key = [0u8; 16];
    key[0] = (iv16 >> 8) as u8;
    key[1] = ((iv16 >> 8) as u8 | 0x20) & 0x7f;
    key[2] = iv16 as u8;
    key[3] = ((ppk[5] ^ mk16(tk[1], tk[0])) >> 1) as u8;
    for i in 0..6 {
        key[4 + 2 * i] = ppk[i] as u8;
        key[5 + 2 * i] = (ppk[i] >> 8) as u8;
    }
    key
}

fn xswap(v: u32) -> u32 {
    ((v & 0xff00ff00) >> 8) | ((v & 0x00ff00ff) << 8)
}

fn michael_block(l: &mut u32, r: &mut u32) {
    *r ^= l.rotate_left(17);
    *l = l.wrapping_add(*r);
    *r ^= xswap(*l);
    *l = l.wrapping_add(*r);
    *r ^= l.rotate_left(3);
    *l = l.wrapping_add(*r);
    *r ^= l.rotate_right(2);
    *l = l.wrapping_add(*r);
}

/// Michael MIC over the DA/SA/priority pseudo-header and the plaintext
/// MSDU. Deliberately weak by design of the protocol; treated as a MIC,
/// not a cryptographic MAC.
pub fn michael(key: &[u8], da: &[u8; 6], sa: &[u8; 6], priority: u8, data: &[u8]) -> [u8; 8] {
    let mut l = u32::from_le_bytes(key[0..4].try_into().unwrap_or([0; 4]));
    let mut r = u32::from_le_bytes(key[4..8].try_into().unwrap_or([0; 4]));

    let mut hdr = [0u8; 16];
    hdr[0..6].copy_from_slice(da);
    hdr[6..12].copy_from_slice(sa);
    hdr[12] = priority;

    for chunk in hdr.chunks_exact(4) {
        l ^= u32::from_le_bytes(chunk.try_into().unwrap_or([0; 4]));
        michael_block(&mut l, &mut r);
    }
    let mut iter = data.chunks_exact(4);
    for chunk in &mut iter {
        l ^= u32::from_le_bytes(chunk.try_into().unwrap_or([0; 4]));
        michael_block(&mut l, &mut r);
    }
    // Final partial word with 0x5a padding, then one empty block.
    let rem = iter.remainder();
    let mut last = 0u32;
    for (i, b) in rem.iter().enumerate() {
        last |= (*b as u32) << (8 * i);
    }
    last |= 0x5a << (8 * rem.len());
    l ^= last;
    michael_block(&mut l, &mut r);
    michael_block(&mut l, &mut r);

    let mut mic = [0u8; 8];
    mic[0..4].copy_from_slice(&l.to_le_bytes());
    mic[4..8].copy_from_slice(&r.to_le_bytes());
    mic
}

/// Michael key for the frame's direction: the authenticator's TX key for
/// AP-originated frames, its RX key otherwise.
fn michael_key(tk: &[u8], hdr: &Dot11Header) -> [u8; 8] {
    let slice = if hdr.fc.from_ds() {
        &tk[16..24]
    } else {
        &tk[24..32]
    };
    slice.try_into().unwrap_or([0; 8])
}

pub fn parse_header(body: &[u8]) -> Result<ProtectedHeader, CryptoError> {
    if body.len() < 8 {
        return Err(CryptoError::TooShort);
    }
    let iv16 = mk16(body[0], body[2]);
    let iv32 = u32::from_le_bytes(body[4..8].try_into().unwrap_or([0; 4]));
    // WEPSeed[1] has a fixed relationship to TSC1; a mismatch means the
    // header was mangled (or forged).
    let seed_ok = body[1] == (body[0] | 0x20) & 0x7f;
    Ok(ProtectedHeader {
        pn: Pn::from_tkip(iv32, iv16),
        key_id: body[3] >> 6,
        ext_iv: body[3] & 0x20 != 0,
        reserved_ok: seed_ok && body[3] & 0x1f == 0,
    })
}

/// Decrypt a TKIP frame body. Returns the plaintext MSDU with Michael MIC
/// and ICV verified and stripped.
pub fn decrypt(tk: &[u8], hdr: &Dot11Header, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if tk.len() != 32 {
        return Err(CryptoError::KeyLength(tk.len()));
    }
    // 8 header + at least MIC (8) + ICV (4).
    if body.len() < 20 {
        return Err(CryptoError::TooShort);
    }
    let prot = parse_header(body)?;
    let rc4key = phase2(
        &phase1(tk, &hdr.addr2.0, prot.pn.iv32()),
        tk,
        prot.pn.iv16(),
    );

    let mut data = body[8..].to_vec();
    rc4_apply(&rc4key, &mut data)?;

    let icv_offset = data.len() - 4;
    let expected = u32::from_le_bytes(data[icv_offset..].try_into().unwrap_or([0; 4]));
    if crc32fast::hash(&data[..icv_offset]) != expected {
        return Err(CryptoError::Integrity);
    }
    data.truncate(icv_offset);

    let mic_offset = data.len() - 8;
    let mic = michael(
        &michael_key(tk, hdr),
        &hdr.da().0,
        &hdr.sa().0,
        hdr.tid() as u8 & 0x0f,
        &data[..mic_offset],
    );
    if mic != data[mic_offset..] {
        return Err(CryptoError::Integrity);
    }
    data.truncate(mic_offset);
    Ok(data)
}

/// Encrypt a plaintext MSDU under TKIP for the given TSC.
pub fn encrypt(
    tk: &[u8],
    hdr: &Dot11Header,
    plaintext: &[u8],
    pn: Pn,
    key_id: u8,
) -> Result<Vec<u8>, CryptoError> {
    if tk.len() != 32 {
        return Err(CryptoError::KeyLength(tk.len()));
    }
    let iv16 = pn.iv16();
    let iv32 = pn.iv32();
    let rc4key = phase2(&phase1(tk, &hdr.addr2.0, iv32), tk, iv16);

    let mut data = Vec::with_capacity(plaintext.len() + 12);
    data.extend_from_slice(plaintext);
    let mic = michael(
        &michael_key(tk, hdr),
        &hdr.da().0,
        &hdr.sa().0,
        hdr.tid() as u8 & 0x0f,
        plaintext,
    );
    data.extend_from_slice(&mic);
    data.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    rc4_apply(&rc4key, &mut data)?;

    let mut out = Vec::with_capacity(8 + data.len());
    let tsc1 = (iv16 >> 8) as u8;
    out.push(tsc1);
    out.push((tsc1 | 0x20) & 0x7f);
    out.push(iv16 as u8);
    out.push(0x20 | (key_id & 0x03) << 6); // ExtIV always set
    out.extend_from_slice(&iv32.to_le_bytes());
    out.extend_from_slice(&data);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Dot11Header, FC_FROM_DS};

    fn data_header(from_ds: bool) -> Dot11Header {
        let fc = 0x0088 | if from_ds { FC_FROM_DS } else { 0x0100 };
        let mut bytes = vec![0u8; 26];
        bytes[0..2].copy_from_slice(&fc.to_le_bytes());
        bytes[4..10].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x10]);
        bytes[10..16].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x20]);
        bytes[16..22].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x30]);
        bytes[24] = 0x03; // TID 3
        Dot11Header::parse(&bytes).unwrap()
    }

    #[test]
    fn mix_sbox_matches_reference_entries() {
        let table = mix_sbox();
        // First entries of the published TKIP S-box.
        assert_eq!(table[0], 0xc6a5);
        assert_eq!(table[1], 0xf884);
        assert_eq!(table[2], 0xee99);
        assert_eq!(table[255], 0x2c3a);
    }

    #[test]
    fn round_trip() {
        let tk: Vec<u8> = (0..32).collect();
        let hdr = data_header(true);
        let plaintext = b"tkip protected payload".to_vec();
        let pn = Pn::from_tkip(1, 5);
        let body = encrypt(&tk, &hdr, &plaintext, pn, 0).unwrap();
        let prot = parse_header(&body).unwrap();
        assert_eq!(prot.pn, pn);
        assert!(prot.ext_iv);
        assert!(prot.reserved_ok);
        assert_eq!(decrypt(&tk, &hdr, &body).unwrap(), plaintext);
    }

    #[test]
    fn direction_selects_michael_key() {
        let tk: Vec<u8> = (0..32).collect();
        let plaintext = b"payload".to_vec();
        let body = encrypt(&tk, &data_header(true), &plaintext, Pn::new(7), 0).unwrap();
        // Same bytes interpreted as a ToDS frame use the other Michael key
        // (and different DA/SA), so verification must fail.
        assert!(decrypt(&tk, &data_header(false), &body).is_err());
    }

    #[test]
    fn corrupted_payload_fails() {
        let tk: Vec<u8> = (0..32).collect();
        let hdr = data_header(true);
        let mut body = encrypt(&tk, &hdr, b"payload", Pn::new(9), 0).unwrap();
        let mid = body.len() - 14;
        body[mid] ^= 0x40;
        assert_eq!(decrypt(&tk, &hdr, &body), Err(CryptoError::Integrity));
    }

    #[test]
    fn michael_differs_by_priority() {
        let key = [0u8; 8];
        let da = [1u8; 6];
        let sa = [2u8; 6];
        let a = michael(&key, &da, &sa, 0, b"data");
        let b = michael(&key, &da, &sa, 3, b"data");
        assert_ne!(a, b);
    }
}
