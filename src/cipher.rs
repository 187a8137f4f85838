//! Cipher suite identity and dispatch.
//!
//! Cipher identity is a tagged union selected once per key slot; every
//! decrypt/encrypt call site dispatches through it instead of re-branching
//! on RSN suite integers. The codecs themselves are stateless pure
//! functions over caller-supplied key bytes, which lets the key trial
//! engine run the same frame against any number of candidate keys.

use thiserror::Error;

use crate::bip;
use crate::ccmp;
use crate::frame::Dot11Header;
use crate::gcmp;
use crate::pn::Pn;
use crate::tkip;
use crate::wep;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// ICV / MIC / AEAD tag mismatch. Always recoverable.
    #[error("integrity check failed")]
    Integrity,
    #[error("frame too short for cipher header")]
    TooShort,
    #[error("invalid key length {0}")]
    KeyLength(usize),
    #[error("operation not supported for this cipher")]
    Unsupported,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cipher {
    Wep,
    Tkip,
    Ccmp,
    Ccmp256,
    Gcmp,
    Gcmp256,
    BipCmac128,
    BipCmac256,
    BipGmac128,
    BipGmac256,
}

impl Cipher {
    /// Temporal key length, where the cipher fixes one (WEP keys vary).
    pub fn tk_len(&self) -> Option<usize> {
        match self {
            Cipher::Wep => None,
            Cipher::Tkip => Some(32),
            Cipher::Ccmp => Some(16),
            Cipher::Ccmp256 => Some(32),
            Cipher::Gcmp => Some(16),
            Cipher::Gcmp256 => Some(32),
            Cipher::BipCmac128 => Some(16),
            Cipher::BipCmac256 => Some(32),
            Cipher::BipGmac128 => Some(16),
            Cipher::BipGmac256 => Some(32),
        }
    }

    /// Per-frame cipher header length in the frame body.
    pub fn header_len(&self) -> usize {
        match self {
            Cipher::Wep => 4,
            Cipher::Tkip | Cipher::Ccmp | Cipher::Ccmp256 | Cipher::Gcmp | Cipher::Gcmp256 => 8,
            _ => 0,
        }
    }

    /// Trailer length (MIC and/or ICV).
    pub fn mic_len(&self) -> usize {
        match self {
            Cipher::Wep => 4,
            Cipher::Tkip => 12, // 8-byte Michael MIC + 4-byte ICV
            Cipher::Ccmp => 8,
            Cipher::Ccmp256 => 16,
            Cipher::Gcmp | Cipher::Gcmp256 => 16,
            Cipher::BipCmac128 => 8,
            Cipher::BipCmac256 | Cipher::BipGmac128 | Cipher::BipGmac256 => 16,
        }
    }

    pub fn is_group_mgmt(&self) -> bool {
        matches!(
            self,
            Cipher::BipCmac128 | Cipher::BipCmac256 | Cipher::BipGmac128 | Cipher::BipGmac256
        )
    }

    /// Ciphers that carry the extended IV / PN header.
    pub fn has_pn(&self) -> bool {
        matches!(
            self,
            Cipher::Tkip | Cipher::Ccmp | Cipher::Ccmp256 | Cipher::Gcmp | Cipher::Gcmp256
        )
    }

    /// Decrypt a protected frame body (cipher header + ciphertext + MIC)
    /// and return the plaintext. BIP ciphers are integrity-only and never
    /// come through here.
    pub fn decrypt(
        &self,
        tk: &[u8],
        hdr: &Dot11Header,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::Wep => wep::decrypt(tk, body),
            Cipher::Tkip => tkip::decrypt(tk, hdr, body),
            Cipher::Ccmp | Cipher::Ccmp256 => ccmp::decrypt(tk, hdr, body),
            Cipher::Gcmp | Cipher::Gcmp256 => gcmp::decrypt(tk, hdr, body),
            _ => Err(CryptoError::Unsupported),
        }
    }

    /// Encrypt a plaintext MSDU into a full protected frame body, filling
    /// in the cipher header for `pn` / `key_id`.
    pub fn encrypt(
        &self,
        tk: &[u8],
        hdr: &Dot11Header,
        plaintext: &[u8],
        pn: Pn,
        key_id: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            Cipher::Wep => wep::encrypt(tk, plaintext, pn, key_id),
            Cipher::Tkip => tkip::encrypt(tk, hdr, plaintext, pn, key_id),
            Cipher::Ccmp | Cipher::Ccmp256 => ccmp::encrypt(tk, hdr, plaintext, pn, key_id),
            Cipher::Gcmp | Cipher::Gcmp256 => gcmp::encrypt(tk, hdr, plaintext, pn, key_id),
            _ => Err(CryptoError::Unsupported),
        }
    }

    /// Parse the cipher header at the front of a protected frame body.
    pub fn parse_header(&self, body: &[u8]) -> Result<ProtectedHeader, CryptoError> {
        match self {
            Cipher::Tkip => tkip::parse_header(body),
            Cipher::Ccmp | Cipher::Ccmp256 | Cipher::Gcmp | Cipher::Gcmp256 => {
                ccmp::parse_header(body)
            }
            Cipher::Wep => wep::parse_header(body),
            _ => Err(CryptoError::Unsupported),
        }
    }

    /// BIP MIC over a management frame; see `bip`.
    pub fn bip_mic(
        &self,
        igtk: &[u8],
        hdr: &Dot11Header,
        body_with_zeroed_mic: &[u8],
        ipn: Pn,
    ) -> Result<Vec<u8>, CryptoError> {
        bip::compute_mic(*self, igtk, hdr, body_with_zeroed_mic, ipn)
    }
}

impl std::fmt::Display for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cipher::Wep => "WEP",
            Cipher::Tkip => "TKIP",
            Cipher::Ccmp => "CCMP",
            Cipher::Ccmp256 => "CCMP-256",
            Cipher::Gcmp => "GCMP",
            Cipher::Gcmp256 => "GCMP-256",
            Cipher::BipCmac128 => "BIP-CMAC-128",
            Cipher::BipCmac256 => "BIP-CMAC-256",
            Cipher::BipGmac128 => "BIP-GMAC-128",
            Cipher::BipGmac256 => "BIP-GMAC-256",
        };
        write!(f, "{}", name)
    }
}

/// Decoded per-frame cipher header fields the replay engine cares about.
#[derive(Copy, Clone, Debug)]
pub struct ProtectedHeader {
    pub pn: Pn,
    pub key_id: u8,
    pub ext_iv: bool,
    /// False when reserved bits that must be zero are set.
    pub reserved_ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_per_suite() {
        assert_eq!(Cipher::Ccmp.tk_len(), Some(16));
        assert_eq!(Cipher::Ccmp256.tk_len(), Some(32));
        assert_eq!(Cipher::Tkip.mic_len(), 12);
        assert_eq!(Cipher::Gcmp256.mic_len(), 16);
        assert_eq!(Cipher::Wep.tk_len(), None);
        assert_eq!(Cipher::BipCmac128.header_len(), 0);
        assert!(Cipher::BipGmac256.is_group_mgmt());
        assert!(!Cipher::Ccmp.is_group_mgmt());
    }
}
