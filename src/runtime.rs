//! Shared runtime state threaded through every frame handler: the entity
//! store, run counters, the status log, and policy flags.

use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::Arguments;
use crate::devices::Store;
use crate::kdf::Ptk;
use crate::status::{MessageLog, MessageType, StatusMessage};
use crate::util::{parse_hex, parse_wep_key};

#[derive(Copy, Clone, Debug, Default)]
pub struct Counters {
    pub frames: u64,
    pub fcs_failures: u64,
    pub decrypted: u64,
    pub decrypt_failures: u64,
    pub replays: u64,
    pub eapol_frames: u64,
    pub tdls_actions: u64,
    pub injected: u64,
}

pub struct SleuthRuntime {
    pub store: Store,
    pub counters: Counters,
    pub status_log: MessageLog,
    pub strict: bool,
    /// Capture timestamp of the frame currently being processed.
    pub frame_ts: Duration,
    /// Only buffer rebuilt plaintext frames when an output capture was
    /// requested; otherwise the Vec would grow for nothing.
    pub collect_decrypted: bool,
    /// Successfully decrypted frames, rebuilt with the Protected bit
    /// cleared, for the optional output capture.
    pub decrypted_frames: Vec<(Duration, Vec<u8>)>,
}

impl SleuthRuntime {
    pub fn new(args: &Arguments) -> Result<Self> {
        let mut store = Store::new();

        for key in args.wep_key.iter().flatten() {
            let parsed = parse_wep_key(key).map_err(|e| anyhow!("WEP key {key:?}: {e}"))?;
            store.wep_keys.push(parsed);
        }
        for passphrase in args.passphrase.iter().flatten() {
            if !(8..=63).contains(&passphrase.len()) {
                return Err(anyhow!(
                    "passphrase must be 8..63 characters, got {}",
                    passphrase.len()
                ));
            }
            store.passphrases.push(passphrase.clone());
        }
        for pmk in args.pmk.iter().flatten() {
            let bytes = parse_hex(pmk).map_err(|e| anyhow!("PMK {pmk:?}: {e}"))?;
            let pmk: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow!("PMK must be 32 bytes of hex"))?;
            store.add_pmk(pmk);
        }
        for ptk in args.ptk.iter().flatten() {
            let bytes = parse_hex(ptk).map_err(|e| anyhow!("PTK {ptk:?}: {e}"))?;
            let ptk = Ptk::from_raw(&bytes)
                .ok_or_else(|| anyhow!("PTK must be at least 48 bytes of hex"))?;
            store.ptks.push(ptk);
        }

        Ok(SleuthRuntime {
            store,
            counters: Counters::default(),
            status_log: MessageLog::new(None),
            strict: args.strict,
            frame_ts: Duration::ZERO,
            collect_decrypted: args.output.is_some(),
            decrypted_frames: Vec::new(),
        })
    }

    pub fn log(&mut self, message_type: MessageType, content: String) {
        self.status_log
            .add_message(StatusMessage::new(message_type, content));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_material_is_loaded_from_arguments() {
        let args = Arguments {
            wep_key: Some(vec!["0102030405".to_string()]),
            passphrase: Some(vec!["password".to_string()]),
            pmk: Some(vec![
                "00".repeat(32),
            ]),
            ptk: Some(vec!["11".repeat(48)]),
            ..Default::default()
        };
        let rt = SleuthRuntime::new(&args).unwrap();
        assert_eq!(rt.store.wep_keys.len(), 1);
        assert_eq!(rt.store.passphrases.len(), 1);
        assert_eq!(rt.store.pmks.len(), 1);
        assert_eq!(rt.store.ptks.len(), 1);
    }

    #[test]
    fn bad_key_material_is_rejected() {
        let bad_wep = Arguments {
            wep_key: Some(vec!["xyz".to_string()]),
            ..Default::default()
        };
        assert!(SleuthRuntime::new(&bad_wep).is_err());

        let short_pass = Arguments {
            passphrase: Some(vec!["short".to_string()]),
            ..Default::default()
        };
        assert!(SleuthRuntime::new(&short_pass).is_err());
    }
}
