//! 48-bit packet numbers and the per-slot replay counters built on them.
//!
//! CCMP/GCMP carry the PN as six bytes in the extended IV; TKIP splits it
//! into a 16-bit TSC low part and a 32-bit IV32 high part. Both collapse to
//! the same 48-bit ordered value here, so replay bookkeeping never has to
//! care which cipher produced the number.

use std::fmt;

const PN_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// A 48-bit packet number (PN / TSC / IPN) with total ordering.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pn(u64);

impl Pn {
    pub fn new(value: u64) -> Self {
        Pn(value & PN_MASK)
    }

    /// Reassemble from TKIP's split counter (IV32 high, IV16 low).
    pub fn from_tkip(iv32: u32, iv16: u16) -> Self {
        Pn(((iv32 as u64) << 16) | iv16 as u64)
    }

    /// Six bytes, least-significant first (the order EAPOL Key RSC and the
    /// BIP MME carry it in).
    pub fn from_le_bytes(bytes: &[u8; 6]) -> Self {
        let mut v = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        Pn(v)
    }

    pub fn to_le_bytes(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        for (i, b) in out.iter_mut().enumerate() {
            *b = (self.0 >> (8 * i)) as u8;
        }
        out
    }

    /// Six bytes, most-significant first (the order the CCM/GCM nonce wants).
    pub fn to_be_bytes(self) -> [u8; 6] {
        let mut out = self.to_le_bytes();
        out.reverse();
        out
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Pn((self.0 + 1) & PN_MASK)
    }

    pub fn iv32(self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn iv16(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for Pn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Replay counter for one (key slot, traffic class) pair.
///
/// The monotonicity invariant lives here: a packet number is new iff it is
/// strictly greater than the highest number previously accepted on this
/// slot. A rekey resets the slot, after which any PN is new again.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReplayCounter {
    last: Option<Pn>,
}

impl ReplayCounter {
    pub fn new() -> Self {
        ReplayCounter { last: None }
    }

    /// True if `pn` would be a replay (<= the stored counter).
    pub fn is_replay(&self, pn: Pn) -> bool {
        matches!(self.last, Some(last) if pn <= last)
    }

    /// Advance to `pn` after a successfully verified frame. Replays never
    /// move the counter.
    pub fn advance(&mut self, pn: Pn) {
        if !self.is_replay(pn) {
            self.last = Some(pn);
        }
    }

    /// Forget all history (PTK rekey, key slot reinstall).
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Seed from an out-of-band RSC (e.g. the GTK KDE's key RSC field).
    pub fn seed(&mut self, pn: Pn) {
        self.last = Some(pn);
    }

    pub fn current(&self) -> Option<Pn> {
        self.last
    }

    /// Next PN to use when we are the one encrypting on this slot.
    pub fn next_pn(&mut self) -> Pn {
        let pn = self.last.map(Pn::next).unwrap_or_else(|| Pn::new(1));
        self.last = Some(pn);
        pn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_numeric() {
        assert!(Pn::new(0x10000) > Pn::new(0xffff));
        assert!(Pn::from_tkip(1, 5) < Pn::from_tkip(1, 6));
        assert!(Pn::from_tkip(1, 0xffff) < Pn::from_tkip(2, 0));
    }

    #[test]
    fn byte_round_trip() {
        let pn = Pn::new(0x0123_4567_89ab);
        assert_eq!(Pn::from_le_bytes(&pn.to_le_bytes()), pn);
        let be = pn.to_be_bytes();
        assert_eq!(be[0], 0x01);
        assert_eq!(be[5], 0xab);
    }

    #[test]
    fn replay_monotonicity() {
        let mut rc = ReplayCounter::new();
        assert!(!rc.is_replay(Pn::new(5)));
        rc.advance(Pn::new(5));
        assert!(rc.is_replay(Pn::new(5)));
        assert!(rc.is_replay(Pn::new(4)));
        assert!(!rc.is_replay(Pn::new(6)));
        rc.advance(Pn::new(4));
        assert_eq!(rc.current(), Some(Pn::new(5)));
    }

    #[test]
    fn reset_accepts_any_pn() {
        let mut rc = ReplayCounter::new();
        rc.advance(Pn::new(1_000_000));
        rc.reset();
        assert!(!rc.is_replay(Pn::new(1)));
        rc.advance(Pn::new(1));
        assert_eq!(rc.current(), Some(Pn::new(1)));
    }

    #[test]
    fn tx_counter_advances() {
        let mut rc = ReplayCounter::new();
        assert_eq!(rc.next_pn(), Pn::new(1));
        assert_eq!(rc.next_pn(), Pn::new(2));
        rc.seed(Pn::new(100));
        assert_eq!(rc.next_pn(), Pn::new(101));
    }
}
