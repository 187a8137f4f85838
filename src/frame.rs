//! Minimal 802.11 MAC frame model.
//!
//! The decrypt path needs byte-level access to the header (masked frame
//! control for AAD construction, address fields by ToDS/FromDS mode, QoS
//! TID) that fully-parsed frame libraries hide, so the header model is kept
//! small and raw here.

use std::fmt;
use std::str::FromStr;

pub const ETHERTYPE_EAPOL: u16 = 0x888e;
pub const ETHERTYPE_TDLS: u16 = 0x890d;

pub const FC_PROTECTED: u16 = 0x4000;
pub const FC_RETRY: u16 = 0x0800;
pub const FC_PWR_MGT: u16 = 0x1000;
pub const FC_MORE_DATA: u16 = 0x2000;
pub const FC_ORDER: u16 = 0x8000;
pub const FC_TO_DS: u16 = 0x0100;
pub const FC_FROM_DS: u16 = 0x0200;

// Management subtypes.
pub const STYPE_ASSOC_REQ: u8 = 0;
pub const STYPE_ASSOC_RESP: u8 = 1;
pub const STYPE_REASSOC_REQ: u8 = 2;
pub const STYPE_REASSOC_RESP: u8 = 3;
pub const STYPE_PROBE_RESP: u8 = 5;
pub const STYPE_BEACON: u8 = 8;
pub const STYPE_DISASSOC: u8 = 10;
pub const STYPE_AUTH: u8 = 11;
pub const STYPE_DEAUTH: u8 = 12;
pub const STYPE_ACTION: u8 = 13;

/// The "no QoS" slot of the 17-entry per-TID counter arrays.
pub const TID_NON_QOS: usize = 16;

#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// Group bit (I/G) of the first octet.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(MacAddress(arr))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(format!("Invalid MAC address: {}", s));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] =
                u8::from_str_radix(part, 16).map_err(|_| format!("Invalid MAC address: {}", s))?;
        }
        Ok(MacAddress(bytes))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    Management,
    Control,
    Data,
    Extension,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameControl(pub u16);

impl FrameControl {
    pub fn ftype(&self) -> FrameType {
        match (self.0 >> 2) & 0x3 {
            0 => FrameType::Management,
            1 => FrameType::Control,
            2 => FrameType::Data,
            _ => FrameType::Extension,
        }
    }

    pub fn subtype(&self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    pub fn to_ds(&self) -> bool {
        self.0 & FC_TO_DS != 0
    }

    pub fn from_ds(&self) -> bool {
        self.0 & FC_FROM_DS != 0
    }

    pub fn protected(&self) -> bool {
        self.0 & FC_PROTECTED != 0
    }

    pub fn retry(&self) -> bool {
        self.0 & FC_RETRY != 0
    }

    pub fn order(&self) -> bool {
        self.0 & FC_ORDER != 0
    }

    pub fn is_qos_data(&self) -> bool {
        self.ftype() == FrameType::Data && self.subtype() & 0x08 != 0
    }

    pub fn is_null_data(&self) -> bool {
        self.ftype() == FrameType::Data && self.subtype() & 0x04 != 0
    }
}

/// Distribution-system addressing mode of a data frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DsMode {
    /// IBSS or direct (TDLS) link: neither ToDS nor FromDS.
    Direct,
    FromDs,
    ToDs,
    Wds,
}

/// Parsed MAC header. `hdr_len` is the offset of the frame body within the
/// original frame bytes (past any Address 4 / QoS Control / HT Control).
#[derive(Clone, Debug)]
pub struct Dot11Header {
    pub fc: FrameControl,
    pub duration: u16,
    pub addr1: MacAddress,
    pub addr2: MacAddress,
    pub addr3: MacAddress,
    pub seq_ctrl: u16,
    pub addr4: Option<MacAddress>,
    pub qos: Option<u16>,
    pub hdr_len: usize,
}

impl Dot11Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < 24 {
            return Err(format!("Frame too short for MAC header: {}", bytes.len()));
        }
        let fc = FrameControl(u16::from_le_bytes([bytes[0], bytes[1]]));
        let duration = u16::from_le_bytes([bytes[2], bytes[3]]);
        let addr1 = MacAddress(bytes[4..10].try_into().map_err(|_| "addr1")?);
        let addr2 = MacAddress(bytes[10..16].try_into().map_err(|_| "addr2")?);
        let addr3 = MacAddress(bytes[16..22].try_into().map_err(|_| "addr3")?);
        let seq_ctrl = u16::from_le_bytes([bytes[22], bytes[23]]);

        let mut offset = 24;
        let mut addr4 = None;
        let mut qos = None;

        if fc.ftype() == FrameType::Data {
            if fc.to_ds() && fc.from_ds() {
                if bytes.len() < offset + 6 {
                    return Err("Frame too short for Address 4".to_string());
                }
                addr4 = MacAddress::from_slice(&bytes[offset..offset + 6]);
                offset += 6;
            }
            if fc.is_qos_data() {
                if bytes.len() < offset + 2 {
                    return Err("Frame too short for QoS Control".to_string());
                }
                qos = Some(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]));
                offset += 2;
                // Order bit on a QoS frame means an HT Control field follows.
                if fc.order() {
                    if bytes.len() < offset + 4 {
                        return Err("Frame too short for HT Control".to_string());
                    }
                    offset += 4;
                }
            }
        }

        Ok(Dot11Header {
            fc,
            duration,
            addr1,
            addr2,
            addr3,
            seq_ctrl,
            addr4,
            qos,
            hdr_len: offset,
        })
    }

    pub fn ds_mode(&self) -> DsMode {
        match (self.fc.to_ds(), self.fc.from_ds()) {
            (false, false) => DsMode::Direct,
            (false, true) => DsMode::FromDs,
            (true, false) => DsMode::ToDs,
            (true, true) => DsMode::Wds,
        }
    }

    /// BSSID by addressing mode. Management frames carry it in Address 3;
    /// WDS frames have no single BSSID, the receiver address stands in.
    pub fn bssid(&self) -> MacAddress {
        if self.fc.ftype() != FrameType::Data {
            return self.addr3;
        }
        match self.ds_mode() {
            DsMode::Direct => self.addr3,
            DsMode::FromDs => self.addr2,
            DsMode::ToDs => self.addr1,
            DsMode::Wds => self.addr1,
        }
    }

    pub fn da(&self) -> MacAddress {
        if self.fc.ftype() != FrameType::Data {
            return self.addr1;
        }
        match self.ds_mode() {
            DsMode::Direct | DsMode::FromDs => self.addr1,
            DsMode::ToDs | DsMode::Wds => self.addr3,
        }
    }

    pub fn sa(&self) -> MacAddress {
        if self.fc.ftype() != FrameType::Data {
            return self.addr2;
        }
        match self.ds_mode() {
            DsMode::Direct | DsMode::ToDs => self.addr2,
            DsMode::FromDs => self.addr3,
            DsMode::Wds => self.addr4.unwrap_or(self.addr2),
        }
    }

    /// The non-AP peer of an infrastructure data frame.
    pub fn station_addr(&self) -> MacAddress {
        match self.ds_mode() {
            DsMode::ToDs => self.addr2,
            _ => self.addr1,
        }
    }

    /// TID index into the 17-slot counter arrays (16 = non-QoS).
    pub fn tid(&self) -> usize {
        self.qos
            .map(|q| (q & 0x0f) as usize)
            .unwrap_or(TID_NON_QOS)
    }

    /// A-MSDU Present bit of the QoS Control field.
    pub fn amsdu(&self) -> bool {
        self.qos.map(|q| q & 0x0080 != 0).unwrap_or(false)
    }
}

/// Parse an LLC/SNAP header, returning (ethertype, payload).
pub fn parse_llc_snap(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 8 {
        return None;
    }
    if data[0] != 0xaa || data[1] != 0xaa || data[2] != 0x03 {
        return None;
    }
    // OUI 00:00:00 (RFC 1042) or 00:00:f8 (Bridge-Tunnel).
    if data[3] != 0x00 || data[4] != 0x00 || (data[5] != 0x00 && data[5] != 0xf8) {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[6], data[7]]);
    Some((ethertype, &data[8..]))
}

/// One A-MSDU subframe: destination, source, MSDU payload.
pub struct AmsduSubframe<'a> {
    pub da: MacAddress,
    pub sa: MacAddress,
    pub payload: &'a [u8],
}

/// Split an A-MSDU body into its subframes. Truncated trailing data is
/// dropped rather than reported; the dispatcher treats it as malformed
/// input per the error model.
pub fn parse_amsdu(mut data: &[u8]) -> Vec<AmsduSubframe<'_>> {
    let mut out = Vec::new();
    while data.len() >= 14 {
        let da = match MacAddress::from_slice(&data[0..6]) {
            Some(m) => m,
            None => break,
        };
        let sa = match MacAddress::from_slice(&data[6..12]) {
            Some(m) => m,
            None => break,
        };
        let len = u16::from_be_bytes([data[12], data[13]]) as usize;
        if data.len() < 14 + len {
            break;
        }
        out.push(AmsduSubframe {
            da,
            sa,
            payload: &data[14..14 + len],
        });
        // Subframes are padded to 4-byte boundaries, except the last.
        let consumed = 14 + len;
        let padded = (consumed + 3) & !3;
        if padded >= data.len() {
            break;
        }
        data = &data[padded..];
    }
    out
}

/// Strip the Mesh Control field from the front of a mesh data MSDU.
pub fn strip_mesh_control(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 6 {
        return None;
    }
    // Flags byte: low two bits give the address extension mode.
    let ae = data[0] & 0x03;
    let len = match ae {
        0 => 6,
        1 => 12,
        2 => 18,
        _ => return None,
    };
    data.get(len..)
}
