//! Capture file input: pcap and pcapng readers that hand out raw 802.11
//! frames with the radiotap header stripped and the FCS flag resolved.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use radiotap::Radiotap;

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// One 802.11 frame lifted out of the capture.
#[derive(Clone, Debug)]
pub struct CaptureFrame {
    pub data: Vec<u8>,
    pub timestamp: Duration,
    /// Whether `data` ends in a frame check sequence.
    pub fcs_present: bool,
}

pub enum FrameSource {
    Pcap(PcapReader<BufReader<File>>),
    PcapNg {
        reader: PcapNgReader<BufReader<File>>,
        linktypes: Vec<DataLink>,
    },
}

impl FrameSource {
    /// Open a capture file, sniffing pcap vs pcapng from the magic number.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(&path)
            .with_context(|| format!("opening {}", path.as_ref().display()))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).context("reading capture magic")?;
        file.seek(SeekFrom::Start(0))?;
        let reader = BufReader::new(file);
        if magic == PCAPNG_MAGIC {
            Ok(FrameSource::PcapNg {
                reader: PcapNgReader::new(reader).context("parsing pcapng header")?,
                linktypes: Vec::new(),
            })
        } else {
            Ok(FrameSource::Pcap(
                PcapReader::new(reader).context("parsing pcap header")?,
            ))
        }
    }

    /// Pull the next 802.11 frame, skipping blocks and link layers that do
    /// not carry one.
    pub fn next_frame(&mut self) -> Option<Result<CaptureFrame>> {
        loop {
            match self {
                FrameSource::Pcap(reader) => {
                    let linktype = reader.header().datalink;
                    let packet = match reader.next_packet()? {
                        Ok(packet) => packet,
                        Err(e) => return Some(Err(anyhow!(e))),
                    };
                    if let Some(frame) =
                        strip_link_layer(linktype, &packet.data, packet.timestamp)
                    {
                        return Some(Ok(frame));
                    }
                }
                FrameSource::PcapNg { reader, linktypes } => {
                    let block = match reader.next_block()? {
                        Ok(block) => block,
                        Err(e) => return Some(Err(anyhow!(e))),
                    };
                    match block {
                        Block::InterfaceDescription(idb) => {
                            linktypes.push(idb.linktype);
                        }
                        Block::EnhancedPacket(epb) => {
                            let linktype = linktypes
                                .get(epb.interface_id as usize)
                                .copied()
                                .unwrap_or(DataLink::IEEE802_11);
                            if let Some(frame) =
                                strip_link_layer(linktype, &epb.data, epb.timestamp)
                            {
                                return Some(Ok(frame));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Strip the per-packet link layer down to the bare 802.11 frame.
fn strip_link_layer(linktype: DataLink, data: &[u8], timestamp: Duration) -> Option<CaptureFrame> {
    match linktype {
        DataLink::IEEE802_11 => Some(CaptureFrame {
            data: data.to_vec(),
            timestamp,
            fcs_present: false,
        }),
        DataLink::IEEE802_11_RADIOTAP => {
            let radiotap = Radiotap::from_bytes(data).ok()?;
            if data.len() <= radiotap.header.length {
                return None;
            }
            Some(CaptureFrame {
                data: data[radiotap.header.length..].to_vec(),
                timestamp,
                fcs_present: radiotap.flags.map_or(false, |flags| flags.fcs),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
    use std::borrow::Cow;
    use std::time::Duration;

    fn sample_frame() -> Vec<u8> {
        // Minimal deauth frame.
        let mut frame = vec![0u8; 24];
        frame[0] = 0xc0;
        frame.extend_from_slice(&[3, 0]);
        frame
    }

    #[test]
    fn reads_raw_dot11_pcap() {
        let path = std::env::temp_dir().join("wlansleuth_capture_test.pcap");
        {
            let file = File::create(&path).unwrap();
            let header = PcapHeader {
                datalink: DataLink::IEEE802_11,
                ..Default::default()
            };
            let mut writer = PcapWriter::with_header(file, header).unwrap();
            let frame = sample_frame();
            writer
                .write_packet(&PcapPacket {
                    timestamp: Duration::from_secs(1),
                    orig_len: frame.len() as u32,
                    data: Cow::Borrowed(&frame),
                })
                .unwrap();
        }
        let mut source = FrameSource::open(&path).unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.data, sample_frame());
        assert_eq!(frame.timestamp, Duration::from_secs(1));
        assert!(!frame.fcs_present);
        assert!(source.next_frame().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn radiotap_header_is_stripped() {
        // Version 0, length 8, empty present word.
        let mut data = vec![0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];
        data.extend_from_slice(&sample_frame());
        let frame = strip_link_layer(DataLink::IEEE802_11_RADIOTAP, &data, Duration::ZERO).unwrap();
        assert_eq!(frame.data, sample_frame());
        assert!(!frame.fcs_present);
    }
}
