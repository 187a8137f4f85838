use std::borrow::Cow;
use std::fs::File;

use anyhow::{Context, Result};
use clap::Parser;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use wlansleuth::capture::FrameSource;
use wlansleuth::config::Arguments;
use wlansleuth::processing::process_frame;
use wlansleuth::runtime::SleuthRuntime;
use wlansleuth::status::MessageType;

fn main() -> Result<()> {
    let args = Arguments::parse();

    let default_filter = if args.quiet { "warn" } else { "info" };
    Registry::default()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut rt = SleuthRuntime::new(&args)?;
    let mut source = FrameSource::open(&args.capture)?;

    while let Some(frame) = source.next_frame() {
        let frame = frame?;
        rt.frame_ts = frame.timestamp;
        if let Err(e) = process_frame(&mut rt, &frame.data, frame.fcs_present) {
            rt.log(MessageType::Trace, format!("skipping frame: {e}"));
        }
    }

    if let Some(path) = &args.output {
        write_decrypted(&rt, path)
            .with_context(|| format!("writing decrypted frames to {path}"))?;
    }

    let c = rt.counters;
    println!("frames processed:   {}", c.frames);
    println!("bad FCS:            {}", c.fcs_failures);
    println!("decrypted:          {}", c.decrypted);
    println!("decrypt failures:   {}", c.decrypt_failures);
    println!("replays detected:   {}", c.replays);
    println!("EAPOL frames:       {}", c.eapol_frames);
    println!("TDLS actions:       {}", c.tdls_actions);
    println!(
        "BSSes / stations:   {} / {}",
        rt.store.bss.len(),
        rt.store.bss.values().map(|b| b.stations.len()).sum::<usize>()
    );
    Ok(())
}

fn write_decrypted(rt: &SleuthRuntime, path: &str) -> Result<()> {
    let file = File::create(path)?;
    let header = PcapHeader {
        datalink: DataLink::IEEE802_11,
        ..Default::default()
    };
    let mut writer = PcapWriter::with_header(file, header)?;
    for (timestamp, frame) in &rt.decrypted_frames {
        writer.write_packet(&PcapPacket {
            timestamp: *timestamp,
            orig_len: frame.len() as u32,
            data: Cow::Borrowed(frame),
        })?;
    }
    Ok(())
}
