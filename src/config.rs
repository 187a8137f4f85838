use clap::Parser;

#[derive(Parser, Default, Clone)]
#[command(name = "wlansleuth")]
#[command(about = "Decrypts and audits 802.11 protected traffic from capture files.", long_about = None)]
#[command(version)]
pub struct Arguments {
    /// Capture file to read (pcap or pcapng, radiotap or raw 802.11).
    #[arg(short = 'r', long, name = "capture", help = "Capture File")]
    pub capture: String,

    /// Optional - WEP key (hex 10/26 digits or ASCII 5/13 chars). Repeatable.
    #[arg(
        short = 'w',
        long,
        help_heading = "Key Material",
        name = "wep_key",
        help = "WEP Key"
    )]
    pub wep_key: Option<Vec<String>>,

    /// Optional - WPA/WPA2 passphrase. Repeatable.
    #[arg(
        short = 'p',
        long,
        help_heading = "Key Material",
        name = "passphrase",
        help = "Passphrase"
    )]
    pub passphrase: Option<Vec<String>>,

    /// Optional - Raw PMK as 64 hex digits. Repeatable.
    #[arg(long, help_heading = "Key Material", name = "pmk", help = "PMK (hex)")]
    pub pmk: Option<Vec<String>>,

    /// Optional - Raw PTK (KCK|KEK|TK) as hex. Tried against traffic with no
    /// captured handshake. Repeatable.
    #[arg(long, help_heading = "Key Material", name = "ptk", help = "PTK (hex)")]
    pub ptk: Option<Vec<String>>,

    /// Optional - Treat protocol violations (replays, reserved bits, bad key
    /// IDs) as rejections instead of logged warnings.
    #[arg(long, help_heading = "Advanced Options", name = "strict")]
    pub strict: bool,

    /// Optional - Write decrypted frames to this pcap file.
    #[arg(short = 'o', long, name = "output", help = "Output Filename")]
    pub output: Option<String>,

    /// Optional - Suppress the per-frame event log, print the summary only.
    #[arg(short = 'q', long, help_heading = "Advanced Options", name = "quiet")]
    pub quiet: bool,
}
