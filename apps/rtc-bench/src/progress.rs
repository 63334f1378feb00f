use std::fmt;

use crate::identity::PeerId;

const BANNER_RULE: &str = "###########################################";

/// Operator-facing lines printed on stdout as a benchmark progresses,
/// independent of the configured log level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    CreatingChannel { label: String },
    ChannelReceived { peer: PeerId, label: String },
    ChannelOpen { peer: PeerId },
    ChannelClosed { peer: PeerId },
    SendFailed { peer: PeerId, error: String },
    SignalingClosed,
}

impl Progress {
    pub fn announce(&self) {
        println!("{self}");
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::CreatingChannel { label } => {
                write!(f, "Creating DataChannel with label \"{label}\"")
            }
            Progress::ChannelReceived { peer, label } => {
                writeln!(f, "DataChannel from {peer} received with label \"{label}\"")?;
                writeln!(f, "Starting benchmark test. Sending data...")?;
                writeln!(f, "{BANNER_RULE}")?;
                writeln!(f, "### Check other peer's screen for stats ###")?;
                write!(f, "{BANNER_RULE}")
            }
            Progress::ChannelOpen { peer } => {
                writeln!(f, "DataChannel from {peer} open")?;
                write!(f, "Starting benchmark test. Sending data...")
            }
            Progress::ChannelClosed { peer } => write!(f, "DataChannel from {peer} closed"),
            Progress::SendFailed { peer, error } => {
                write!(f, "Send to {peer} failed: {error}")
            }
            Progress::SignalingClosed => write!(f, "WebSocket closed"),
        }
    }
}
