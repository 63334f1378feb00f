use url::Url;

use crate::identity::PeerId;
use crate::signaling::SignalingError;
use crate::transmission::DEFAULT_MESSAGE_SIZE;

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com";
pub const DEFAULT_STUN_PORT: u16 = 19302;
pub const DEFAULT_SIGNALING_SERVER: &str = "localhost";
pub const DEFAULT_SIGNALING_PORT: u16 = 8000;
pub const DEFAULT_DURATION_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServer {
    pub host: String,
    pub port: u16,
}

impl StunServer {
    /// `stun:<host>:<port>`, adding the scheme when the host does not carry it.
    pub fn url(&self) -> String {
        if self.host.starts_with("stun:") {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("stun:{}:{}", self.host, self.port)
        }
    }
}

impl Default for StunServer {
    fn default() -> Self {
        Self {
            host: DEFAULT_STUN_SERVER.to_string(),
            port: DEFAULT_STUN_PORT,
        }
    }
}

/// Resolved settings for one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    pub signaling_server: String,
    pub signaling_port: u16,
    /// `None` runs without a reflexive-address server.
    pub stun: Option<StunServer>,
    /// Seconds of stats output; `0` runs until interrupted.
    pub duration_secs: u64,
    pub message_size: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            signaling_server: DEFAULT_SIGNALING_SERVER.to_string(),
            signaling_port: DEFAULT_SIGNALING_PORT,
            stun: Some(StunServer::default()),
            duration_secs: DEFAULT_DURATION_SECS,
            message_size: DEFAULT_MESSAGE_SIZE,
        }
    }
}

impl BenchConfig {
    /// `ws://<host>:<port>/<local_id>`; a `ws://` or `wss://` scheme already
    /// present on the server is kept.
    pub fn relay_url(&self, local_id: &PeerId) -> Result<Url, SignalingError> {
        let server = self.signaling_server.as_str();
        let prefix = if server.starts_with("ws://") || server.starts_with("wss://") {
            ""
        } else {
            "ws://"
        };
        let raw = format!("{prefix}{server}:{}/{local_id}", self.signaling_port);
        Url::parse(&raw).map_err(|err| SignalingError::InvalidUrl {
            url: raw.clone(),
            reason: err.to_string(),
        })
    }

    pub fn ice_servers(&self) -> Vec<String> {
        self.stun.iter().map(StunServer::url).collect()
    }

    /// Number of stats ticks to run, or `None` for no limit.
    pub fn ticks(&self) -> Option<u64> {
        (self.duration_secs > 0).then_some(self.duration_secs)
    }
}
