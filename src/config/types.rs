use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration for sessiond
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listeners accept incoming connections/datagrams
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

/// Transport kind for a listener
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Connection-oriented (TCP)
    #[default]
    Stream,
    /// Connectionless (UDP); one datagram = one bounded session
    Datagram,
}

impl Transport {
    pub fn is_stream(&self) -> bool {
        matches!(self, Transport::Stream)
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Listener name (for logging/metrics)
    pub name: String,

    /// Bind address (default: all interfaces)
    pub bind: Option<IpAddr>,

    /// Listen port
    pub port: u16,

    /// Accept backlog (stream only)
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Transport kind
    #[serde(default)]
    pub transport: Transport,

    /// Name of the registered packet handler for this listener
    #[serde(default = "default_handler")]
    pub handler: String,

    /// Packet framing policy
    #[serde(default)]
    pub framing: FramingConfig,

    /// Session/idle/packet timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Linger on close
    #[serde(default = "default_linger", with = "humantime_serde")]
    pub linger: Duration,

    /// Prompt bytes written before each read (stream only)
    pub prompt: Option<String>,

    /// Write an automatic "N> " prompt (text mode only)
    #[serde(default)]
    pub auto_prompt: bool,

    /// Treat a mid-packet read timeout as fatal to the session
    #[serde(default = "default_true")]
    pub terminate_on_timeout: bool,

    /// Datagram response port override (default: the inbound source port)
    pub response_port: Option<u16>,
}

impl ListenerConfig {
    /// Socket address this listener binds to.
    pub fn address(&self) -> SocketAddr {
        let ip = self
            .bind
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }
}

fn default_backlog() -> u32 {
    50
}

fn default_handler() -> String {
    "echo".to_string()
}

fn default_linger() -> Duration {
    Duration::from_secs(4)
}

fn default_true() -> bool {
    true
}

/// Packet framing policy settings
#[derive(Debug, Clone, Deserialize)]
pub struct FramingConfig {
    /// Text/line mode (false = binary/packet mode)
    #[serde(default = "default_true")]
    pub text: bool,

    /// Line terminator bytes
    #[serde(default = "default_line_terminators")]
    pub line_terminators: Vec<u8>,

    /// Bytes dropped from the input (text mode, typically CR)
    #[serde(default = "default_ignore")]
    pub ignore: Vec<u8>,

    /// Bytes treated as a one-byte erase (only while a prompt is active)
    #[serde(default = "default_backspace")]
    pub backspace: Vec<u8>,

    /// Include the terminator byte in returned packets
    #[serde(default)]
    pub include_terminator: bool,

    /// Minimum packet length before the handler is consulted (0 = default)
    #[serde(default)]
    pub min_length: usize,

    /// Hard maximum packet length (0 = default: text 2048, binary 1024)
    #[serde(default)]
    pub max_length: usize,

    /// Fixed packet-terminator byte pattern (binary mode; substitutes for
    /// handler length consultation)
    pub terminator_pattern: Option<Vec<u8>>,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            text: true,
            line_terminators: default_line_terminators(),
            ignore: default_ignore(),
            backspace: default_backspace(),
            include_terminator: false,
            min_length: 0,
            max_length: 0,
            terminator_pattern: None,
        }
    }
}

fn default_line_terminators() -> Vec<u8> {
    vec![b'\n']
}

fn default_ignore() -> Vec<u8> {
    vec![b'\r']
}

fn default_backspace() -> Vec<u8> {
    vec![0x08]
}

/// Timeout settings; unset means unbounded
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutConfig {
    /// Absolute session deadline from session start
    #[serde(default, with = "humantime_serde::opt")]
    pub session: Option<Duration>,

    /// Time allowed for the first byte of a packet to arrive
    #[serde(default, with = "humantime_serde::opt")]
    pub idle: Option<Duration>,

    /// Time allowed to complete a packet, measured from its first byte
    #[serde(default, with = "humantime_serde::opt")]
    pub packet: Option<Duration>,
}

/// Global settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod opt {
        use serde::{self, Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<String>::deserialize(deserializer)? {
                Some(s) => humantime::parse_duration(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
