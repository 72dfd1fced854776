use std::env;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::signaling::CandidatePolicy;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9000/ws";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:9000";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// How a viewer reaches the relay.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub relay_url: Url,
    /// Append `role=frontend&device_id=<key>` to the connect URL.
    pub identify_in_query: bool,
    pub connect_timeout: Duration,
    /// Interval between websocket ping frames; `None` disables them.
    pub keepalive: Option<Duration>,
}

impl ChannelConfig {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            identify_in_query: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }

    pub fn endpoint_for(&self, device_key: &str) -> Url {
        let mut url = self.relay_url.clone();
        if self.identify_in_query {
            url.query_pairs_mut()
                .append_pair("role", "frontend")
                .append_pair("device_id", device_key);
        }
        url
    }
}

/// Runtime configuration for the relay client.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub channel: ChannelConfig,
    pub api_url: Url,
    pub api_token: Option<String>,
    pub ice_servers: Vec<String>,
    pub candidate_policy: CandidatePolicy,
    pub sample_rate: u32,
}

impl RelayConfig {
    /// The built-in defaults, before any environment overrides.
    pub fn defaults() -> Result<Self, ConfigError> {
        let api_url = Url::parse(DEFAULT_API_URL).map_err(|err| ConfigError::Invalid {
            name: "DEVICE_API_URL",
            reason: err.to_string(),
        })?;
        Ok(Self {
            channel: ChannelConfig::new(websocket_url(DEFAULT_RELAY_URL)?),
            api_url,
            api_token: None,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            candidate_policy: CandidatePolicy::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        })
    }

    /// Load configuration from `DEVICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::defaults()?;
        let value = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(raw) = value("DEVICE_RELAY_URL") {
            config.channel.relay_url = websocket_url(&raw)?;
        }
        if let Some(raw) = value("DEVICE_API_URL") {
            config.api_url = Url::parse(raw.trim()).map_err(|err| ConfigError::Invalid {
                name: "DEVICE_API_URL",
                reason: err.to_string(),
            })?;
        }
        config.api_token = value("DEVICE_API_TOKEN");

        if value("DEVICE_LOCALHOST_ONLY").is_some_and(|v| v != "0") {
            config.ice_servers.clear();
        } else if let Some(raw) = value("DEVICE_ICE_SERVERS") {
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = value("DEVICE_ICE_POLICY") {
            config.candidate_policy = raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "DEVICE_ICE_POLICY",
                reason,
            })?;
        }
        if let Some(raw) = value("DEVICE_AUDIO_SAMPLE_RATE") {
            config.sample_rate = parse_number("DEVICE_AUDIO_SAMPLE_RATE", &raw)?;
            if config.sample_rate == 0 {
                return Err(ConfigError::Invalid {
                    name: "DEVICE_AUDIO_SAMPLE_RATE",
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if let Some(raw) = value("DEVICE_KEEPALIVE_SECS") {
            let secs: u64 = parse_number("DEVICE_KEEPALIVE_SECS", &raw)?;
            config.channel.keepalive = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = value("DEVICE_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = parse_number("DEVICE_CONNECT_TIMEOUT_SECS", &raw)?;
            config.channel.connect_timeout = Duration::from_secs(secs.max(1));
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

/// Accepts `ws(s)://` as-is and maps `http(s)://` onto the matching
/// websocket scheme.
pub fn websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "relay url",
        reason,
    };
    let mut url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket scheme".into()))?;
    Ok(url)
}
