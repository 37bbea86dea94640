use std::{env, time::Duration};

pub(crate) const DEFAULT_STREAMS: &[&str] = &["pow", "met"];

const DEFAULT_UPSTREAM_URL: &str = "wss://localhost:6868";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

#[derive(Clone, Debug)]
pub(crate) struct BridgeConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) upstream_url: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) streams: Vec<String>,
    pub(crate) handshake_timeout: Duration,
}

impl BridgeConfig {
    pub(crate) fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("BRIDGE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = lookup("BRIDGE_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(8080);

        let upstream_url = lookup("BRIDGE_UPSTREAM_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());

        let client_id = required(&lookup, "BRIDGE_CLIENT_ID")?;
        let client_secret = required(&lookup, "BRIDGE_CLIENT_SECRET")?;

        let streams = match lookup("BRIDGE_STREAMS") {
            Some(raw) => parse_csv(&raw),
            None => DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
        };
        if streams.is_empty() {
            return Err("BRIDGE_STREAMS must name at least one stream.".to_string());
        }

        let timeout_ms = lookup("BRIDGE_HANDSHAKE_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS)
            .clamp(100, 120_000);

        Ok(Self {
            host,
            port,
            upstream_url,
            client_id,
            client_secret,
            streams,
            handshake_timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub(crate) fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn required<F>(lookup: &F, name: &str) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{name} is required. Use the client credentials issued for this bridge."))
}

/// Splits a comma-separated list, keeping first-seen order and dropping repeats.
fn parse_csv(raw: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if !entries.iter().any(|e| e == entry) {
            entries.push(entry.to_string());
        }
    }
    entries
}

#[cfg(test)]
pub(crate) fn test_config(upstream_url: &str) -> BridgeConfig {
    BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_url: upstream_url.to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        streams: DEFAULT_STREAMS.iter().map(|s| s.to_string()).collect(),
        handshake_timeout: Duration::from_secs(2),
    }
}
