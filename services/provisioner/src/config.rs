//! Configuration for the provisioner.
//!
//! Connection settings come from `PVE_*` environment variables; engine
//! tuning has defaults and a few `PVX_*` overrides.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use pvx_reconcile::{RetryPolicy, DEFAULT_BACKOFF_STEP, DEFAULT_MAX_ATTEMPTS};

use crate::api::GuestKind;

/// Default request and task timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default interval between guest agent polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default deadline for the guest agent to report an address.
pub const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Connection settings for the platform API.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://pve.example.com:8006/api2/json`.
    pub api_url: String,

    /// Token id in `user@realm!name` form.
    pub token_id: String,

    /// Token secret.
    pub token_secret: String,

    /// Skip TLS certificate verification.
    pub tls_insecure: bool,

    /// Extra headers sent with every request.
    pub http_headers: Vec<(String, String)>,

    /// Per-request timeout, also bounds task waits.
    pub timeout: Duration,

    /// Log request and response bodies.
    pub debug: bool,
}

impl ClientConfig {
    /// Checks the settings for obvious mistakes.
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("PVE_API_URL '{}' is not a valid URL", self.api_url))?;

        if !self.token_id.contains('!') {
            bail!(
                "PVE_API_TOKEN_ID '{}' must have the form user@realm!token",
                self.token_id
            );
        }

        if self.token_secret.is_empty() {
            bail!("PVE_API_TOKEN_SECRET must not be empty");
        }

        if self.timeout.is_zero() {
            bail!("PVE_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// How device changes are sent to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentMode {
    /// Separate delete, create, move and resize calls before the main
    /// configuration update.
    Staged,

    /// Deletes and creates folded into the main configuration update;
    /// moves and resizes stay explicit.
    Inline,
}

/// How a guest with pending changes is restarted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartStrategy {
    /// Stop, then start.
    #[default]
    StopStart,

    /// The platform's reboot endpoint.
    Reboot,
}

impl std::str::FromStr for RestartStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop-start" => Ok(RestartStrategy::StopStart),
            "reboot" => Ok(RestartStrategy::Reboot),
            other => bail!("unknown restart strategy '{}' (expected stop-start or reboot)", other),
        }
    }
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on auto-assigned id collisions during create.
    pub create_retry: RetryPolicy,

    /// Interval between guest agent polls.
    pub poll_interval: Duration,

    /// Deadline for the guest agent to report an address.
    pub poll_deadline: Duration,

    /// Attachment mode for virtual machines.
    pub qemu_attachments: AttachmentMode,

    /// Attachment mode for containers.
    pub lxc_attachments: AttachmentMode,

    /// How to apply pending changes.
    pub restart_strategy: RestartStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            create_retry: RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF_STEP),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_deadline: DEFAULT_POLL_DEADLINE,
            qemu_attachments: AttachmentMode::Inline,
            lxc_attachments: AttachmentMode::Staged,
            restart_strategy: RestartStrategy::default(),
        }
    }
}

impl EngineConfig {
    pub fn attachment_mode(&self, kind: GuestKind) -> AttachmentMode {
        match kind {
            GuestKind::Qemu => self.qemu_attachments,
            GuestKind::Lxc => self.lxc_attachments,
        }
    }
}

/// Complete provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub client: ClientConfig,
    pub engine: EngineConfig,
}

impl ProviderConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("PVE_API_URL").context("PVE_API_URL is not set")?;
        let token_id = lookup("PVE_API_TOKEN_ID").context("PVE_API_TOKEN_ID is not set")?;
        let token_secret = lookup("PVE_API_TOKEN_SECRET").unwrap_or_default();

        let tls_insecure = lookup("PVE_TLS_INSECURE").map(|v| truthy(&v)).unwrap_or(false);
        let debug = lookup("PVE_DEBUG").map(|v| truthy(&v)).unwrap_or(false);

        let http_headers = match lookup("PVE_HTTP_HEADERS") {
            Some(raw) => parse_headers(&raw)?,
            None => Vec::new(),
        };

        let timeout_secs = match lookup("PVE_TIMEOUT") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("PVE_TIMEOUT '{}' is not a number of seconds", raw))?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let client = ClientConfig {
            api_url: api_url.trim_end_matches('/').to_string(),
            token_id,
            token_secret,
            tls_insecure,
            http_headers,
            timeout: Duration::from_secs(timeout_secs),
            debug,
        };
        client.validate()?;

        let mut engine = EngineConfig::default();
        if let Some(raw) = lookup("PVX_CREATE_ATTEMPTS") {
            let attempts = raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("PVX_CREATE_ATTEMPTS '{}' is not a number", raw))?;
            engine.create_retry = RetryPolicy::new(attempts, DEFAULT_BACKOFF_STEP);
        }
        if let Some(raw) = lookup("PVX_RESTART_STRATEGY") {
            engine.restart_strategy = raw.trim().parse()?;
        }

        Ok(Self { client, engine })
    }
}

/// Anything but `0` and `false` enables a flag.
fn truthy(value: &str) -> bool {
    let value = value.trim();
    !(value == "0" || value.eq_ignore_ascii_case("false"))
}

/// Parses `Key,Value,Key1,Value1`.
fn parse_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() % 2 != 0 {
        bail!("PVE_HTTP_HEADERS must hold an even number of comma separated items");
    }
    Ok(parts
        .chunks(2)
        .map(|pair| (pair[0].to_string(), pair[1].to_string()))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("PVE_API_URL", "https://pve.local:8006/api2/json/"),
        ("PVE_API_TOKEN_ID", "root@pam!pvx"),
        ("PVE_API_TOKEN_SECRET", "s3cret"),
    ];

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::from_lookup(env(&BASE)).unwrap();
        assert_eq!(config.client.api_url, "https://pve.local:8006/api2/json");
        assert_eq!(config.client.timeout, Duration::from_secs(60));
        assert!(!config.client.tls_insecure);
        assert!(!config.client.debug);
        assert_eq!(config.engine.restart_strategy, RestartStrategy::StopStart);
        assert_eq!(config.engine.create_retry.max_attempts(), 5);
        assert_eq!(config.engine.attachment_mode(GuestKind::Lxc), AttachmentMode::Staged);
        assert_eq!(config.engine.attachment_mode(GuestKind::Qemu), AttachmentMode::Inline);
    }

    #[test]
    fn test_flags_and_headers() {
        let mut pairs = BASE.to_vec();
        pairs.push(("PVE_TLS_INSECURE", "yes"));
        pairs.push(("PVE_DEBUG", "false"));
        pairs.push(("PVE_HTTP_HEADERS", "X-One,1,X-Two,2"));
        pairs.push(("PVE_TIMEOUT", "5"));
        let config = ProviderConfig::from_lookup(env(&pairs)).unwrap();

        assert!(config.client.tls_insecure);
        assert!(!config.client.debug);
        assert_eq!(config.client.timeout, Duration::from_secs(5));
        assert_eq!(
            config.client.http_headers,
            vec![
                ("X-One".to_string(), "1".to_string()),
                ("X-Two".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn test_rejects_bad_token_id() {
        let mut pairs = BASE.to_vec();
        pairs[1] = ("PVE_API_TOKEN_ID", "root@pam");
        let err = ProviderConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(err.to_string().contains("user@realm!token"));
    }

    #[test]
    fn test_rejects_empty_secret_and_zero_timeout() {
        let mut pairs = BASE.to_vec();
        pairs[2] = ("PVE_API_TOKEN_SECRET", "");
        assert!(ProviderConfig::from_lookup(env(&pairs)).is_err());

        let mut pairs = BASE.to_vec();
        pairs.push(("PVE_TIMEOUT", "0"));
        assert!(ProviderConfig::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn test_rejects_odd_headers() {
        let mut pairs = BASE.to_vec();
        pairs.push(("PVE_HTTP_HEADERS", "X-One,1,X-Two"));
        assert!(ProviderConfig::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn test_restart_strategy_override() {
        let mut pairs = BASE.to_vec();
        pairs.push(("PVX_RESTART_STRATEGY", "reboot"));
        let config = ProviderConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.engine.restart_strategy, RestartStrategy::Reboot);
    }
}
