//! TOML configuration for the gateway binary.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mpgate_channel::{resolve_accounts, ChannelAccountConfig, SharedAccount};
use mpgate_core::file_lock::{DEFAULT_LOCK_STALE_MS, DEFAULT_LOCK_TIMEOUT_MS};
use mpgate_runtime::safe_fetch::{
    DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL_MS, DEFAULT_FETCH_TIMEOUT_MS,
    DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RESPONSE_BYTES,
};
use mpgate_runtime::{SafeFetchConfig, SsrfProtectionConfig};
use serde::Deserialize;

const DEFAULT_BIND: &str = "127.0.0.1:8787";
const DEFAULT_STATE_DIR: &str = ".mpgate";
const DEFAULT_CHANNEL: &str = "wechat";
const DEFAULT_APPROVAL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_AGENT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct GatewayConfig {
    #[serde(default)]
    pub(crate) server: ServerSection,
    #[serde(default)]
    pub(crate) accounts: Vec<ChannelAccountConfig>,
    #[serde(default)]
    pub(crate) fetch: FetchSection,
    #[serde(default)]
    pub(crate) pairing: PairingSection,
    #[serde(default)]
    pub(crate) agent: AgentSection,
    /// Text dispatched for menu button clicks, written to the menu payload store at startup.
    #[serde(default)]
    pub(crate) menu: Vec<MenuEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct MenuEntry {
    pub(crate) account_id: String,
    pub(crate) event_key: String,
    pub(crate) text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct ServerSection {
    pub(crate) bind: String,
    pub(crate) state_dir: PathBuf,
    pub(crate) channel: String,
    pub(crate) max_webhook_body_bytes: usize,
    pub(crate) max_pair_body_bytes: usize,
    pub(crate) pair_rate_limit_window_ms: u64,
    pub(crate) pair_rate_limit_max_requests: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let gateway = mpgate_gateway::GatewayServerConfig::default();
        Self {
            bind: DEFAULT_BIND.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            channel: DEFAULT_CHANNEL.to_string(),
            max_webhook_body_bytes: gateway.max_webhook_body_bytes,
            max_pair_body_bytes: gateway.max_pair_body_bytes,
            pair_rate_limit_window_ms: gateway.pair_rate_limit_window_ms,
            pair_rate_limit_max_requests: gateway.pair_rate_limit_max_requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct FetchSection {
    pub(crate) timeout_ms: u64,
    pub(crate) max_response_bytes: usize,
    pub(crate) max_redirects: usize,
    pub(crate) max_concurrent_requests: usize,
    pub(crate) cache_ttl_ms: u64,
    pub(crate) cache_max_entries: usize,
    pub(crate) allow_http: bool,
    pub(crate) allow_private_network: bool,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            allow_http: true,
            allow_private_network: false,
        }
    }
}

impl FetchSection {
    pub(crate) fn to_safe_fetch_config(&self) -> SafeFetchConfig {
        SafeFetchConfig {
            timeout_ms: self.timeout_ms,
            max_response_bytes: self.max_response_bytes,
            max_redirects: self.max_redirects,
            max_concurrent_requests: self.max_concurrent_requests,
            cache_ttl_ms: self.cache_ttl_ms,
            cache_max_entries: self.cache_max_entries,
            ssrf: SsrfProtectionConfig {
                enabled: true,
                allow_http: self.allow_http,
                allow_private_network: self.allow_private_network,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct PairingSection {
    /// Defaults to `<state_dir>/allowlist.json`.
    pub(crate) allowlist_file: Option<PathBuf>,
    /// Program followed by arguments; `{channel}`, `{code}`, `{subject}` are substituted.
    pub(crate) approval_command: Vec<String>,
    pub(crate) approval_timeout_ms: u64,
    pub(crate) code_ttl_ms: u64,
    pub(crate) max_pending_codes_per_account: usize,
    pub(crate) snapshot_ttl_ms: u64,
    pub(crate) lock_timeout_ms: u64,
    pub(crate) lock_stale_ms: u64,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            allowlist_file: None,
            approval_command: Vec::new(),
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            code_ttl_ms: mpgate_access::pairing_codes::DEFAULT_PAIRING_CODE_TTL_MS,
            max_pending_codes_per_account:
                mpgate_access::pairing_codes::DEFAULT_MAX_PENDING_CODES_PER_ACCOUNT,
            snapshot_ttl_ms: 10_000,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_stale_ms: DEFAULT_LOCK_STALE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub(crate) struct AgentSection {
    pub(crate) endpoint: Option<String>,
    pub(crate) timeout_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
        }
    }
}

pub(crate) fn load_gateway_config(path: &Path) -> Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_gateway_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}

pub(crate) fn parse_gateway_config(raw: &str) -> Result<GatewayConfig> {
    toml::from_str(raw).context("failed to parse TOML")
}

impl GatewayConfig {
    pub(crate) fn apply_overrides(&mut self, bind: Option<String>, state_dir: Option<PathBuf>) {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        if let Some(state_dir) = state_dir {
            self.server.state_dir = state_dir;
        }
    }

    /// Checks cross-field constraints and returns the enabled, resolved accounts.
    pub(crate) fn validate(&self) -> Result<Vec<SharedAccount>> {
        let bind = self.server.bind.as_str();
        bind.parse::<SocketAddr>()
            .with_context(|| format!("server.bind '{bind}' is not a socket address"))?;
        if self.server.channel.trim().is_empty() {
            bail!("server.channel must not be empty");
        }
        if let Some(program) = self.pairing.approval_command.first() {
            if program.trim().is_empty() {
                bail!("pairing.approval_command program must not be empty");
            }
        }
        if let Some(endpoint) = self.agent.endpoint.as_deref() {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                bail!("agent.endpoint must be an http(s) URL");
            }
        }
        let accounts = resolve_accounts(&self.accounts).context("invalid [[accounts]] entry")?;
        if accounts.is_empty() {
            bail!("no enabled accounts configured");
        }
        for entry in &self.menu {
            if entry.event_key.trim().is_empty() || entry.text.trim().is_empty() {
                bail!("[[menu]] entries need a non-empty event_key and text");
            }
            if !self
                .accounts
                .iter()
                .any(|account| account.account_id == entry.account_id)
            {
                bail!(
                    "[[menu]] entry '{}' references unknown account '{}'",
                    entry.event_key,
                    entry.account_id
                );
            }
        }
        Ok(accounts)
    }

    pub(crate) fn media_dir(&self) -> PathBuf {
        self.server.state_dir.join("media")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
bind = "0.0.0.0:9000"
state_dir = "/var/lib/mpgate"

[[accounts]]
account_id = "main"
app_id = "wx123"
app_secret = "s3cret"
token = "tok"
encoding_aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG"
webhook_path = "/wechat/"
pairing_token = "pair"
unpaired_policy = "pairing_hint"

[[accounts]]
account_id = "backup"
app_id = "wx456"
token = "tok2"
enabled = false

[fetch]
timeout_ms = 5000

[pairing]
approval_command = ["/usr/local/bin/approve", "{subject}"]

[agent]
endpoint = "http://127.0.0.1:7000/dispatch"

[[menu]]
account_id = "main"
event_key = "V1001_TODAY"
text = "today's news"
"#;

    #[test]
    fn functional_sample_config_parses_and_validates() {
        let config = parse_gateway_config(SAMPLE).expect("parse");
        assert_eq!(config.server.channel, "wechat");
        assert_eq!(config.fetch.timeout_ms, 5_000);
        assert_eq!(config.fetch.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert_eq!(config.pairing.approval_command.len(), 2);
        assert_eq!(config.menu.len(), 1);
        assert_eq!(config.menu[0].event_key, "V1001_TODAY");
        assert_eq!(
            config.media_dir(),
            PathBuf::from("/var/lib/mpgate").join("media")
        );

        let accounts = config.validate().expect("validate");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].webhook_path, "/wechat");
        assert!(accounts[0].cipher.is_some());
        assert_eq!(
            accounts[0].unpaired_policy,
            mpgate_channel::UnpairedPolicy::PairingHint
        );
    }

    #[test]
    fn unit_overrides_replace_bind_and_state_dir() {
        let mut config = parse_gateway_config(SAMPLE).expect("parse");
        config.apply_overrides(
            Some("127.0.0.1:1".to_string()),
            Some(PathBuf::from("/tmp/x")),
        );
        assert_eq!(config.server.bind, "127.0.0.1:1");
        assert_eq!(config.server.state_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn regression_duplicate_account_ids_are_rejected() {
        let raw = r#"
[[accounts]]
account_id = "main"
app_id = "a"
token = "t"

[[accounts]]
account_id = "main"
app_id = "b"
token = "t"
"#;
        let error = parse_gateway_config(raw)
            .expect("parse")
            .validate()
            .expect_err("duplicate");
        assert!(format!("{error:#}").contains("duplicate account_id"));
    }

    #[test]
    fn regression_short_encoding_key_is_rejected() {
        let raw = r#"
[[accounts]]
account_id = "main"
app_id = "a"
token = "t"
encoding_aes_key = "tooshort"
"#;
        let config = parse_gateway_config(raw).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn regression_menu_entry_for_unknown_account_is_rejected() {
        let raw = r#"
[[accounts]]
account_id = "main"
app_id = "a"
token = "t"

[[menu]]
account_id = "other"
event_key = "V1001_TODAY"
text = "today's news"
"#;
        let error = parse_gateway_config(raw)
            .expect("parse")
            .validate()
            .expect_err("unknown account");
        assert!(error.to_string().contains("unknown account 'other'"));
    }

    #[test]
    fn regression_empty_account_list_is_rejected() {
        let config = parse_gateway_config("").expect("parse");
        let error = config.validate().expect_err("no accounts");
        assert!(error.to_string().contains("no enabled accounts"));
    }

    #[test]
    fn unit_load_reports_missing_file_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("absent.toml");
        let error = load_gateway_config(&missing).expect_err("missing");
        assert!(error.to_string().contains("absent.toml"));
    }
}
