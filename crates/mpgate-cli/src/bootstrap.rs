use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mpgate_access::{
    AccessStorePaths, AiAssistantStore, AllowListSource, CommandPairingApprovalExecutor,
    FileAllowList, MenuPayloadStore, PairingApprovalExecutor, PairingResolver,
    PairingResolverConfig,
};
use mpgate_channel::{
    AgentDispatcher, ChannelApiClient, ChannelPipeline, HttpAgentDispatcher,
    NoopAgentDispatcher, PipelineDependencies, SharedAccount,
};
use mpgate_core::FileLockPolicy;
use mpgate_gateway::GatewayServerConfig;
use mpgate_runtime::{redact_raw_url, SafeFetchConfig, SafeFetcher, SsrfProtectionConfig};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;

pub(crate) fn init_tracing(default_level: &str) {
    let default_directive = default_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

pub(crate) fn render_config_summary(config: &GatewayConfig, accounts: &[SharedAccount]) -> String {
    let mut lines = vec![format!(
        "config ok: bind={} state_dir={} channel={} accounts={}",
        config.server.bind,
        config.server.state_dir.display(),
        config.server.channel,
        accounts.len()
    )];
    for account in accounts {
        lines.push(format!(
            "account={} path={} encrypted={} pairing_api={} debounce_ms={}",
            account.account_id,
            account.webhook_path,
            account.cipher.is_some(),
            account.pairing_token.is_some(),
            account.debounce_ms
        ));
    }
    lines.join("\n")
}

/// Builds the shared pipeline from validated configuration and registers `accounts`.
pub(crate) fn build_pipeline(
    config: &GatewayConfig,
    accounts: &[SharedAccount],
) -> Result<Arc<ChannelPipeline>> {
    let state_dir = &config.server.state_dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let media_dir = config.media_dir();
    std::fs::create_dir_all(&media_dir)
        .with_context(|| format!("failed to create {}", media_dir.display()))?;

    let pairing = &config.pairing;
    let lock_policy = FileLockPolicy::from_millis(pairing.lock_timeout_ms, pairing.lock_stale_ms);
    let mut paths = AccessStorePaths::for_state_dir(state_dir);
    if let Some(allowlist_file) = pairing.allowlist_file.as_ref() {
        paths.allowlist = allowlist_file.clone();
    }

    let file_allow_list = Arc::new(FileAllowList::new(&paths.allowlist, lock_policy));
    let allow_list: Arc<dyn AllowListSource> = file_allow_list.clone();
    let approver: Arc<dyn PairingApprovalExecutor> = match pairing.approval_command.split_first() {
        Some((program, args)) => Arc::new(CommandPairingApprovalExecutor::new(
            program.clone(),
            args.to_vec(),
            Duration::from_millis(pairing.approval_timeout_ms),
        )),
        None => file_allow_list,
    };
    let resolver = Arc::new(PairingResolver::new(
        PairingResolverConfig {
            channel: config.server.channel.clone(),
            snapshot_ttl: Duration::from_millis(pairing.snapshot_ttl_ms),
            code_ttl_ms: pairing.code_ttl_ms,
            max_pending_codes_per_account: pairing.max_pending_codes_per_account,
            lock_policy,
        },
        &paths,
        allow_list,
        approver,
    ));

    let fetcher = Arc::new(
        SafeFetcher::new(config.fetch.to_safe_fetch_config())
            .context("failed to build outbound fetcher")?,
    );
    let agent: Arc<dyn AgentDispatcher> = match config.agent.endpoint.as_deref() {
        Some(endpoint) => {
            let agent_fetcher = SafeFetcher::new(SafeFetchConfig {
                timeout_ms: config.agent.timeout_ms,
                ssrf: SsrfProtectionConfig {
                    allow_private_network: true,
                    ..SsrfProtectionConfig::default()
                },
                ..config.fetch.to_safe_fetch_config()
            })
            .context("failed to build agent dispatcher client")?;
            info!(endpoint = %redact_raw_url(endpoint), "agent dispatch enabled");
            Arc::new(HttpAgentDispatcher::new(endpoint, Arc::new(agent_fetcher)))
        }
        None => {
            info!("no agent endpoint configured; inbound messages will not be answered");
            Arc::new(NoopAgentDispatcher)
        }
    };

    let pipeline = Arc::new(ChannelPipeline::new(PipelineDependencies {
        channel: config.server.channel.clone(),
        media_dir,
        resolver,
        ai_assistant: AiAssistantStore::new(&paths.ai_assistant, lock_policy),
        menu_payloads: MenuPayloadStore::new(&paths.menu_payloads, lock_policy),
        replies: Arc::new(ChannelApiClient::new(Arc::clone(&fetcher))),
        media_fetcher: fetcher,
        agent,
    }));
    pipeline.register_accounts(accounts);
    Ok(pipeline)
}

/// Writes configured `[[menu]]` payloads; returns how many entries changed.
pub(crate) async fn seed_menu_payloads(
    config: &GatewayConfig,
    store: &MenuPayloadStore,
) -> Result<usize> {
    let mut changed = 0usize;
    for entry in &config.menu {
        let written = store
            .upsert(&entry.account_id, &entry.event_key, &entry.text)
            .await
            .with_context(|| {
                format!(
                    "failed to store menu payload {}:{}",
                    entry.account_id, entry.event_key
                )
            })?;
        if written {
            changed += 1;
        }
    }
    if !config.menu.is_empty() {
        info!(entries = config.menu.len(), changed, "menu payloads seeded");
    }
    Ok(changed)
}

pub(crate) fn gateway_server_config(config: &GatewayConfig) -> GatewayServerConfig {
    GatewayServerConfig {
        bind: config.server.bind.clone(),
        max_webhook_body_bytes: config.server.max_webhook_body_bytes,
        max_pair_body_bytes: config.server.max_pair_body_bytes,
        pair_rate_limit_window_ms: config.server.pair_rate_limit_window_ms,
        pair_rate_limit_max_requests: config.server.pair_rate_limit_max_requests,
    }
}
