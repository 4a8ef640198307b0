//! Inbound processing after a webhook has been authenticated.
//!
//! [`ChannelPipeline`] owns the process-wide state (dedup window, debounce queues,
//! pending images) and drives each accepted event through commands, access
//! resolution, and agent dispatch. Everything here runs after the webhook response has
//! been written, so failures are logged and never surfaced to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mpgate_access::{
    subject_id, AccessTier, AiAssistantStore, MenuPayloadStore, PairingRequestOutcome,
    PairingResolver,
};
use mpgate_runtime::{resolve_within_root, SafeFetcher};
use tracing::{debug, info, warn};

use crate::account::{SharedAccount, UnpairedPolicy};
use crate::agent_dispatch::{AgentDispatchRequest, AgentDispatcher};
use crate::channel_api::ChannelReplySender;
use crate::debounce::{
    should_debounce, DebounceItem, DebounceSink, DebouncedBatch, DebouncerRegistry,
    COMMAND_MARKER,
};
use crate::dedup::MessageDeduplicator;
use crate::envelope::InboundEvent;
use crate::pending_media::{PendingImage, PendingImageStore};
use crate::routing::WebhookTargetRegistry;

const PAIRING_HINT_TEXT: &str =
    "This assistant is limited for unpaired users. Send /pair to request access.";
const PAIRING_UNAVAILABLE_TEXT: &str =
    "Pairing is temporarily unavailable. Please try again later.";

/// Collaborators and settings needed to build a [`ChannelPipeline`].
pub struct PipelineDependencies {
    pub channel: String,
    pub media_dir: PathBuf,
    pub resolver: Arc<PairingResolver>,
    pub ai_assistant: AiAssistantStore,
    pub menu_payloads: MenuPayloadStore,
    pub replies: Arc<dyn ChannelReplySender>,
    pub media_fetcher: Arc<SafeFetcher>,
    pub agent: Arc<dyn AgentDispatcher>,
}

pub struct ChannelPipeline {
    channel: String,
    media_dir: PathBuf,
    targets: WebhookTargetRegistry,
    dedup: MessageDeduplicator,
    debouncers: DebouncerRegistry,
    pending_images: PendingImageStore,
    resolver: Arc<PairingResolver>,
    ai_assistant: AiAssistantStore,
    menu_payloads: MenuPayloadStore,
    replies: Arc<dyn ChannelReplySender>,
    media_fetcher: Arc<SafeFetcher>,
    agent: Arc<dyn AgentDispatcher>,
}

impl ChannelPipeline {
    pub fn new(dependencies: PipelineDependencies) -> Self {
        Self {
            channel: dependencies.channel,
            media_dir: dependencies.media_dir,
            targets: WebhookTargetRegistry::new(),
            dedup: MessageDeduplicator::default(),
            debouncers: DebouncerRegistry::new(),
            pending_images: PendingImageStore::default(),
            resolver: dependencies.resolver,
            ai_assistant: dependencies.ai_assistant,
            menu_payloads: dependencies.menu_payloads,
            replies: dependencies.replies,
            media_fetcher: dependencies.media_fetcher,
            agent: dependencies.agent,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn targets(&self) -> &WebhookTargetRegistry {
        &self.targets
    }

    pub fn resolver(&self) -> &Arc<PairingResolver> {
        &self.resolver
    }

    pub fn menu_payloads(&self) -> &MenuPayloadStore {
        &self.menu_payloads
    }

    /// Registers every account under its webhook path.
    pub fn register_accounts(&self, accounts: &[SharedAccount]) {
        for account in accounts {
            info!(
                account_id = %account.account_id,
                path = %account.webhook_path,
                "registered webhook target"
            );
            self.targets.register(Arc::clone(account));
        }
    }

    /// Drops repeat deliveries and spawns processing for first sightings.
    ///
    /// Returns `false` for a duplicate.
    pub fn accept(self: &Arc<Self>, account: SharedAccount, event: InboundEvent) -> bool {
        let key = event.dedup_key(&account.account_id);
        if !self.dedup.observe(&key) {
            debug!(key = %key, "dropping duplicate delivery");
            return false;
        }
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.process(account, event).await;
        });
        true
    }

    pub async fn process(self: Arc<Self>, account: SharedAccount, event: InboundEvent) {
        if event.is_event() {
            self.handle_event(&account, &event).await;
        } else if event.is_image() {
            self.handle_image(&account, &event).await;
        } else if event.is_text() {
            let text = event.content.clone().unwrap_or_default();
            self.handle_text(&account, &event, text).await;
        } else {
            debug!(
                account_id = %account.account_id,
                msg_type = %event.msg_type,
                "ignoring unsupported message type"
            );
        }
    }

    async fn handle_event(self: &Arc<Self>, account: &SharedAccount, event: &InboundEvent) {
        let name = event.event.as_deref().unwrap_or_default();
        if name.eq_ignore_ascii_case("subscribe") {
            if let Some(welcome) = account.welcome_text.as_deref() {
                self.reply(account, &event.from_id, welcome).await;
            }
            return;
        }
        if name.eq_ignore_ascii_case("click") {
            let Some(event_key) = event.event_key.as_deref() else {
                return;
            };
            match self.menu_payloads.get(&account.account_id, event_key) {
                Some(payload) => self.handle_text(account, event, payload.text).await,
                None => debug!(
                    account_id = %account.account_id,
                    event_key,
                    "no menu payload for click"
                ),
            }
            return;
        }
        debug!(account_id = %account.account_id, event = name, "ignoring event");
    }

    async fn handle_image(&self, account: &SharedAccount, event: &InboundEvent) {
        let Some(url) = event
            .media_ref
            .as_ref()
            .and_then(|media| media.url.as_deref())
        else {
            debug!(account_id = %account.account_id, "image event without a fetchable url");
            return;
        };
        let subject = subject_id(&account.account_id, &event.from_id);
        match self.download_image(&account.account_id, url).await {
            Ok(path) => {
                debug!(subject = %subject, path = %path.display(), "stored pending image");
                self.pending_images.insert(&subject, path);
            }
            Err(error) => warn!(
                account_id = %account.account_id,
                error = %format!("{error:#}"),
                "failed to fetch inbound image"
            ),
        }
    }

    async fn download_image(&self, account_id: &str, url: &str) -> Result<PathBuf> {
        let content = self.media_fetcher.fetch_cached(url).await?;
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .with_context(|| format!("failed to create {}", self.media_dir.display()))?;
        let extension = image_extension(content.content_type.as_deref());
        let file_name = format!("{account_id}-{}.{extension}", uuid::Uuid::new_v4().simple());
        let path = self.media_dir.join(file_name);
        tokio::fs::write(&path, &content.bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn handle_text(
        self: &Arc<Self>,
        account: &SharedAccount,
        event: &InboundEvent,
        text: String,
    ) {
        let subject = subject_id(&account.account_id, &event.from_id);
        // Claimed before any older queued batch is flushed, so only a text that arrived
        // after the image can carry it.
        let image = self.pending_images.take(&subject);
        if text.trim_start().starts_with(COMMAND_MARKER)
            && self.run_command(account, event, &text).await
        {
            discard_image(image);
            return;
        }

        let debouncer = self.debouncers.for_interval(account.debounce_ms);
        let mut queued_event = event.clone();
        queued_event.content = Some(text.clone());
        if let Some(debouncer) = debouncer.as_ref() {
            if should_debounce(&queued_event, image.is_some()) {
                let item = DebounceItem {
                    account: Arc::clone(account),
                    event: queued_event,
                    text,
                };
                let sink: Arc<dyn DebounceSink> = Arc::clone(self) as Arc<dyn DebounceSink>;
                debouncer.enqueue(&subject, item, sink);
                return;
            }
            if let Some(batch) = debouncer.flush_now(&subject) {
                self.flush(batch).await;
            }
        }
        self.dispatch_text(account, event, &text, image).await;
    }

    /// Returns `false` for commands this channel does not own; those go to the agent.
    async fn run_command(
        &self,
        account: &SharedAccount,
        event: &InboundEvent,
        text: &str,
    ) -> bool {
        let mut words = text.split_whitespace();
        let command = words.next().unwrap_or_default().to_ascii_lowercase();
        let argument = words.next().map(str::to_ascii_lowercase);
        let account_id = account.account_id.as_str();
        let open_id = event.from_id.as_str();
        let subject = subject_id(account_id, open_id);

        let reply = match command.as_str() {
            "/pair" => match self.resolver.request_pairing(account_id, open_id).await {
                Ok(PairingRequestOutcome::AlreadyPaired) => {
                    "You are already paired.".to_string()
                }
                Ok(PairingRequestOutcome::Restored) => "Pairing restored.".to_string(),
                Ok(PairingRequestOutcome::CodeIssued(issued)) => format!(
                    "Your pairing code is {}. Ask an operator to approve it within the hour.",
                    issued.code
                ),
                Err(error) => {
                    warn!(account_id, error = %format!("{error:#}"), "pairing request failed");
                    PAIRING_UNAVAILABLE_TEXT.to_string()
                }
            },
            "/unpair" => match self.resolver.set_opt_out(account_id, open_id, true).await {
                Ok(()) => "You are now unpaired. Send /pair to pair again.".to_string(),
                Err(error) => {
                    warn!(account_id, error = %format!("{error:#}"), "opt-out update failed");
                    PAIRING_UNAVAILABLE_TEXT.to_string()
                }
            },
            "/ai" => {
                let enabled = match argument.as_deref() {
                    Some("on") => true,
                    Some("off") => false,
                    _ => {
                        self.reply(account, open_id, "Usage: /ai on | /ai off").await;
                        return true;
                    }
                };
                match self.ai_assistant.set_enabled(&subject, enabled).await {
                    Ok(()) if enabled => "AI assistant enabled.".to_string(),
                    Ok(()) => "AI assistant disabled.".to_string(),
                    Err(error) => {
                        warn!(
                            account_id,
                            error = %format!("{error:#}"),
                            "ai toggle update failed"
                        );
                        "Could not update the AI assistant setting.".to_string()
                    }
                }
            }
            "/status" => {
                let tier = self.resolver.access_tier(account_id, open_id).await;
                let ai_enabled = self
                    .ai_assistant
                    .is_enabled(&subject, account.ai_default_enabled);
                format!(
                    "Access: {}\nAI assistant: {}",
                    tier.as_str(),
                    if ai_enabled { "on" } else { "off" }
                )
            }
            _ => return false,
        };
        self.reply(account, open_id, &reply).await;
        true
    }

    /// The image file, if any, is deleted once this returns.
    async fn dispatch_text(
        &self,
        account: &SharedAccount,
        event: &InboundEvent,
        text: &str,
        image: Option<PendingImage>,
    ) {
        let account_id = account.account_id.as_str();
        let open_id = event.from_id.as_str();
        let subject = subject_id(account_id, open_id);
        let access_tier = self.resolver.access_tier(account_id, open_id).await;

        if access_tier == AccessTier::Unpaired
            && account.unpaired_policy == UnpairedPolicy::PairingHint
        {
            discard_image(image);
            self.reply(account, open_id, PAIRING_HINT_TEXT).await;
            return;
        }
        if !self
            .ai_assistant
            .is_enabled(&subject, account.ai_default_enabled)
        {
            discard_image(image);
            debug!(subject = %subject, "ai assistant disabled; skipping dispatch");
            return;
        }

        let image_path = image
            .as_ref()
            .and_then(|image| self.confine_media_path(&image.file_path));
        let request = AgentDispatchRequest {
            channel: self.channel.clone(),
            account_id: account_id.to_string(),
            open_id: open_id.to_string(),
            subject_id: subject.clone(),
            access_tier,
            text: text.to_string(),
            msg_type: event.msg_type.clone(),
            msg_id: event.msg_id.clone(),
            create_time: event.create_time,
            image_path,
        };
        match self.agent.dispatch(&request).await {
            Ok(Some(reply)) => self.reply(account, open_id, &reply).await,
            Ok(None) => debug!(subject = %subject, "agent returned no reply"),
            Err(error) => warn!(
                subject = %subject,
                error = %format!("{error:#}"),
                "agent dispatch failed"
            ),
        }
        discard_image(image);
    }

    fn confine_media_path(&self, path: &Path) -> Option<PathBuf> {
        match resolve_within_root(&self.media_dir, path) {
            Ok(resolved) => Some(resolved),
            Err(error) => {
                warn!(path = %path.display(), %error, "pending image outside media root");
                None
            }
        }
    }

    async fn reply(&self, account: &SharedAccount, open_id: &str, text: &str) {
        if let Err(error) = self.replies.send_text(account, open_id, text).await {
            warn!(
                account_id = %account.account_id,
                error = %error,
                "failed to deliver reply"
            );
        }
    }
}

#[async_trait]
impl DebounceSink for ChannelPipeline {
    async fn flush(&self, batch: DebouncedBatch) {
        let carrier = batch.carrier;
        self.dispatch_text(&carrier.account, &carrier.event, &batch.combined_text, None)
            .await;
    }
}

fn discard_image(image: Option<PendingImage>) {
    if let Some(image) = image {
        image.discard();
    }
}

fn image_extension(content_type: Option<&str>) -> &'static str {
    let essence = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase());
    match essence.as_deref() {
        Some("image/png") => "png",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        _ => "jpg",
    }
}
