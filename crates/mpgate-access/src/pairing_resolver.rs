//! Paired/unpaired resolution over an external allow-list with a local opt-out overlay.
//!
//! The allow-list is pulled through [`AllowListSource`] and cached as an immutable
//! snapshot for a short TTL. The opt-out overlay is consulted first and always wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use mpgate_core::{current_unix_timestamp_ms, FileLockPolicy};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::allow_list::{AllowListSource, PairingApprovalExecutor, PairingApprovalRequest};
use crate::pairing_codes::{
    normalize_pairing_code, IssuedPairingCode, PairingCodeStore,
    DEFAULT_MAX_PENDING_CODES_PER_ACCOUNT, DEFAULT_PAIRING_CODE_TTL_MS,
};
use crate::stores::{AccessStorePaths, OptOutStore};
use crate::subject::subject_id;

pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PairingResolverConfig {
    pub channel: String,
    pub snapshot_ttl: Duration,
    pub code_ttl_ms: u64,
    pub max_pending_codes_per_account: usize,
    pub lock_policy: FileLockPolicy,
}

impl PairingResolverConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            snapshot_ttl: DEFAULT_SNAPSHOT_TTL,
            code_ttl_ms: DEFAULT_PAIRING_CODE_TTL_MS,
            max_pending_codes_per_account: DEFAULT_MAX_PENDING_CODES_PER_ACCOUNT,
            lock_policy: FileLockPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Paired,
    Unpaired,
}

impl AccessTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paired => "paired",
            Self::Unpaired => "unpaired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingRequestOutcome {
    AlreadyPaired,
    /// The subject was allow-listed but opted out; the opt-out was cleared.
    Restored,
    CodeIssued(IssuedPairingCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedSubject {
    pub account_id: String,
    pub open_id: String,
}

#[derive(Debug, Error)]
pub enum PairingApprovalError {
    #[error("invalid or expired pairing code")]
    InvalidOrExpired,
    #[error("pairing approval failed: {detail}")]
    ExecutorFailed { detail: String },
    #[error("pairing storage failure: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Default)]
struct AllowListSnapshot {
    subjects: HashSet<String>,
    refreshed_at: Option<Instant>,
}

impl AllowListSnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        matches!(self.refreshed_at, Some(at) if at.elapsed() < ttl)
    }
}

pub struct PairingResolver {
    config: PairingResolverConfig,
    allow_list: Arc<dyn AllowListSource>,
    approver: Arc<dyn PairingApprovalExecutor>,
    opt_out: OptOutStore,
    codes: PairingCodeStore,
    snapshot: ArcSwap<AllowListSnapshot>,
    refresh_lock: AsyncMutex<()>,
}

impl PairingResolver {
    pub fn new(
        config: PairingResolverConfig,
        paths: &AccessStorePaths,
        allow_list: Arc<dyn AllowListSource>,
        approver: Arc<dyn PairingApprovalExecutor>,
    ) -> Self {
        Self {
            opt_out: OptOutStore::new(&paths.opt_out, config.lock_policy),
            codes: PairingCodeStore::new(
                &paths.pairing_codes,
                config.lock_policy,
                config.code_ttl_ms,
                config.max_pending_codes_per_account,
            ),
            config,
            allow_list,
            approver,
            snapshot: ArcSwap::from_pointee(AllowListSnapshot::default()),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.config.channel
    }

    pub async fn is_paired(&self, account_id: &str, open_id: &str) -> bool {
        let subject = subject_id(account_id, open_id);
        if self.opt_out.is_opted_out(&subject) {
            return false;
        }
        self.current_snapshot().await.subjects.contains(&subject)
    }

    pub async fn access_tier(&self, account_id: &str, open_id: &str) -> AccessTier {
        if self.is_paired(account_id, open_id).await {
            AccessTier::Paired
        } else {
            AccessTier::Unpaired
        }
    }

    pub fn is_opted_out(&self, account_id: &str, open_id: &str) -> bool {
        self.opt_out.is_opted_out(&subject_id(account_id, open_id))
    }

    /// Makes a just-approved subject visible before the next allow-list refresh.
    pub fn record_approved_subject_id(&self, subject: &str) {
        let subject = subject.trim().to_string();
        if subject.is_empty() {
            return;
        }
        self.snapshot.rcu(|current| {
            let mut subjects = current.subjects.clone();
            subjects.insert(subject.clone());
            AllowListSnapshot {
                subjects,
                refreshed_at: current.refreshed_at,
            }
        });
    }

    pub async fn set_opt_out(
        &self,
        account_id: &str,
        open_id: &str,
        opted_out: bool,
    ) -> Result<()> {
        let subject = subject_id(account_id, open_id);
        self.opt_out.set(&subject, opted_out).await?;
        info!(account_id, opted_out, "updated pairing opt-out");
        Ok(())
    }

    pub async fn request_pairing(
        &self,
        account_id: &str,
        open_id: &str,
    ) -> Result<PairingRequestOutcome> {
        let subject = subject_id(account_id, open_id);
        let listed = self.current_snapshot().await.subjects.contains(&subject);
        if listed {
            if !self.opt_out.is_opted_out(&subject) {
                return Ok(PairingRequestOutcome::AlreadyPaired);
            }
            self.opt_out.set(&subject, false).await?;
            info!(account_id, "cleared opt-out for allow-listed subject");
            return Ok(PairingRequestOutcome::Restored);
        }

        let issued = self
            .codes
            .issue(account_id, open_id, current_unix_timestamp_ms())
            .await?;
        info!(account_id, reused = issued.reused, "issued pairing code");
        Ok(PairingRequestOutcome::CodeIssued(issued))
    }

    /// Redeems a pairing code bound to one of `permitted_accounts`.
    ///
    /// The code is consumed only when the approval executor succeeds; a second redeem of
    /// the same code reports [`PairingApprovalError::InvalidOrExpired`].
    pub async fn approve_code(
        &self,
        raw_code: &str,
        permitted_accounts: &[&str],
    ) -> Result<ApprovedSubject, PairingApprovalError> {
        let code =
            normalize_pairing_code(raw_code).ok_or(PairingApprovalError::InvalidOrExpired)?;
        let now_unix_ms = current_unix_timestamp_ms();
        let mut locked = self
            .codes
            .lock()
            .await
            .map_err(PairingApprovalError::Storage)?;
        let pruned = locked.document.prune_expired(now_unix_ms);
        let record = locked
            .document
            .codes
            .get(&code)
            .filter(|record| permitted_accounts.contains(&record.account_id.as_str()))
            .cloned();
        let Some(record) = record else {
            if pruned > 0 {
                locked.commit().map_err(PairingApprovalError::Storage)?;
            }
            return Err(PairingApprovalError::InvalidOrExpired);
        };

        let subject = subject_id(&record.account_id, &record.open_id);
        let request = PairingApprovalRequest {
            channel: self.config.channel.clone(),
            code: code.clone(),
            subject_id: subject.clone(),
        };
        let output = self
            .approver
            .approve(&request)
            .await
            .map_err(|error| PairingApprovalError::ExecutorFailed {
                detail: format!("{error:#}"),
            })?;
        if !output.success() {
            let stderr = output.stderr.trim();
            let detail = if stderr.is_empty() {
                format!("approval exited with {:?}", output.exit_code)
            } else {
                stderr.to_string()
            };
            return Err(PairingApprovalError::ExecutorFailed { detail });
        }

        locked.document.codes.remove(&code);
        locked.commit().map_err(PairingApprovalError::Storage)?;

        if let Err(error) = self.opt_out.set(&subject, false).await {
            warn!(
                account_id = %record.account_id,
                error = %error,
                "failed to clear opt-out after approval"
            );
        }
        self.record_approved_subject_id(&subject);
        info!(account_id = %record.account_id, "pairing approved");
        Ok(ApprovedSubject {
            account_id: record.account_id,
            open_id: record.open_id,
        })
    }

    async fn current_snapshot(&self) -> Arc<AllowListSnapshot> {
        let ttl = self.config.snapshot_ttl;
        let current = self.snapshot.load_full();
        if current.is_fresh(ttl) {
            return current;
        }
        let _refresh = self.refresh_lock.lock().await;
        let current = self.snapshot.load_full();
        if current.is_fresh(ttl) {
            return current;
        }

        let subjects = match self.allow_list.pull(&self.config.channel).await {
            Ok(subjects) => subjects
                .into_iter()
                .map(|subject| subject.trim().to_string())
                .filter(|subject| !subject.is_empty())
                .collect(),
            Err(error) => {
                warn!(
                    channel = %self.config.channel,
                    error = %error,
                    "allow-list pull failed; treating channel as unpaired"
                );
                HashSet::new()
            }
        };
        let next = Arc::new(AllowListSnapshot {
            subjects,
            refreshed_at: Some(Instant::now()),
        });
        self.snapshot.store(Arc::clone(&next));
        next
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use mpgate_runtime::CommandOutput;
    use tempfile::tempdir;

    use super::*;
    use crate::allow_list::{NoopAllowListSource, NoopPairingApprovalExecutor};

    #[derive(Default)]
    struct ScriptedAllowList {
        subjects: Mutex<Vec<String>>,
        pulls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedAllowList {
        fn with(subjects: &[&str]) -> Self {
            Self {
                subjects: Mutex::new(subjects.iter().map(|s| s.to_string()).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl AllowListSource for ScriptedAllowList {
        async fn pull(&self, channel: &str) -> Result<Vec<String>> {
            assert_eq!(channel, "wechat");
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("allow-list backend unavailable"));
            }
            Ok(self.subjects.lock().expect("subjects").clone())
        }
    }

    struct FailingApprover;

    #[async_trait]
    impl PairingApprovalExecutor for FailingApprover {
        async fn approve(&self, _request: &PairingApprovalRequest) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "approval denied".to_string(),
                exit_code: Some(2),
            })
        }
    }

    fn resolver(
        dir: &std::path::Path,
        allow_list: Arc<dyn AllowListSource>,
        approver: Arc<dyn PairingApprovalExecutor>,
    ) -> PairingResolver {
        PairingResolver::new(
            PairingResolverConfig::new("wechat"),
            &AccessStorePaths::for_state_dir(dir),
            allow_list,
            approver,
        )
    }

    #[tokio::test]
    async fn functional_allow_listed_subject_is_paired_by_exact_match() {
        let temp = tempdir().expect("tempdir");
        let allow_list = Arc::new(ScriptedAllowList::with(&["wx-main:o-user"]));
        let resolver = resolver(temp.path(), allow_list, Arc::new(NoopPairingApprovalExecutor));
        assert!(resolver.is_paired("wx-main", "o-user").await);
        assert!(!resolver.is_paired("wx-main", "o-use").await);
        assert!(!resolver.is_paired("wx-main", "o-user-2").await);
        assert_eq!(
            resolver.access_tier("wx-other", "o-user").await,
            AccessTier::Unpaired
        );
    }

    #[tokio::test]
    async fn functional_opt_out_wins_over_allow_list() {
        let temp = tempdir().expect("tempdir");
        let allow_list = Arc::new(ScriptedAllowList::with(&["wx-main:o-user"]));
        let resolver = resolver(temp.path(), allow_list, Arc::new(NoopPairingApprovalExecutor));
        resolver
            .set_opt_out("wx-main", "o-user", true)
            .await
            .expect("opt out");
        assert!(!resolver.is_paired("wx-main", "o-user").await);

        resolver.record_approved_subject_id("wx-main:o-user");
        assert!(!resolver.is_paired("wx-main", "o-user").await);

        resolver
            .set_opt_out("wx-main", "o-user", false)
            .await
            .expect("opt in");
        assert!(resolver.is_paired("wx-main", "o-user").await);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_snapshot_is_reused_within_ttl_and_refreshed_after() {
        let temp = tempdir().expect("tempdir");
        let allow_list = Arc::new(ScriptedAllowList::with(&[]));
        let resolver = resolver(
            temp.path(),
            Arc::clone(&allow_list) as Arc<dyn AllowListSource>,
            Arc::new(NoopPairingApprovalExecutor),
        );
        assert!(!resolver.is_paired("wx-main", "o-user").await);
        allow_list
            .subjects
            .lock()
            .expect("subjects")
            .push("wx-main:o-user".to_string());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!resolver.is_paired("wx-main", "o-user").await);
        assert_eq!(allow_list.pulls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(resolver.is_paired("wx-main", "o-user").await);
        assert_eq!(allow_list.pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn regression_failed_pull_degrades_to_unpaired() {
        let temp = tempdir().expect("tempdir");
        let allow_list = Arc::new(ScriptedAllowList {
            subjects: Mutex::new(vec!["wx-main:o-user".to_string()]),
            fail: true,
            ..ScriptedAllowList::default()
        });
        let resolver = resolver(temp.path(), allow_list, Arc::new(NoopPairingApprovalExecutor));
        assert!(!resolver.is_paired("wx-main", "o-user").await);
    }

    #[tokio::test]
    async fn functional_record_approved_subject_is_visible_immediately() {
        let temp = tempdir().expect("tempdir");
        let resolver = resolver(
            temp.path(),
            Arc::new(NoopAllowListSource),
            Arc::new(NoopPairingApprovalExecutor),
        );
        assert!(!resolver.is_paired("wx-main", "o-user").await);
        resolver.record_approved_subject_id("wx-main:o-user");
        assert!(resolver.is_paired("wx-main", "o-user").await);
    }

    #[tokio::test]
    async fn integration_pairing_code_approval_is_one_shot() {
        let temp = tempdir().expect("tempdir");
        let resolver = resolver(
            temp.path(),
            Arc::new(NoopAllowListSource),
            Arc::new(NoopPairingApprovalExecutor),
        );
        let PairingRequestOutcome::CodeIssued(issued) = resolver
            .request_pairing("wx-main", "o-user")
            .await
            .expect("request")
        else {
            panic!("expected a pairing code");
        };

        let approved = resolver
            .approve_code(&issued.code.to_lowercase(), &["wx-main"])
            .await
            .expect("approve");
        assert_eq!(
            approved,
            ApprovedSubject {
                account_id: "wx-main".to_string(),
                open_id: "o-user".to_string(),
            }
        );
        assert!(resolver.is_paired("wx-main", "o-user").await);

        let error = resolver
            .approve_code(&issued.code, &["wx-main"])
            .await
            .expect_err("second approval should fail");
        assert!(matches!(error, PairingApprovalError::InvalidOrExpired));
        assert_eq!(error.to_string(), "invalid or expired pairing code");
    }

    #[tokio::test]
    async fn regression_code_for_other_account_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let resolver = resolver(
            temp.path(),
            Arc::new(NoopAllowListSource),
            Arc::new(NoopPairingApprovalExecutor),
        );
        let PairingRequestOutcome::CodeIssued(issued) = resolver
            .request_pairing("wx-main", "o-user")
            .await
            .expect("request")
        else {
            panic!("expected a pairing code");
        };
        let error = resolver
            .approve_code(&issued.code, &["wx-other"])
            .await
            .expect_err("foreign account should fail");
        assert!(matches!(error, PairingApprovalError::InvalidOrExpired));
        resolver
            .approve_code(&issued.code, &["wx-main"])
            .await
            .expect("code stays redeemable for its own account");
    }

    #[tokio::test]
    async fn regression_failed_executor_keeps_code_pending() {
        let temp = tempdir().expect("tempdir");
        let resolver = resolver(
            temp.path(),
            Arc::new(NoopAllowListSource),
            Arc::new(FailingApprover),
        );
        let PairingRequestOutcome::CodeIssued(issued) = resolver
            .request_pairing("wx-main", "o-user")
            .await
            .expect("request")
        else {
            panic!("expected a pairing code");
        };
        let error = resolver
            .approve_code(&issued.code, &["wx-main"])
            .await
            .expect_err("executor failure should surface");
        assert!(error.to_string().contains("approval denied"));
        assert!(resolver.codes.pending_codes().contains_key(&issued.code));
        assert!(!resolver.is_paired("wx-main", "o-user").await);
    }

    #[tokio::test]
    async fn functional_request_pairing_restores_opted_out_subject() {
        let temp = tempdir().expect("tempdir");
        let allow_list = Arc::new(ScriptedAllowList::with(&["wx-main:o-user"]));
        let resolver = resolver(temp.path(), allow_list, Arc::new(NoopPairingApprovalExecutor));
        assert_eq!(
            resolver
                .request_pairing("wx-main", "o-user")
                .await
                .expect("request"),
            PairingRequestOutcome::AlreadyPaired
        );
        resolver
            .set_opt_out("wx-main", "o-user", true)
            .await
            .expect("opt out");
        assert_eq!(
            resolver
                .request_pairing("wx-main", "o-user")
                .await
                .expect("request"),
            PairingRequestOutcome::Restored
        );
        assert!(resolver.is_paired("wx-main", "o-user").await);
    }
}
