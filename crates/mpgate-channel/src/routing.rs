//! Path-based webhook routing across accounts that may share a path.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::account::SharedAccount;
use crate::envelope::{open_envelope, verify_handshake, EnvelopeError, InboundEvent, WebhookQuery};

/// Ensures a leading slash and strips trailing slashes except for the root.
pub fn normalize_webhook_path(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut path = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    path
}

#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub account: SharedAccount,
}

impl WebhookTarget {
    pub fn new(account: SharedAccount) -> Self {
        Self { account }
    }

    pub fn account_id(&self) -> &str {
        &self.account.account_id
    }
}

/// Result of resolving a request path against the registry.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub base_path: String,
    /// Remainder below `base_path`, empty for exact matches, otherwise starting with `/`.
    pub sub_path: String,
    /// Targets in registration order.
    pub targets: Vec<WebhookTarget>,
}

impl RouteMatch {
    pub fn is_exact(&self) -> bool {
        self.sub_path.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct WebhookTargetRegistry {
    targets: RwLock<BTreeMap<String, Vec<WebhookTarget>>>,
}

impl WebhookTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `account` under its webhook path. Re-registering the same account id
    /// replaces the earlier entry and moves it to the end.
    pub fn register(&self, account: SharedAccount) {
        let path = normalize_webhook_path(&account.webhook_path);
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        let entries = targets.entry(path).or_default();
        entries.retain(|target| target.account_id() != account.account_id);
        entries.push(WebhookTarget::new(account));
    }

    /// Removes `account_id` from `path`, leaving other accounts on the path in place.
    pub fn unregister(&self, path: &str, account_id: &str) -> bool {
        let path = normalize_webhook_path(path);
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = targets.get_mut(&path) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|target| target.account_id() != account_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            targets.remove(&path);
        }
        removed
    }

    pub fn paths(&self) -> Vec<String> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Exact match first, then the longest registered `/`-delimited ancestor.
    pub fn resolve(&self, raw_path: &str) -> Option<RouteMatch> {
        let path = normalize_webhook_path(raw_path);
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = targets.get(&path) {
            return Some(RouteMatch {
                base_path: path,
                sub_path: String::new(),
                targets: entries.clone(),
            });
        }

        targets
            .iter()
            .filter(|(base, _)| is_descendant_path(&path, base))
            .max_by_key(|(base, _)| base.len())
            .map(|(base, entries)| RouteMatch {
                base_path: base.clone(),
                sub_path: descendant_remainder(&path, base),
                targets: entries.clone(),
            })
    }
}

fn is_descendant_path(path: &str, base: &str) -> bool {
    if base == "/" {
        return path.len() > 1;
    }
    path.strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn descendant_remainder(path: &str, base: &str) -> String {
    if base == "/" {
        return path.to_string();
    }
    path.strip_prefix(base).unwrap_or_default().to_string()
}

/// Picks the most recently registered target whose handshake signature validates.
pub fn select_handshake_target(
    targets: &[WebhookTarget],
    query: &WebhookQuery,
) -> Result<(SharedAccount, String), EnvelopeError> {
    let mut failures = Vec::new();
    for target in targets.iter().rev() {
        match verify_handshake(&target.account, query) {
            Ok(echo) => return Ok((target.account.clone(), echo)),
            Err(error) => failures.push(error),
        }
    }
    Err(summarize_failures(failures))
}

/// Picks the most recently registered target that fully authenticates and decodes `body`.
pub fn select_post_target(
    targets: &[WebhookTarget],
    query: &WebhookQuery,
    body: &[u8],
) -> Result<(SharedAccount, InboundEvent), EnvelopeError> {
    let mut failures = Vec::new();
    for target in targets.iter().rev() {
        match open_envelope(&target.account, query, body) {
            Ok(event) => return Ok((target.account.clone(), event)),
            Err(error) => failures.push(error),
        }
    }
    Err(summarize_failures(failures))
}

fn summarize_failures(failures: Vec<EnvelopeError>) -> EnvelopeError {
    let mut authentication = None;
    for failure in failures {
        match failure {
            EnvelopeError::Malformed(_) => return failure,
            EnvelopeError::Authentication(_) => {
                authentication.get_or_insert(failure);
            }
        }
    }
    authentication.unwrap_or_else(|| {
        EnvelopeError::Authentication("no account registered for path".to_string())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::account::test_support::{account, account_config};
    use crate::envelope::test_support::{plain_query, text_xml};

    fn account_at(account_id: &str, token: &str, path: &str) -> SharedAccount {
        let mut config = account_config(account_id, token);
        config.webhook_path = path.to_string();
        Arc::new(config.resolve().expect("resolve"))
    }

    #[test]
    fn unit_normalize_webhook_path_handles_slashes() {
        assert_eq!(normalize_webhook_path("hook"), "/hook");
        assert_eq!(normalize_webhook_path("/hook/"), "/hook");
        assert_eq!(normalize_webhook_path("/hook//"), "/hook");
        assert_eq!(normalize_webhook_path("/"), "/");
        assert_eq!(normalize_webhook_path(""), "/");
    }

    #[test]
    fn functional_resolve_prefers_exact_then_longest_prefix() {
        let registry = WebhookTargetRegistry::new();
        registry.register(account_at("a", "t", "/hook"));
        registry.register(account_at("b", "t", "/hook/deep"));

        let exact = registry.resolve("/hook/").expect("exact");
        assert!(exact.is_exact());
        assert_eq!(exact.targets[0].account_id(), "a");

        let nested = registry.resolve("/hook/deep/api/pair").expect("nested");
        assert_eq!(nested.base_path, "/hook/deep");
        assert_eq!(nested.sub_path, "/api/pair");

        let api = registry.resolve("/hook/api/pair").expect("api");
        assert_eq!(api.base_path, "/hook");
        assert_eq!(api.sub_path, "/api/pair");
    }

    #[test]
    fn regression_resolve_requires_slash_delimited_prefix() {
        let registry = WebhookTargetRegistry::new();
        registry.register(account_at("a", "t", "/hook"));
        assert!(registry.resolve("/hookish").is_none());
        assert!(registry.resolve("/other").is_none());
    }

    #[test]
    fn functional_shared_path_survives_partial_unregister() {
        let registry = WebhookTargetRegistry::new();
        registry.register(account_at("a", "t1", "/hook"));
        registry.register(account_at("b", "t2", "/hook"));

        assert!(registry.unregister("/hook", "a"));
        assert!(!registry.unregister("/hook", "a"));
        let remaining = registry.resolve("/hook").expect("route");
        assert_eq!(remaining.targets.len(), 1);
        assert_eq!(remaining.targets[0].account_id(), "b");

        assert!(registry.unregister("/hook/", "b"));
        assert!(registry.resolve("/hook").is_none());
        assert!(registry.paths().is_empty());
    }

    #[test]
    fn unit_register_is_idempotent_per_account() {
        let registry = WebhookTargetRegistry::new();
        registry.register(account_at("a", "t", "/hook"));
        registry.register(account_at("a", "t", "/hook"));
        assert_eq!(registry.resolve("/hook").expect("route").targets.len(), 1);
    }

    #[test]
    fn functional_handshake_selects_account_by_signature() {
        let targets = vec![
            WebhookTarget::new(account("a", "token-a")),
            WebhookTarget::new(account("b", "token-b")),
        ];
        let mut query = plain_query("token-a");
        query.echostr = Some("challenge".to_string());
        let (selected, echo) = select_handshake_target(&targets, &query).expect("select");
        assert_eq!(selected.account_id, "a");
        assert_eq!(echo, "challenge");
    }

    #[test]
    fn functional_shared_token_prefers_most_recent_registration() {
        let targets = vec![
            WebhookTarget::new(account("old", "shared")),
            WebhookTarget::new(account("new", "shared")),
        ];
        let body = text_xml("o-user", "1", "hi");
        let (selected, _) =
            select_post_target(&targets, &plain_query("shared"), body.as_bytes()).expect("select");
        assert_eq!(selected.account_id, "new");
    }

    #[test]
    fn regression_post_with_unknown_signature_is_authentication_failure() {
        let targets = vec![WebhookTarget::new(account("a", "token-a"))];
        let body = text_xml("o-user", "1", "hi");
        let error = select_post_target(&targets, &plain_query("token-z"), body.as_bytes())
            .expect_err("reject");
        assert!(error.is_authentication());
    }

    #[test]
    fn regression_post_with_garbage_body_is_malformed() {
        let targets = vec![WebhookTarget::new(account("a", "token-a"))];
        let error = select_post_target(&targets, &plain_query("token-a"), b"not-xml")
            .expect_err("reject");
        assert!(matches!(error, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn unit_empty_target_list_is_authentication_failure() {
        let error = select_handshake_target(&[], &WebhookQuery::default()).expect_err("none");
        assert!(error.is_authentication());
    }
}
