//! Outbound runtime guards: SSRF validation, bounded HTTP fetches, and external commands.

pub mod command_runner;
pub mod safe_fetch;
pub mod ssrf_guard;

pub use command_runner::{run_command_with_timeout, CommandOutput};
pub use safe_fetch::{
    resolve_within_root, FetchedContent, SafeFetchConfig, SafeFetchError, SafeFetcher,
};
pub use ssrf_guard::{
    redact_raw_url, redact_url, SsrfGuard, SsrfProtectionConfig, SsrfReason, SsrfViolation,
};
