//! Access control for channel subjects.
//!
//! Resolves `accountId:openId` subjects into paired/unpaired tiers, issues and redeems
//! one-shot pairing codes, and persists per-subject toggles under the state directory.

pub mod allow_list;
pub mod pairing_codes;
pub mod pairing_resolver;
pub mod stores;
pub mod subject;

pub use allow_list::{
    AllowListDocument, AllowListSource, CommandPairingApprovalExecutor, FileAllowList,
    NoopAllowListSource, NoopPairingApprovalExecutor, PairingApprovalExecutor,
    PairingApprovalRequest,
};
pub use pairing_codes::{
    normalize_pairing_code, IssuedPairingCode, PairingCodeRecord, PairingCodeStore,
};
pub use pairing_resolver::{
    AccessTier, ApprovedSubject, PairingApprovalError, PairingRequestOutcome, PairingResolver,
    PairingResolverConfig,
};
pub use stores::{AccessStorePaths, AiAssistantStore, MenuPayload, MenuPayloadStore, OptOutStore};
pub use subject::{parse_subject_id, subject_id};
