/// Builds the composite `accountId:openId` subject identifier.
pub fn subject_id(account_id: &str, open_id: &str) -> String {
    format!("{account_id}:{open_id}")
}

/// Splits a subject identifier at the first `:`; both halves must be non-empty.
pub fn parse_subject_id(subject: &str) -> Option<(&str, &str)> {
    let (account_id, open_id) = subject.split_once(':')?;
    if account_id.is_empty() || open_id.is_empty() {
        return None;
    }
    Some((account_id, open_id))
}
