//! Webhook authentication and envelope decoding.
//!
//! GET requests carry a handshake signature over `[token, timestamp, nonce]`. POST
//! requests carry a flat XML (or JSON) envelope, either plaintext and signed like the
//! handshake, or wrapped in an `Encrypt` field signed over
//! `[token, timestamp, nonce, Encrypt]` as `msg_signature`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::account::ResolvedAccount;
use crate::envelope_crypto::verify_signature;

const XML_FIELD_PATTERN: &str = r"(?s)<([A-Za-z_][A-Za-z0-9_]*)>\s*(<!\[CDATA\[(.*?)\]\]>|[^<]*?)\s*</([A-Za-z_][A-Za-z0-9_]*)>";

/// Typed failure separating bad credentials from bad payloads.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl EnvelopeError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Query parameters the provider attaches to webhook requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebhookQuery {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub echostr: Option<String>,
    pub encrypt_type: Option<String>,
    pub msg_signature: Option<String>,
    pub openid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRef {
    pub media_id: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEvent {
    pub from_id: String,
    pub to_id: String,
    pub create_time: u64,
    pub msg_type: String,
    pub content: Option<String>,
    pub msg_id: Option<String>,
    pub event: Option<String>,
    pub event_key: Option<String>,
    pub media_ref: Option<MediaRef>,
}

impl InboundEvent {
    /// `accountId:fromId:(msgId|createTime)`.
    pub fn dedup_key(&self, account_id: &str) -> String {
        let discriminator = match self.msg_id.as_deref() {
            Some(msg_id) => msg_id.to_string(),
            None => self.create_time.to_string(),
        };
        format!("{account_id}:{}:{discriminator}", self.from_id)
    }

    pub fn is_text(&self) -> bool {
        self.msg_type.eq_ignore_ascii_case("text")
    }

    pub fn is_image(&self) -> bool {
        self.msg_type.eq_ignore_ascii_case("image")
    }

    pub fn is_event(&self) -> bool {
        self.msg_type.eq_ignore_ascii_case("event")
    }

    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, EnvelopeError> {
        let required = |name: &str| {
            fields
                .get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| EnvelopeError::Malformed(format!("missing required field {name}")))
        };
        let optional = |name: &str| {
            fields
                .get(name)
                .filter(|value| !value.trim().is_empty())
                .cloned()
        };
        let create_time = required("CreateTime")?
            .parse::<u64>()
            .map_err(|_| EnvelopeError::Malformed("CreateTime is not an integer".to_string()))?;
        let media_id = optional("MediaId");
        let pic_url = optional("PicUrl");
        let media_ref = (media_id.is_some() || pic_url.is_some()).then(|| MediaRef {
            media_id,
            url: pic_url,
        });

        Ok(Self {
            from_id: required("FromUserName")?,
            to_id: required("ToUserName")?,
            create_time,
            msg_type: required("MsgType")?,
            content: optional("Content"),
            msg_id: optional("MsgId"),
            event: optional("Event"),
            event_key: optional("EventKey"),
            media_ref,
        })
    }
}

/// Validates a GET handshake and returns the challenge to echo.
pub fn verify_handshake(
    account: &ResolvedAccount,
    query: &WebhookQuery,
) -> Result<String, EnvelopeError> {
    let (signature, timestamp, nonce) = signature_params(query, query.signature.as_deref())?;
    let echostr = query
        .echostr
        .as_deref()
        .ok_or_else(|| EnvelopeError::Malformed("missing echostr".to_string()))?;
    if !verify_signature(signature, &[&account.token, timestamp, nonce]) {
        return Err(EnvelopeError::Authentication(
            "handshake signature mismatch".to_string(),
        ));
    }
    Ok(echostr.to_string())
}

/// Authenticates a POST body for `account` and decodes it into an [`InboundEvent`].
pub fn open_envelope(
    account: &ResolvedAccount,
    query: &WebhookQuery,
    body: &[u8],
) -> Result<InboundEvent, EnvelopeError> {
    let body = std::str::from_utf8(body)
        .map_err(|_| EnvelopeError::Malformed("body is not utf-8".to_string()))?;
    let outer = parse_envelope_fields(body)?;
    let encrypted = query
        .encrypt_type
        .as_deref()
        .is_some_and(|mode| mode.eq_ignore_ascii_case("aes"))
        || outer.contains_key("Encrypt");

    if !encrypted {
        let (signature, timestamp, nonce) = signature_params(query, query.signature.as_deref())?;
        if !verify_signature(signature, &[&account.token, timestamp, nonce]) {
            return Err(EnvelopeError::Authentication(
                "request signature mismatch".to_string(),
            ));
        }
        return InboundEvent::from_fields(&outer);
    }

    let encrypt = outer
        .get("Encrypt")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EnvelopeError::Malformed("encrypted envelope lacks Encrypt".to_string()))?;
    let (msg_signature, timestamp, nonce) =
        signature_params(query, query.msg_signature.as_deref())?;
    if !verify_signature(msg_signature, &[&account.token, timestamp, nonce, encrypt]) {
        return Err(EnvelopeError::Authentication(
            "message signature mismatch".to_string(),
        ));
    }
    let cipher = account.cipher.as_ref().ok_or_else(|| {
        EnvelopeError::Authentication("account has no encoding key".to_string())
    })?;
    let plaintext = cipher
        .decrypt(encrypt)
        .map_err(|error| EnvelopeError::Authentication(format!("decryption failed: {error}")))?;
    let inner = parse_envelope_fields(&plaintext)?;
    InboundEvent::from_fields(&inner)
}

fn signature_params<'a>(
    query: &'a WebhookQuery,
    signature: Option<&'a str>,
) -> Result<(&'a str, &'a str, &'a str), EnvelopeError> {
    match (signature, query.timestamp.as_deref(), query.nonce.as_deref()) {
        (Some(signature), Some(timestamp), Some(nonce)) => Ok((signature, timestamp, nonce)),
        _ => Err(EnvelopeError::Authentication(
            "missing signature parameters".to_string(),
        )),
    }
}

/// Parses a flat envelope: JSON when the body is an object, XML otherwise.
pub fn parse_envelope_fields(body: &str) -> Result<BTreeMap<String, String>, EnvelopeError> {
    if body.trim_start().starts_with('{') {
        parse_json_fields(body)
    } else {
        parse_xml_fields(body)
    }
}

fn parse_json_fields(body: &str) -> Result<BTreeMap<String, String>, EnvelopeError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| EnvelopeError::Malformed(format!("invalid JSON envelope: {error}")))?;
    let Value::Object(object) = value else {
        return Err(EnvelopeError::Malformed(
            "JSON envelope must be an object".to_string(),
        ));
    };
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let rendered = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            _ => continue,
        };
        fields.insert(key, rendered);
    }
    Ok(fields)
}

fn xml_field_pattern() -> Result<&'static Regex, EnvelopeError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(pattern) = PATTERN.get() {
        return Ok(pattern);
    }
    let compiled = Regex::new(XML_FIELD_PATTERN)
        .map_err(|error| EnvelopeError::Malformed(format!("xml pattern unavailable: {error}")))?;
    Ok(PATTERN.get_or_init(|| compiled))
}

fn parse_xml_fields(body: &str) -> Result<BTreeMap<String, String>, EnvelopeError> {
    let inner = body
        .trim()
        .strip_prefix("<xml>")
        .and_then(|rest| rest.strip_suffix("</xml>"))
        .ok_or_else(|| EnvelopeError::Malformed("envelope is not an <xml> document".to_string()))?;
    let pattern = xml_field_pattern()?;
    let mut fields = BTreeMap::new();
    for captures in pattern.captures_iter(inner) {
        let (Some(open), Some(close)) = (captures.get(1), captures.get(4)) else {
            continue;
        };
        if open.as_str() != close.as_str() {
            return Err(EnvelopeError::Malformed(format!(
                "mismatched tags <{}> and </{}>",
                open.as_str(),
                close.as_str()
            )));
        }
        let value = match (captures.get(3), captures.get(2)) {
            (Some(cdata), _) => cdata.as_str().to_string(),
            (None, Some(text)) => decode_xml_entities(text.as_str().trim()),
            (None, None) => String::new(),
        };
        fields.entry(open.as_str().to_string()).or_insert(value);
    }
    if fields.is_empty() {
        return Err(EnvelopeError::Malformed("envelope has no fields".to_string()));
    }
    Ok(fields)
}

fn decode_xml_entities(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
