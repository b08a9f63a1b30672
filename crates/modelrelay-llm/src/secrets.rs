//! Keeping provider credentials out of logs and errors
//!
//! Each vendor issues keys with a recognizable prefix (`hf_`, `ghp_`,
//! `AIza`, ...). Masking keeps that prefix so an operator can tell which
//! credential is loaded. Redaction scrubs keys that a provider echoes back in
//! an error body, or that a transport error carries in a request URL (Gemini
//! authenticates with a `key=` query parameter).

use crate::config::ProviderKind;
use std::borrow::Cow;

/// Characters of a key's tail left visible by [`mask_api_key`]
const VISIBLE_TAIL: usize = 4;

/// Keys shorter than this are never partially shown
const MIN_MASKABLE_LEN: usize = 12;

const REDACTED: &str = "[redacted]";

/// Vendor key prefixes, longest first
const KEY_PREFIXES: &[(&str, ProviderKind)] = &[
    ("github_pat_", ProviderKind::Github),
    ("ghp_", ProviderKind::Github),
    ("hf_", ProviderKind::Huggingface),
    ("AIza", ProviderKind::Gemini),
    ("sk-", ProviderKind::Deepseek),
];

fn vendor_prefix(key: &str) -> Option<(&'static str, ProviderKind)> {
    KEY_PREFIXES
        .iter()
        .find(|(prefix, _)| key.starts_with(prefix))
        .copied()
}

/// Mask a key for `Debug` output and logs
///
/// A known vendor prefix and the last four characters stay visible.
///
/// ```
/// use modelrelay_llm::secrets::mask_api_key;
/// assert_eq!(mask_api_key("hf_AbCdEfGhIjKlMnOp"), "hf_…MnOp");
/// assert_eq!(mask_api_key("AIzaSyD-1234567890abcdef"), "AIza…cdef");
/// assert_eq!(mask_api_key("plainsecret1234"), "****…1234");
/// assert_eq!(mask_api_key("hf_short"), "****");
/// ```
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    if key.len() < MIN_MASKABLE_LEN || !key.is_ascii() {
        return "****".to_string();
    }
    let tail = &key[key.len() - VISIBLE_TAIL..];
    match vendor_prefix(key) {
        Some((prefix, _)) => format!("{prefix}…{tail}"),
        None => format!("****…{tail}"),
    }
}

/// Warning for a configured key that is unlikely to work with `kind`
///
/// Flags empty or implausibly short keys and keys carrying another
/// vendor's prefix. OpenAI-compatible endpoints accept any key shape.
#[must_use]
pub fn key_warning(key: &str, kind: ProviderKind, provider: &str) -> Option<String> {
    if key.trim().is_empty() {
        return Some(format!("{provider} API key is empty"));
    }
    if key.len() < MIN_MASKABLE_LEN {
        return Some(format!("{provider} API key looks too short"));
    }
    match vendor_prefix(key) {
        Some((prefix, owner)) if owner != kind && kind != ProviderKind::OpenaiCompat => Some(format!(
            "{provider} API key starts with {prefix}, which is a {} key",
            owner.as_str()
        )),
        _ => None,
    }
}

/// Scrub credentials from provider or transport text
///
/// Replaces words that start with a vendor key prefix, the value after
/// `Bearer`, and values assigned to `key`, `token` or `*api_key` fields.
#[must_use]
pub fn redact_secrets(text: &str) -> Cow<'_, str> {
    let mut out = String::with_capacity(text.len());
    let mut changed = false;
    let mut previous: Option<&str> = None;
    let mut gap = "";

    for (is_word, run) in runs(text) {
        if !is_word {
            out.push_str(run);
            gap = run;
            continue;
        }
        if is_secret(run, previous, gap) {
            out.push_str(REDACTED);
            changed = true;
        } else {
            out.push_str(run);
        }
        previous = Some(run);
        gap = "";
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(text)
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Alternating runs of key characters and separators
fn runs(text: &str) -> impl Iterator<Item = (bool, &str)> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let is_word = is_key_char(first);
        let end = rest
            .find(|c: char| is_key_char(c) != is_word)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        rest = tail;
        Some((is_word, run))
    })
}

fn is_secret(word: &str, previous: Option<&str>, gap: &str) -> bool {
    if vendor_prefix(word).is_some_and(|(prefix, _)| word.len() > prefix.len()) {
        return true;
    }
    let Some(label) = previous.map(str::to_ascii_lowercase) else {
        return false;
    };
    if label == "bearer" {
        return gap.trim().is_empty();
    }
    let names_credential = matches!(label.as_str(), "key" | "token" | "access_token")
        || ["api_key", "api-key", "apikey"].iter().any(|s| label.ends_with(s));
    names_credential && (gap.contains('=') || gap.contains(':'))
}
