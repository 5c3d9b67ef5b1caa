// src/utils.rs
// Shared helpers: codes, currency and name formatting, URL building

use crate::error::Result;
use rand::Rng;
use url::Url;

/// Length of generated session and actor codes.
pub const CODE_LENGTH: usize = 8;

const CODE_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random lowercase alphanumeric code.
///
/// Codes identify sessions and session actors in URLs, so they stay
/// short and unambiguous. Uniqueness is enforced at the schema level;
/// callers retry on collision.
pub fn random_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CODE_CHARSET[rng.random_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

/// Format an amount of cents as a currency string, e.g. 108 -> "$1.08".
pub fn currency(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

/// Human-readable name for a row: "#{id}", or "#{id} (label)" when labeled.
pub fn id_label_name(id: i64, label: Option<&str>) -> String {
    match label {
        Some(l) if !l.trim().is_empty() => format!("#{} ({})", id, l.trim()),
        _ => format!("#{}", id),
    }
}

/// Format an experiment-app label for display: "prisoner_dilemma" -> "Prisoner Dilemma".
pub fn app_name_format(app_label: &str) -> String {
    app_label
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Append query parameters to an absolute URL.
pub fn add_params_to_url(url: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut parsed = Url::parse(url)?;
    for (key, value) in params {
        parsed.query_pairs_mut().append_pair(key, value);
    }
    Ok(parsed.to_string())
}

/// Join a start path onto the configured base URL.
pub fn absolute_url(base: &str, path: &str) -> Result<String> {
    Ok(Url::parse(base)?.join(path)?.to_string())
}
