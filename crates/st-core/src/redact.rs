//! Masking of secrets in inbound commands before they reach the log

use serde_json::Value;

/// Fields whose string values are replaced before logging
pub const SENSITIVE_FIELDS: [&str; 3] = ["sshPassword", "privateSSHKey", "certPassphrase"];

const MASK_CHAR: char = '*';

/// Replace every character of `value` with the mask character.
pub fn mask(value: &str) -> String {
    std::iter::repeat(MASK_CHAR)
        .take(value.chars().count())
        .collect()
}

/// Render a raw command for logging with sensitive fields masked.
///
/// Input that does not parse as JSON is never echoed, since there is no way
/// to tell which part of it is secret.
pub fn redact_command(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(mut value) => {
            mask_sensitive(&mut value);
            value.to_string()
        }
        Err(_) => format!("<unparseable command, {} bytes>", raw.len()),
    }
}

fn mask_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                match field {
                    Value::String(s) if SENSITIVE_FIELDS.contains(&key.as_str()) => {
                        *s = mask(s);
                    }
                    _ => mask_sensitive(field),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_sensitive),
        _ => {}
    }
}
