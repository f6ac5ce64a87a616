//! Deterministic names for generated objects.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Kubernetes limit for object names that double as label values.
pub const MAX_NAME_LENGTH: usize = 63;

// Alphabet without vowels and confusable digits, so hashes never spell words.
const ALPHANUMS: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Stable short hash of a value's semantic content.
///
/// The value is rendered as JSON with object keys sorted, so field order in the
/// source never changes the result.
pub fn deep_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    let mut canonical = String::new();
    write_canonical(&v, &mut canonical);

    let mut h: u32 = 0x811c9dc5; // 32-bit FNV-1a offset
    for b in canonical.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    Ok(safe_encode(&h.to_string()))
}

fn safe_encode(s: &str) -> String {
    s.bytes().map(|b| ALPHANUMS[b as usize % ALPHANUMS.len()] as char).collect()
}

fn write_canonical(v: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 { out.push(','); }
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 { out.push(','); }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// `base-suffix`, truncating `base` (never the suffix) to fit [`MAX_NAME_LENGTH`].
pub fn object_name_for_base_and_suffix(base: &str, suffix: &str) -> String {
    let budget = MAX_NAME_LENGTH.saturating_sub(suffix.len() + 1);
    let mut cut = base.len().min(budget);
    while !base.is_char_boundary(cut) { cut -= 1; }
    format!("{}-{}", &base[..cut], suffix)
}

const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const DNS1123_SUBDOMAIN_FMT: &str = r"[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*";

static DNS1123_SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| match Regex::new(&format!("^{}$", DNS1123_SUBDOMAIN_FMT)) {
    Ok(re) => re,
    Err(e) => unreachable!("constant DNS-1123 pattern failed to compile: {e}"),
});

/// Problems with `value` as a lowercase RFC 1123 subdomain; empty when valid.
pub fn dns1123_subdomain_errors(value: &str) -> Vec<String> {
    let mut errs = Vec::new();
    if value.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
        errs.push(format!("must be no more than {} characters", DNS1123_SUBDOMAIN_MAX_LENGTH));
    }
    if !DNS1123_SUBDOMAIN_RE.is_match(value) {
        errs.push(format!(
            "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character (e.g. 'example.com', regex used for validation is '{}')",
            DNS1123_SUBDOMAIN_FMT
        ));
    }
    errs
}
