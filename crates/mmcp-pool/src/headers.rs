use std::collections::HashMap;

/// Headers that must never be forwarded downstream, even when configured.
/// Matched against the lowercased header name.
const DENIED_HEADERS: &[&str] = &[
    "host",
    "cookie",
    "set-cookie",
    "content-length",
    "transfer-encoding",
    "connection",
    "upgrade",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "expect",
];

const DENIED_PREFIXES: &[&str] = &["proxy-", "sec-"];

/// True when a header name is on the deny list (exact or prefix match).
pub fn is_denied_header(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    DENIED_HEADERS.contains(&lowered.as_str())
        || DENIED_PREFIXES
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
}

/// Strip CR, LF, and NUL so a value cannot smuggle extra header lines.
pub fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\0'))
        .collect()
}

/// Accept-time pass over the raw upstream headers: drop denied names,
/// collapse multi-valued headers to their first element, and sanitize values.
/// The result is the safe candidate set a session may later forward.
pub fn sanitize_candidate_headers(
    upstream: &HashMap<String, Vec<String>>,
) -> HashMap<String, String> {
    let mut candidates = HashMap::new();
    for (name, values) in upstream {
        if is_denied_header(name) {
            tracing::debug!(header = %name, "dropping denied forward header");
            continue;
        }
        let Some(first) = values.first() else {
            continue;
        };
        let sanitized = sanitize_header_value(first);
        if !sanitized.is_empty() {
            candidates.insert(name.clone(), sanitized);
        }
    }
    candidates
}

/// Pick the candidate headers one backend asked to receive. The deny list is
/// re-applied so a hand-built candidate map cannot bypass it.
pub fn select_forward_headers(
    candidates: &HashMap<String, String>,
    forward_list: &[String],
) -> HashMap<String, String> {
    let mut forwarded = HashMap::new();
    for wanted in forward_list {
        if is_denied_header(wanted) {
            continue;
        }
        if let Some((_, value)) = candidates
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
        {
            forwarded.insert(wanted.clone(), sanitize_header_value(value));
        }
    }
    forwarded
}

/// Select and sanitize the upstream headers a backend asked to receive.
///
/// `upstream` maps header names to their received values (one entry per
/// occurrence); multi-valued headers collapse to the first element. Denied
/// names are dropped silently.
pub fn scrub_forward_headers(
    upstream: &HashMap<String, Vec<String>>,
    forward_list: &[String],
) -> HashMap<String, String> {
    select_forward_headers(&sanitize_candidate_headers(upstream), forward_list)
}
