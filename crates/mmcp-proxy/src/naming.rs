/// Separator between the sanitized server prefix and the original name.
pub const MANGLE_SEPARATOR: &str = "__";

/// Normalize a server name into a safe mangling prefix.
///
/// Characters outside `[A-Za-z0-9_-]` map to `_`, runs of `_` collapse to
/// one, and leading/trailing `_` are trimmed. Idempotent.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if prev_underscore {
                continue;
            }
            prev_underscore = true;
        } else {
            prev_underscore = false;
        }
        out.push(mapped);
    }

    out.trim_matches('_').to_string()
}

/// Expose a backend entry under its namespace-qualified name.
pub fn mangle(server_name: &str, original: &str) -> String {
    format!("{}{MANGLE_SEPARATOR}{original}", sanitize(server_name))
}

/// Split a mangled name at the *first* `__` into (prefix, original).
///
/// Deliberately non-hierarchical: `A__B__tool` splits to `("A", "B__tool")`,
/// so nested gateways peel one layer per hop.
pub fn split_mangled(name: &str) -> Option<(&str, &str)> {
    name.split_once(MANGLE_SEPARATOR)
}
