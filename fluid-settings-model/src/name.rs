//! Setting-name handling.
//!
//! Canonical names use `-`, never `_`. Every name read off the wire goes
//! through [`canonicalize`] so that `serial_number` and `serial-number`
//! address the same setting. Names are namespaced with `::`, most commonly
//! `<service>::<option>`.

/// Canonical form of a setting name: trimmed, underscores replaced by
/// hyphens.
pub fn canonicalize(name: &str) -> String {
    name.trim().replace('_', "-")
}

/// Qualify a watch name with the owning service.
///
/// A name without any `:` is private to the calling service and becomes
/// `<service>::<name>`; names that already carry a namespace (for example
/// `firewall::uri`) pass through untouched.
pub fn qualify(service: &str, name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{service}::{name}")
    }
}

/// Split a comma-separated `names` parameter into canonical names,
/// dropping empty entries.
pub fn split_names(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(canonicalize)
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_replaces_underscores() {
        assert_eq!(canonicalize("serial_number"), "serial-number");
        assert_eq!(canonicalize(" spaced "), "spaced");
        assert_eq!(canonicalize("already-fine"), "already-fine");
    }

    #[test]
    fn qualify_prepends_service_when_unqualified() {
        assert_eq!(qualify("bar", "foo"), "bar::foo");
        assert_eq!(qualify("bar", "other::foo"), "other::foo");
    }

    #[test]
    fn split_names_drops_empties() {
        assert_eq!(
            split_names("a_b, c ,,d"),
            vec!["a-b".to_string(), "c".to_string(), "d".to_string()]
        );
        assert!(split_names("").is_empty());
        assert!(split_names(" , ").is_empty());
    }
}
