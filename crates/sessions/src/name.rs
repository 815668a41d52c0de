/// Longest accepted session name.
pub const MAX_SESSION_NAME_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session name `{name}`: {reason}")]
pub struct InvalidSessionName {
    pub name: String,
    pub reason: &'static str,
}

/// Check that a session name is safe to use in file names and URL paths.
///
/// Names are never rewritten: a name either passes as-is or is rejected, so
/// lookups stay exact-match.
pub fn validate_session_name(name: &str) -> Result<(), InvalidSessionName> {
    let reject = |reason| {
        Err(InvalidSessionName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("must not be empty");
    }
    if name.len() > MAX_SESSION_NAME_LEN {
        return reject("too long");
    }
    if name == "." || name == ".." {
        return reject("reserved name");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+'))
    {
        return reject("only ASCII letters, digits and . _ - @ + are allowed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for name in ["alice", "shop-42", "sales_team", "+15551234567", "a.b@c"] {
            assert!(validate_session_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_path_tricks() {
        for name in ["", ".", "..", "a/b", "..\\x", "name with space", "ünï"] {
            assert!(validate_session_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(MAX_SESSION_NAME_LEN + 1);
        let err = validate_session_name(&name).unwrap_err();
        assert_eq!(err.reason, "too long");
    }
}
