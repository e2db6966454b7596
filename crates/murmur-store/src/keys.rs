use crate::error::StoreError;

const MAX_KEY_LEN: usize = 128;

/// Accept only `[A-Za-z0-9_-]{1,128}` for anything that ends up in a path.
pub fn validate_key(kind: &str, key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(format!("{kind} {key:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_safe_keys() {
        assert!(validate_key("k", "abc-DEF_123").is_ok());
        assert!(validate_key("k", &"a".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn rejects_path_like_keys() {
        for bad in ["", "..", "a/b", "a\\b", "a b", "é"] {
            assert!(validate_key("k", bad).is_err(), "accepted {bad:?}");
        }
        assert!(validate_key("k", &"a".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
