//! Short opaque job identifiers.

/// Generate an 8-character lowercase-hex id, unique within this process's
/// lifetime (the first 8 hex digits of a v4 UUID).
pub fn short_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_id_is_not_trivially_constant() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
    }
}
