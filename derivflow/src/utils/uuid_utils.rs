//! Run identifier generation.

use uuid::Uuid;

/// Length of a generated run identifier.
pub const RUN_ID_LEN: usize = 8;

/// Generates a new random UUID (v4).
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a short run identifier: the first eight hex digits of a v4 UUID.
#[must_use]
pub fn generate_run_id() -> String {
    generate_uuid().simple().to_string()[..RUN_ID_LEN].to_string()
}

/// Returns true if `id` is usable as a run identifier (and as a directory name).
#[must_use]
pub fn is_valid_run_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert_eq!(id.len(), RUN_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(is_valid_run_id(&id));
    }

    #[test]
    fn test_run_ids_differ() {
        let ids: HashSet<_> = (0..64).map(|_| generate_run_id()).collect();
        assert!(ids.len() > 60);
    }

    #[test]
    fn test_invalid_run_ids() {
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("../etc"));
        assert!(!is_valid_run_id("a/b"));
        assert!(is_valid_run_id("run-2024_01"));
    }
}
