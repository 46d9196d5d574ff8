//! Identifier generation.

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered).
///
/// Runs, tasks, and log entries use v7 ids so that ids sort roughly by
/// creation time in every backend.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Parses a stored UUID string.
pub fn parse_uuid(value: &str) -> Result<Uuid, uuid::Error> {
    Uuid::parse_str(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_version() {
        assert_eq!(generate_uuid_v7().get_version_num(), 7);
    }

    #[test]
    fn test_v7_ids_are_time_ordered() {
        let first = generate_uuid_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_uuid_v7();
        assert!(first < second);
    }

    #[test]
    fn test_parse_uuid() {
        let id = generate_uuid_v7();
        assert_eq!(parse_uuid(&id.to_string()).unwrap(), id);
        assert!(parse_uuid("not-a-uuid").is_err());
    }
}
