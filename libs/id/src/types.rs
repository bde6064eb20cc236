//! Typed ID definitions for provider resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "i", [8, 17], |c: char| c.is_ascii_hexdigit());

// =============================================================================
// Spot Capacity
// =============================================================================

define_id!(SpotRequestId, "sir", [8], |c: char| c.is_ascii_alphanumeric());

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_instance_id_parse() {
        let id: InstanceId = "i-0abc123def4567890".parse().unwrap();
        assert_eq!(id.as_str(), "i-0abc123def4567890");
        assert_eq!(id.to_string(), "i-0abc123def4567890");
    }

    #[test]
    fn test_instance_id_legacy_length() {
        let id: InstanceId = "i-1a2b3c4d".parse().unwrap();
        assert_eq!(id.as_str(), "i-1a2b3c4d");
    }

    #[test]
    fn test_instance_id_normalises_case() {
        let id: InstanceId = "i-0ABC123DEF4567890".parse().unwrap();
        assert_eq!(id.as_str(), "i-0abc123def4567890");
    }

    #[test]
    fn test_instance_id_empty() {
        let result: Result<InstanceId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));

        let result: Result<InstanceId, _> = "   ".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_instance_id_invalid_prefix() {
        let result: Result<InstanceId, _> = "sir-08b93456".parse();
        let err = result.unwrap_err();
        assert!(err.is_prefix_error());
        assert!(matches!(err, IdError::InvalidPrefix { expected: "i", .. }));
    }

    #[test]
    fn test_instance_id_missing_separator() {
        let result: Result<InstanceId, _> = "i0abc123def4567890".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_instance_id_bad_length() {
        let result: Result<InstanceId, _> = "i-0abc".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidLength { len: 4 }
        ));
    }

    #[test]
    fn test_instance_id_bad_character() {
        let result: Result<InstanceId, _> = "i-0abc123def456789z".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { found: 'z' }
        ));
    }

    #[test]
    fn test_spot_request_id_parse() {
        let id: SpotRequestId = "sir-08b93456".parse().unwrap();
        assert_eq!(id.as_str(), "sir-08b93456");
    }

    #[test]
    fn test_instance_id_json_roundtrip() {
        let id: InstanceId = "i-0abc123def4567890".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"i-0abc123def4567890\"");
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_json_rejects_garbage() {
        let result: Result<InstanceId, _> = serde_json::from_str("\"inst_123\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        assert_ne!(InstanceId::PREFIX, SpotRequestId::PREFIX);
    }

    proptest! {
        #[test]
        fn prop_instance_id_roundtrip(suffix in "[0-9a-f]{17}") {
            let raw = format!("i-{suffix}");
            let id = InstanceId::parse(&raw).unwrap();
            prop_assert_eq!(id.to_string(), raw.clone());
            let reparsed: InstanceId = id.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, id);
        }

        #[test]
        fn prop_spot_request_id_roundtrip(suffix in "[0-9a-z]{8}") {
            let raw = format!("sir-{suffix}");
            let id = SpotRequestId::parse(&raw).unwrap();
            prop_assert_eq!(id.as_str(), raw.as_str());
        }
    }
}
