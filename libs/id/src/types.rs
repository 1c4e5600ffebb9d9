//! Typed ID definitions for all control plane resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Infrastructure
// =============================================================================

define_id!(NodeId, "node");

// =============================================================================
// Workloads and Resources
// =============================================================================

define_id!(WorkloadId, "wl");
define_id!(AllocationId, "alloc");
define_id!(TransferId, "xfer");

// =============================================================================
// Actors and Requests
// =============================================================================

define_id!(UserId, "usr");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_roundtrip() {
        let id = NodeId::new();
        let s = id.to_string();
        let parsed: NodeId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_node_id_prefix() {
        let id = NodeId::new();
        let s = id.to_string();
        assert!(s.starts_with("node_"));
    }

    #[test]
    fn test_workload_id_invalid_prefix() {
        let result: Result<WorkloadId, _> = "node_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix { .. }
        ));
    }

    #[test]
    fn test_allocation_id_missing_separator() {
        let result: Result<AllocationId, _> = "alloc01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_transfer_id_empty() {
        let result: Result<TransferId, _> = "".parse();
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_transfer_id_invalid_ulid() {
        let result: Result<TransferId, _> = "xfer_invalid".parse();
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidUlid(_)
        ));
    }

    #[test]
    fn test_workload_id_json_roundtrip() {
        let id = WorkloadId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: WorkloadId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_sortable_by_creation_time() {
        let first = AllocationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = AllocationId::new();
        assert!(first < second);
    }

    proptest::proptest! {
        #[test]
        fn prop_node_id_roundtrip(ms in 0u64..(1u64 << 47)) {
            let ulid = crate::Ulid::from_parts(ms, 42);
            let id = NodeId::from_ulid(ulid);
            let parsed = NodeId::parse(&id.to_string()).unwrap();
            proptest::prop_assert_eq!(id, parsed);
        }
    }
}
