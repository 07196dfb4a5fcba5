//! DomainKind: per-family storage and validation strategy
//!
//! A domain's behavior — which columns are mandatory, where its table lives,
//! which names are reserved — is entirely delegated to its kind. Kinds are
//! held in an explicit registry injected into the services that need them.

use crate::properties::descriptor::Domain;
use crate::properties::types::{ForeignKeySpec, PropertyStorageSpec, TableIndex};
use std::collections::HashMap;
use std::sync::Arc;

/// Capability object defining mandatory columns, storage location and
/// lifecycle hooks for a family of domains.
pub trait DomainKind: Send + Sync {
    /// Stable kind name stored on the domain descriptor.
    fn kind_name(&self) -> &'static str;

    /// Schema that provisioned tables for this kind live in.
    fn storage_schema_name(&self) -> &str {
        "labplate_storage"
    }

    /// Kind-mandated columns, always present as real columns even if absent
    /// from the logical property list.
    fn base_properties(&self, domain: &Domain) -> Vec<PropertyStorageSpec>;

    /// Logical names callers may not claim for their own properties.
    fn reserved_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Indices the kind requires on every provisioned table, beyond any the
    /// domain itself declares.
    fn required_indices(&self, domain: &Domain) -> Vec<TableIndex> {
        let _ = domain;
        Vec::new()
    }

    /// Foreign keys declared on the provisioned table at creation time.
    fn foreign_keys(&self, domain: &Domain) -> Vec<ForeignKeySpec> {
        let _ = domain;
        Vec::new()
    }

    /// True when the kind intentionally declares property descriptors that
    /// shadow base columns (overrides); shadowed declarations are then
    /// skipped silently during provisioning instead of logged.
    fn properties_include_base_properties(&self) -> bool {
        false
    }

    /// True for kinds whose row data is replaced wholesale on field import;
    /// the save orchestrator truncates before applying column changes when
    /// the caller asks for it.
    fn delete_all_data_on_field_import(&self) -> bool {
        false
    }

    /// Drop any kind-level cached view of this domain. Called after
    /// provisioning changes commit.
    fn invalidate(&self, domain: &Domain) {
        let _ = domain;
    }
}

/// Explicit registry of kinds, keyed by kind name.
#[derive(Default)]
pub struct DomainKindRegistry {
    kinds: HashMap<&'static str, Arc<dyn DomainKind>>,
}

impl DomainKindRegistry {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: Arc<dyn DomainKind>) {
        self.kinds.insert(kind.kind_name(), kind);
    }

    pub fn get(&self, kind_name: &str) -> Option<Arc<dyn DomainKind>> {
        self.kinds.get(kind_name).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &Arc<dyn DomainKind>> {
        self.kinds.values()
    }
}

#[cfg(test)]
pub(crate) mod test_kinds {
    use super::*;
    use crate::properties::types::PropertyType;

    /// Minimal kind used by unit tests: rowid PK + lsid base columns.
    pub struct BasicTestKind;

    impl DomainKind for BasicTestKind {
        fn kind_name(&self) -> &'static str {
            "test"
        }

        fn base_properties(&self, _domain: &Domain) -> Vec<PropertyStorageSpec> {
            vec![
                PropertyStorageSpec::new("rowid", PropertyType::Integer)
                    .primary_key()
                    .auto_increment(),
                PropertyStorageSpec::new("lsid", PropertyType::Text)
                    .with_scale(300)
                    .not_null(),
            ]
        }

        fn reserved_names(&self) -> Vec<String> {
            vec!["container".to_string()]
        }

        fn required_indices(&self, _domain: &Domain) -> Vec<TableIndex> {
            vec![TableIndex::unique(&["lsid"])]
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = DomainKindRegistry::new();
        registry.register(Arc::new(BasicTestKind));
        assert!(registry.get("test").is_some());
        assert!(registry.get("missing").is_none());
    }
}
