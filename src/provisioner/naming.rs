//! Physical identifier naming and collision-avoiding alias allocation
//!
//! Logical property names are arbitrary user text; physical column names must
//! be legal, unique Postgres identifiers. Allocation is seeded with every
//! name already claimed (base columns first, then surviving properties) and
//! leaves headroom for the MV indicator suffix so enabling MV tracking later
//! never requires widening the name.

use crate::properties::types::MV_INDICATOR_SUFFIX;
use std::collections::HashSet;
use uuid::Uuid;

/// Postgres identifier byte limit.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Maximum length of an allocated storage column name, reserving room for
/// `_mvindicator` plus a collision counter suffix.
const MAX_COLUMN_BASE_LEN: usize = MAX_IDENTIFIER_LEN - (MV_INDICATOR_SUFFIX.len() + 1) - 4;

/// Normalize arbitrary text to a legal lowercase Postgres identifier:
/// non-alphanumerics become underscores, runs of separators collapse, and a
/// leading digit gets a prefix.
pub fn legal_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    // collapse repeated separators
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_underscore = false;
    for ch in out.chars() {
        if ch == '_' {
            if !prev_underscore {
                collapsed.push(ch);
            }
            prev_underscore = true;
        } else {
            collapsed.push(ch);
            prev_underscore = false;
        }
    }
    let trimmed = collapsed.trim_matches('_');
    let mut name = if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    };
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, 'c');
    }
    name.truncate(MAX_IDENTIFIER_LEN);
    name
}

/// Deterministic, dialect-legal table name for a provisioned domain:
/// container id + domain id + domain name, normalized with repeated
/// separators collapsed.
pub fn make_table_name(container: Uuid, domain_id: i32, domain_name: &str) -> String {
    let container_short = container.simple().to_string()[..8].to_string();
    let raw = format!("c{container_short}d{domain_id}_{domain_name}");
    legal_identifier(&raw)
}

/// Collision-free temporary column name for phase one of a two-phase rename.
pub fn temp_rename_identifier() -> String {
    let nonce: u32 = rand::random();
    format!("renametmp_{nonce:08x}")
}

/// Allocates unique physical column names within one domain's table.
///
/// Two logical names that collide after normalization resolve to distinct
/// physical names via a numeric suffix.
pub struct ColumnAliasAllocator {
    claimed: HashSet<String>,
}

impl ColumnAliasAllocator {
    pub fn new() -> Self {
        Self {
            claimed: HashSet::new(),
        }
    }

    /// Seed with an already-claimed physical name (base columns, existing
    /// non-deleted properties).
    pub fn claim(&mut self, name: &str) {
        self.claimed.insert(name.to_ascii_lowercase());
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.claimed.contains(&name.to_ascii_lowercase())
    }

    /// Allocate a storage column name for a logical property name. The
    /// result is claimed together with its would-be MV shadow name, so an
    /// MV column enabled later can never collide either.
    pub fn allocate(&mut self, logical_name: &str) -> String {
        let mut base = legal_identifier(logical_name);
        base.truncate(MAX_COLUMN_BASE_LEN);
        let base = match base.trim_end_matches('_') {
            // names that normalize to nothing still need a column
            "" => "column".to_string(),
            trimmed => trimmed.to_string(),
        };

        let mut candidate = base.clone();
        let mut counter = 1;
        while self.claimed.contains(&candidate)
            || self
                .claimed
                .contains(&format!("{candidate}_{MV_INDICATOR_SUFFIX}"))
        {
            counter += 1;
            candidate = format!("{base}_{counter}");
        }
        self.claimed.insert(candidate.clone());
        self.claimed
            .insert(format!("{candidate}_{MV_INDICATOR_SUFFIX}"));
        candidate
    }
}

impl Default for ColumnAliasAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legalizes_and_collapses() {
        assert_eq!(legal_identifier("Sample  Volume (uL)"), "sample_volume_ul");
        assert_eq!(legal_identifier("a__b___c"), "a_b_c");
        assert_eq!(legal_identifier("3rd Reading"), "c3rd_reading");
    }

    #[test]
    fn table_name_is_deterministic() {
        let c = Uuid::parse_str("a1b2c3d4-0000-0000-0000-000000000000").unwrap();
        let t1 = make_table_name(c, 42, "Plate Metadata");
        let t2 = make_table_name(c, 42, "Plate Metadata");
        assert_eq!(t1, t2);
        assert!(t1.starts_with("ca1b2c3d4d42_"));
        assert!(t1.len() <= 63);
    }

    #[test]
    fn normalized_collisions_get_distinct_names() {
        let mut alloc = ColumnAliasAllocator::new();
        let a = alloc.allocate("My Field");
        let b = alloc.allocate("my-field");
        let c = alloc.allocate("my_field");
        assert_eq!(a, "my_field");
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn base_columns_block_allocation() {
        let mut alloc = ColumnAliasAllocator::new();
        alloc.claim("lsid");
        assert_eq!(alloc.allocate("LSID"), "lsid_2");
    }

    #[test]
    fn mv_headroom_is_reserved() {
        let mut alloc = ColumnAliasAllocator::new();
        let long = "x".repeat(120);
        let name = alloc.allocate(&long);
        assert!(name.len() + 1 + MV_INDICATOR_SUFFIX.len() <= 63);
        // a second long name must not collide even after truncation
        let name2 = alloc.allocate(&long);
        assert_ne!(name, name2);
    }

    #[test]
    fn allocating_a_name_blocks_its_mv_shadow() {
        let mut alloc = ColumnAliasAllocator::new();
        let first = alloc.allocate("titer");
        assert_eq!(first, "titer");
        // a property literally named like the shadow column may not claim it
        let shadow = alloc.allocate("titer_mvindicator");
        assert_ne!(shadow, "titer_mvindicator");
    }

    #[test]
    fn temp_rename_identifiers_are_distinct() {
        let a = temp_rename_identifier();
        let b = temp_rename_identifier();
        assert_ne!(a, b);
        assert!(a.starts_with("renametmp_"));
    }

    proptest::proptest! {
        #[test]
        fn legal_identifier_is_always_legal(raw in ".{0,100}") {
            let name = legal_identifier(&raw);
            proptest::prop_assert!(!name.is_empty());
            proptest::prop_assert!(name.len() <= MAX_IDENTIFIER_LEN);
            proptest::prop_assert!(name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            proptest::prop_assert!(!name.chars().next().unwrap().is_ascii_digit());
        }

        #[test]
        fn allocator_never_hands_out_duplicates(names in proptest::collection::vec(".{1,80}", 1..20)) {
            let mut alloc = ColumnAliasAllocator::new();
            let mut seen = HashSet::new();
            for name in &names {
                let column = alloc.allocate(name);
                proptest::prop_assert!(seen.insert(column.clone()));
                proptest::prop_assert!(column.len() + 1 + MV_INDICATOR_SUFFIX.len() <= MAX_IDENTIFIER_LEN);
            }
        }
    }
}
