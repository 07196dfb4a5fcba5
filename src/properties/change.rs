//! Explicit property change batches
//!
//! A save operates on an immutable baseline plus a list of proposed changes,
//! applied as one batch. Each update is classified into a `PropertyDelta`
//! describing the structural work it implies; the orchestrator orders that
//! work (drops before adds, two-phase renames) without any hidden mutable
//! aliasing between "old" and "new" views of a property.

use crate::properties::descriptor::{Lookup, PropertyDescriptor};
use crate::properties::types::PropertyType;
use serde::{Deserialize, Serialize};

/// Caller-supplied definition of a new or updated property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDraft {
    pub name: String,
    pub property_type: PropertyType,
    pub scale: Option<i32>,
    pub required: bool,
    pub mv_enabled: bool,
    pub description: Option<String>,
    pub format: Option<String>,
    pub url: Option<String>,
    pub default_value: Option<String>,
    pub lookup: Option<Lookup>,
}

impl PropertyDraft {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            scale: None,
            required: false,
            mv_enabled: false,
            description: None,
            format: None,
            url: None,
            default_value: None,
            lookup: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn mv_enabled(mut self) -> Self {
        self.mv_enabled = true;
        self
    }

    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_lookup(mut self, schema: impl Into<String>, query: impl Into<String>) -> Self {
        self.lookup = Some(Lookup {
            schema: schema.into(),
            query: query.into(),
        });
        self
    }

    pub fn effective_scale(&self) -> i32 {
        self.scale.unwrap_or_else(|| self.property_type.default_scale())
    }
}

/// One proposed change against a loaded domain baseline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyChange {
    Add(PropertyDraft),
    Update { property_id: i32, draft: PropertyDraft },
    Delete { property_id: i32 },
}

/// Structural classification of an update, derived by diffing a draft
/// against its baseline descriptor
#[derive(Debug, Clone, Default)]
pub struct PropertyDelta {
    pub renamed: bool,
    /// Type change Postgres cannot apply in place: drop + recreate
    pub recreate_required: bool,
    /// In-place type change (widening cast)
    pub retyped_in_place: bool,
    pub resized_grow: bool,
    pub resized_shrink: bool,
    pub mv_enabled_now: bool,
    pub mv_disabled_now: bool,
    pub newly_required: bool,
    pub metadata_only: bool,
}

impl PropertyDelta {
    /// Diff a proposed draft against the baseline descriptor it updates.
    pub fn classify(baseline: &PropertyDescriptor, draft: &PropertyDraft) -> PropertyDelta {
        let mut delta = PropertyDelta::default();

        delta.renamed = !baseline.name.eq_ignore_ascii_case(&draft.name);

        if baseline.property_type != draft.property_type {
            if baseline.property_type.recreate_required(draft.property_type) {
                delta.recreate_required = true;
            } else {
                delta.retyped_in_place = true;
            }
        }

        let new_scale = draft.effective_scale();
        if scale_applies(draft.property_type) && new_scale != baseline.scale {
            // scale 0 means unbounded TEXT; treat moving to 0 as growth
            if new_scale == 0 || (baseline.scale != 0 && new_scale > baseline.scale) {
                delta.resized_grow = true;
            } else {
                delta.resized_shrink = true;
            }
        }

        delta.mv_enabled_now = !baseline.mv_enabled && draft.mv_enabled;
        delta.mv_disabled_now = baseline.mv_enabled && !draft.mv_enabled;
        // A property that is newly required, or stays required while losing
        // MV tolerance, must pass the existing-NULLs scan.
        delta.newly_required = (!baseline.required && draft.required)
            || (draft.required && delta.mv_disabled_now);

        delta.metadata_only = !delta.renamed
            && !delta.recreate_required
            && !delta.retyped_in_place
            && !delta.resized_grow
            && !delta.resized_shrink
            && !delta.mv_enabled_now
            && !delta.mv_disabled_now;

        delta
    }

    pub fn is_structural(&self) -> bool {
        !self.metadata_only
    }
}

fn scale_applies(t: PropertyType) -> bool {
    matches!(
        t,
        PropertyType::Text | PropertyType::Attachment | PropertyType::UniqueId
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(name: &str, t: PropertyType, scale: i32) -> PropertyDescriptor {
        PropertyDescriptor {
            property_id: 7,
            domain_id: 1,
            property_uri: format!("urn:labplate:prop:{name}"),
            name: name.to_string(),
            property_type: t,
            scale,
            required: false,
            mv_enabled: false,
            storage_column_name: Some(name.to_lowercase()),
            sort_order: 0,
            description: None,
            format: None,
            url: None,
            default_value: None,
            lookup: None,
        }
    }

    #[test]
    fn rename_detected() {
        let b = baseline("x", PropertyType::Text, 4000);
        let d = PropertyDraft::new("y", PropertyType::Text).with_scale(4000);
        let delta = PropertyDelta::classify(&b, &d);
        assert!(delta.renamed);
        assert!(!delta.metadata_only);
    }

    #[test]
    fn incompatible_retype_requires_recreate() {
        let b = baseline("x", PropertyType::Text, 4000);
        let d = PropertyDraft::new("x", PropertyType::Integer);
        assert!(PropertyDelta::classify(&b, &d).recreate_required);
    }

    #[test]
    fn widening_is_in_place() {
        let b = baseline("x", PropertyType::Integer, 0);
        let d = PropertyDraft::new("x", PropertyType::BigInt);
        let delta = PropertyDelta::classify(&b, &d);
        assert!(delta.retyped_in_place);
        assert!(!delta.recreate_required);
    }

    #[test]
    fn shrink_vs_grow() {
        let b = baseline("x", PropertyType::Text, 100);
        let grow = PropertyDelta::classify(&b, &PropertyDraft::new("x", PropertyType::Text).with_scale(200));
        assert!(grow.resized_grow && !grow.resized_shrink);
        let shrink =
            PropertyDelta::classify(&b, &PropertyDraft::new("x", PropertyType::Text).with_scale(50));
        assert!(shrink.resized_shrink && !shrink.resized_grow);
    }

    #[test]
    fn required_with_mv_loss_counts_as_newly_required() {
        let mut b = baseline("x", PropertyType::Text, 100);
        b.required = true;
        b.mv_enabled = true;
        let d = {
            let mut d = PropertyDraft::new("x", PropertyType::Text).with_scale(100);
            d.required = true;
            d
        };
        assert!(PropertyDelta::classify(&b, &d).newly_required);
    }

    #[test]
    fn no_change_is_metadata_only() {
        let b = baseline("x", PropertyType::Double, 0);
        let d = PropertyDraft::new("x", PropertyType::Double);
        assert!(PropertyDelta::classify(&b, &d).metadata_only);
    }
}
