//! Assay-specific plate layout handlers
//!
//! Each assay type owns a handler that seeds new templates with the groups
//! that assay expects. Handlers live in an injected registry keyed by assay
//! type name.

use crate::plate::{Plate, PlateType, WellGroup, WellGroupType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait PlateLayoutHandler: Send + Sync {
    /// Assay type this handler seeds templates for.
    fn assay_type(&self) -> &'static str;

    /// Named layout variants this handler offers, if more than the default.
    fn layout_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Build a fresh template, seeded with this assay's standard groups.
    fn create_template(&self, container: Uuid, name: &str, plate_type: PlateType) -> Plate;

    /// Hook run before a plate of this assay type is saved. Handlers may
    /// consult the database to enforce assay-specific layout rules.
    async fn validate(&self, plate: &Plate) -> Result<(), String> {
        let _ = plate;
        Ok(())
    }
}

/// Baseline handler: every template starts with a positive and a negative
/// control group, positions left for the user to paint.
pub struct DefaultLayoutHandler;

pub const POSITIVE_CONTROL_GROUP: &str = "Positive";
pub const NEGATIVE_CONTROL_GROUP: &str = "Negative";

#[async_trait]
impl PlateLayoutHandler for DefaultLayoutHandler {
    fn assay_type(&self) -> &'static str {
        "blank"
    }

    fn create_template(&self, container: Uuid, name: &str, plate_type: PlateType) -> Plate {
        let mut plate = Plate::new(container, name, plate_type, true);
        plate.well_groups.push(WellGroup::new(
            POSITIVE_CONTROL_GROUP,
            WellGroupType::Control,
        ));
        plate.well_groups.push(WellGroup::new(
            NEGATIVE_CONTROL_GROUP,
            WellGroupType::Control,
        ));
        plate
    }
}

#[derive(Default)]
pub struct PlateLayoutHandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn PlateLayoutHandler>>,
}

impl PlateLayoutHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn PlateLayoutHandler>) {
        self.handlers.insert(handler.assay_type(), handler);
    }

    pub fn get(&self, assay_type: &str) -> Option<Arc<dyn PlateLayoutHandler>> {
        self.handlers.get(assay_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate_type_96() -> PlateType {
        PlateType {
            plate_type_id: 1,
            rows: 8,
            cols: 12,
            description: None,
        }
    }

    #[test]
    fn default_template_seeds_control_groups() {
        let plate =
            DefaultLayoutHandler.create_template(Uuid::new_v4(), "template", plate_type_96());
        assert!(plate.template);
        assert_eq!(plate.well_groups.len(), 2);
        assert!(plate
            .group_by_name(WellGroupType::Control, POSITIVE_CONTROL_GROUP)
            .is_some());
        assert!(plate
            .group_by_name(WellGroupType::Control, NEGATIVE_CONTROL_GROUP)
            .is_some());
        // groups start unpainted
        assert!(plate.well_groups.iter().all(|g| g.positions().is_empty()));
    }

    #[test]
    fn registry_resolves_by_assay_type() {
        let mut registry = PlateLayoutHandlerRegistry::new();
        registry.register(Arc::new(DefaultLayoutHandler));
        assert!(registry.get("blank").is_some());
        assert!(registry.get("elisa").is_none());
    }
}
