// src/analysis/reference_dimensions.rs
//
// Expected real-world heights per hazard class. The pinhole depth estimate
// is only as good as this table: a hard hat read as a 1.7m person would be
// placed seven times too far away.

use crate::types::HazardClass;
use std::collections::HashMap;

/// Used for classes missing from the table. Unknown classes also carry an
/// uncertainty penalty in the mapper.
pub const DEFAULT_REFERENCE_HEIGHT_M: f64 = 1.0;

const HEAD_LEVEL_M: f64 = 0.25;
const TORSO_LEVEL_M: f64 = 0.60;
const TALL_EQUIPMENT_M: f64 = 3.0;

/// Built-in construction-site classes.
const BUILTIN_HEIGHTS: &[(&str, f64)] = &[
    ("hard_hat", HEAD_LEVEL_M),
    ("hardhat", HEAD_LEVEL_M),
    ("no_hard_hat", HEAD_LEVEL_M),
    ("no_hardhat", HEAD_LEVEL_M),
    ("helmet", HEAD_LEVEL_M),
    ("head", HEAD_LEVEL_M),
    ("safety_vest", TORSO_LEVEL_M),
    ("no_safety_vest", TORSO_LEVEL_M),
    ("vest", TORSO_LEVEL_M),
    ("torso", TORSO_LEVEL_M),
    ("person", 1.70),
    ("worker", 1.70),
    ("safety_cone", 0.70),
    ("cone", 0.70),
    ("barrier", 1.00),
    ("electrical_hazard", 0.50),
    ("fall_hazard", 1.00),
    ("ladder", TALL_EQUIPMENT_M),
    ("machinery", 2.50),
    ("excavator", TALL_EQUIPMENT_M),
    ("crane", TALL_EQUIPMENT_M),
    ("truck", TALL_EQUIPMENT_M),
    ("forklift", TALL_EQUIPMENT_M),
    ("scaffolding", TALL_EQUIPMENT_M),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceLookup {
    pub height_m: f64,
    /// True when the class was not in the table and the default was used.
    pub is_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct ReferenceDimensions {
    heights: HashMap<HazardClass, f64>,
    default_height_m: Option<f64>,
}

impl ReferenceDimensions {
    pub fn new(default_height_m: Option<f64>) -> Self {
        Self {
            heights: HashMap::new(),
            default_height_m,
        }
    }

    /// Built-in table plus `overrides` (override wins on conflict).
    pub fn with_overrides(
        overrides: &HashMap<String, f64>,
        default_height_m: Option<f64>,
    ) -> Self {
        let mut table = Self::builtin(default_height_m);
        for (class, height) in overrides {
            table.insert(HazardClass::new(class), *height);
        }
        table
    }

    pub fn builtin(default_height_m: Option<f64>) -> Self {
        let mut table = Self::new(default_height_m);
        for (class, height) in BUILTIN_HEIGHTS {
            table.insert(HazardClass::new(class), *height);
        }
        table
    }

    pub fn insert(&mut self, class: HazardClass, height_m: f64) {
        self.heights.insert(class, height_m);
    }

    pub fn resolve(&self, class: &HazardClass) -> Option<ReferenceLookup> {
        if let Some(height_m) = self.heights.get(class) {
            return Some(ReferenceLookup {
                height_m: *height_m,
                is_fallback: false,
            });
        }
        self.default_height_m.map(|height_m| ReferenceLookup {
            height_m,
            is_fallback: true,
        })
    }
}

impl Default for ReferenceDimensions {
    fn default() -> Self {
        Self::builtin(Some(DEFAULT_REFERENCE_HEIGHT_M))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_levels() {
        let table = ReferenceDimensions::default();
        let hat = table.resolve(&HazardClass::new("hard_hat")).unwrap();
        assert_eq!(hat.height_m, 0.25);
        assert!(!hat.is_fallback);

        let vest = table.resolve(&HazardClass::new("No-Safety-Vest")).unwrap();
        assert_eq!(vest.height_m, 0.60);

        let crane = table.resolve(&HazardClass::new("crane")).unwrap();
        assert_eq!(crane.height_m, 3.0);
    }

    #[test]
    fn test_unknown_class_uses_default() {
        let table = ReferenceDimensions::default();
        let unknown = table.resolve(&HazardClass::new("wet_floor")).unwrap();
        assert_eq!(unknown.height_m, DEFAULT_REFERENCE_HEIGHT_M);
        assert!(unknown.is_fallback);
    }

    #[test]
    fn test_unknown_class_without_default_is_unresolved() {
        let table = ReferenceDimensions::builtin(None);
        assert!(table.resolve(&HazardClass::new("wet_floor")).is_none());
        assert!(table.resolve(&HazardClass::new("person")).is_some());
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = HashMap::new();
        overrides.insert("Person".to_string(), 1.8);
        overrides.insert("generator".to_string(), 1.2);
        let table = ReferenceDimensions::with_overrides(&overrides, None);

        assert_eq!(table.resolve(&HazardClass::new("person")).unwrap().height_m, 1.8);
        assert_eq!(table.resolve(&HazardClass::new("generator")).unwrap().height_m, 1.2);
    }
}
