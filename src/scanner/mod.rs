//! Missing-indicator scanner.
//!
//! Walks a system and lists the indicator slots the AI gateway could fill,
//! in a stable order: step, then intervention, then registry order.

use crate::indicators::{IndicatorKey, IndicatorRegistry};
use crate::models::System;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinates of one indicator slot on an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub step_index: usize,
    pub intervention_index: usize,
    pub key: IndicatorKey,
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} / intervention {} / {}",
            self.step_index, self.intervention_index, self.key
        )
    }
}

/// Output of a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    /// Entry absent or value null.
    pub without_value: Vec<WorkItem>,
    /// Without value, or any status other than `user`.
    pub all_calculable: Vec<WorkItem>,
}

/// Sizes of both scan lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounts {
    pub without_value: usize,
    pub all_calculable: usize,
}

impl ScanResult {
    pub fn counts(&self) -> ScanCounts {
        ScanCounts {
            without_value: self.without_value.len(),
            all_calculable: self.all_calculable.len(),
        }
    }

    /// The list for a gap-fill run, or for a full recompute.
    pub fn select(self, recalculate_all: bool) -> Vec<WorkItem> {
        if recalculate_all {
            self.all_calculable
        } else {
            self.without_value
        }
    }
}

/// Scan every intervention of `system` for slots in `registry`.
pub fn scan(system: &System, registry: &IndicatorRegistry) -> ScanResult {
    let mut result = ScanResult::default();

    for (step_index, step) in system.steps.iter().enumerate() {
        for (intervention_index, intervention) in step.interventions.iter().enumerate() {
            for &key in registry.keys() {
                let entry = intervention.values.get(key);
                let missing = entry.map(|e| !e.has_value()).unwrap_or(true);
                let recalculable = missing || entry.map(|e| !e.is_user()).unwrap_or(true);

                let item = WorkItem {
                    step_index,
                    intervention_index,
                    key,
                };
                if missing {
                    result.without_value.push(item);
                }
                if recalculable {
                    result.all_calculable.push(item);
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Intervention, Status, Step, ValueEntry};

    fn registry_of_seven() -> IndicatorRegistry {
        IndicatorRegistry::new([
            IndicatorKey::CoutsPhytos,
            IndicatorKey::Semences,
            IndicatorKey::Engrais,
            IndicatorKey::Mecanisation,
            IndicatorKey::Gnr,
            IndicatorKey::TempsTravail,
            IndicatorKey::Ift,
        ])
    }

    fn empty_system(steps: usize, interventions: usize) -> System {
        System {
            steps: (0..steps)
                .map(|s| Step {
                    name: format!("Step {}", s),
                    interventions: (0..interventions)
                        .map(|i| Intervention {
                            name: format!("Intervention {}", i),
                            ..Intervention::default()
                        })
                        .collect(),
                    ..Step::default()
                })
                .collect(),
            ..System::default()
        }
    }

    #[test]
    fn test_all_absent_counts() {
        let system = empty_system(3, 2);
        let result = scan(&system, &registry_of_seven());
        assert_eq!(result.counts().without_value, 42);
        assert_eq!(result.counts().all_calculable, 42);
    }

    #[test]
    fn test_status_rules() {
        let mut system = empty_system(1, 1);
        let values = &mut system.steps[0].interventions[0].values;
        values.insert(ValueEntry::user(IndicatorKey::CoutsPhytos, 10.0));
        values.insert(ValueEntry {
            value: Some(crate::models::IndicatorValue::Number(3.0)),
            ..ValueEntry::empty(IndicatorKey::Semences, Status::Ia)
        });
        values.insert(ValueEntry::empty(IndicatorKey::Engrais, Status::User));

        let result = scan(&system, &registry_of_seven());
        let counts = result.counts();
        // user with value: skipped by both; ia: only full; user without value: both
        assert_eq!(counts.without_value, 5);
        assert_eq!(counts.all_calculable, 6);
        assert!(counts.without_value <= counts.all_calculable);
        assert!(!result
            .all_calculable
            .iter()
            .any(|i| i.key == IndicatorKey::CoutsPhytos));
    }

    #[test]
    fn test_order_is_step_intervention_registry() {
        let system = empty_system(2, 2);
        let registry = IndicatorRegistry::new([IndicatorKey::Ift, IndicatorKey::Gnr]);
        let items = scan(&system, &registry).select(false);

        let coords: Vec<_> = items
            .iter()
            .map(|i| (i.step_index, i.intervention_index, i.key))
            .collect();
        assert_eq!(
            coords,
            vec![
                (0, 0, IndicatorKey::Ift),
                (0, 0, IndicatorKey::Gnr),
                (0, 1, IndicatorKey::Ift),
                (0, 1, IndicatorKey::Gnr),
                (1, 0, IndicatorKey::Ift),
                (1, 0, IndicatorKey::Gnr),
                (1, 1, IndicatorKey::Ift),
                (1, 1, IndicatorKey::Gnr),
            ]
        );
    }

    #[test]
    fn test_select() {
        let mut system = empty_system(1, 1);
        system.steps[0].interventions[0].values.insert(ValueEntry {
            value: Some(crate::models::IndicatorValue::Number(1.0)),
            ..ValueEntry::empty(IndicatorKey::Gnr, Status::Ia)
        });
        let registry = IndicatorRegistry::new([IndicatorKey::Gnr]);

        assert!(scan(&system, &registry).select(false).is_empty());
        assert_eq!(scan(&system, &registry).select(true).len(), 1);
    }
}
