//! Indicator rollup: intervention → step → system.
//!
//! `recompute` is a pure transform producing an internally consistent copy
//! of a system. It never fails: non-numeric values count as 0, and entries
//! with `status = user` are never overwritten.

use crate::indicators::IndicatorKey;
use crate::models::{Intervention, Status, Step, System, SystemIndicators, ValueSet};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};

const DAYS_PER_YEAR: f64 = 365.25;

/// Recompute every derived indicator of a system.
pub fn recompute(system: &System) -> System {
    let mut out = system.clone();

    for step in &mut out.steps {
        for intervention in &mut step.interventions {
            rollup_intervention(&mut intervention.values);
        }
        rollup_step(step);
    }

    out.system_values = sum_steps(&out.steps);
    out.system_indicators = derive_indicators(out.surface, &out.steps, &out.system_values);
    out
}

/// Intervention level: charges from the cost set, product from price × yield.
fn rollup_intervention(values: &mut ValueSet) {
    let charges: f64 = IndicatorKey::COSTS.iter().map(|k| values.number(*k)).sum();
    values.set_calculated(IndicatorKey::TotalCharges, charges);

    if values.contains(IndicatorKey::RendementTms) || values.contains(IndicatorKey::PrixVente) {
        let product =
            values.number(IndicatorKey::RendementTms) * values.number(IndicatorKey::PrixVente);
        values.set_calculated(IndicatorKey::TotalProduits, product);
    }
}

/// Step level: frequency-weighted sums, then the step-only economics.
fn rollup_step(step: &mut Step) {
    let weights: Vec<f64> = step.interventions.iter().map(Intervention::frequence).collect();

    for key in IndicatorKey::ALL.iter().copied().filter(IndicatorKey::is_summable) {
        let present = key == IndicatorKey::TotalCharges
            || step.interventions.iter().any(|i| i.values.contains(key));

        if !present {
            // Drop stale rollups whose sources disappeared.
            if step
                .values
                .get(key)
                .map(|e| e.status == Status::Calculated)
                .unwrap_or(false)
            {
                step.values.remove(key);
            }
            continue;
        }

        let total = if key == IndicatorKey::Frequence {
            weights.iter().filter(|w| **w > 0.0).sum()
        } else {
            weighted_sum(&step.interventions, &weights, key)
        };
        step.values.set_calculated(key, total);
    }

    let product = if step.values.is_user(IndicatorKey::TotalProduits) {
        step.values.number(IndicatorKey::TotalProduits)
    } else {
        let product = step.values.number(IndicatorKey::RendementTms)
            * step.values.number(IndicatorKey::PrixVente);
        step.values.set_calculated(IndicatorKey::TotalProduits, product);
        product
    };

    let charges = step.values.number(IndicatorKey::TotalCharges);
    step.values
        .set_calculated(IndicatorKey::MargeBrute, product - charges);
}

/// Σ value(k) × frequence over interventions with frequence > 0.
fn weighted_sum(interventions: &[Intervention], weights: &[f64], key: IndicatorKey) -> f64 {
    interventions
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w > 0.0)
        .map(|(i, w)| i.values.number(key) * w)
        .sum()
}

/// System level: unweighted sum of every step value except unit prices.
fn sum_steps(steps: &[Step]) -> BTreeMap<IndicatorKey, f64> {
    let mut totals = BTreeMap::new();

    for step in steps {
        for entry in step.values.iter() {
            if entry.key == IndicatorKey::PrixVente {
                continue;
            }
            *totals.entry(entry.key).or_insert(0.0) += entry.number();
        }
    }

    totals
}

/// Per-hectare-per-year metrics.
fn derive_indicators(
    surface: f64,
    steps: &[Step],
    totals: &BTreeMap<IndicatorKey, f64>,
) -> SystemIndicators {
    let surface = if surface.is_finite() && surface > 0.0 {
        surface
    } else {
        1.0
    };
    let rotation_years = rotation_years(steps);
    let divisor = surface * rotation_years;

    SystemIndicators {
        rotation_years,
        surface,
        per_hectare_year: totals.iter().map(|(k, v)| (*k, v / divisor)).collect(),
    }
}

/// Years between the earliest valid step start and the latest valid step
/// end, floored at 1.
pub fn rotation_years(steps: &[Step]) -> f64 {
    let earliest: Option<NaiveDate> = steps.iter().filter_map(Step::start).min();
    let latest: Option<NaiveDate> = steps.iter().filter_map(Step::end).max();

    match (earliest, latest) {
        (Some(start), Some(end)) if end > start => {
            let days = (end - start).num_days() as f64;
            (days / DAYS_PER_YEAR).max(1.0)
        }
        _ => 1.0,
    }
}

/// Count entries by status across interventions and steps.
pub fn status_distribution(system: &System) -> HashMap<Status, usize> {
    let mut dist: HashMap<Status, usize> = HashMap::new();

    for step in &system.steps {
        let entries = step
            .values
            .iter()
            .chain(step.interventions.iter().flat_map(|i| i.values.iter()));
        for entry in entries {
            *dist.entry(entry.status).or_default() += 1;
        }
    }

    dist
}

/// The `n` steps with the highest value for `key`.
pub fn top_steps_by(system: &System, key: IndicatorKey, n: usize) -> Vec<(&Step, f64)> {
    let mut ranked: Vec<_> = system
        .steps
        .iter()
        .map(|s| (s, s.values.number(key)))
        .filter(|(_, v)| *v != 0.0)
        .collect();

    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(n);

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndicatorValue, ValueEntry};

    fn intervention(name: &str, values: &[(IndicatorKey, f64)]) -> Intervention {
        let mut i = Intervention {
            name: name.to_string(),
            ..Intervention::default()
        };
        for (k, v) in values {
            i.values.insert(ValueEntry::user(*k, *v));
        }
        i
    }

    fn step(name: &str, interventions: Vec<Intervention>) -> Step {
        Step {
            name: name.to_string(),
            interventions,
            ..Step::default()
        }
    }

    fn sample_system() -> System {
        let mut wheat = step(
            "Wheat",
            vec![
                intervention(
                    "Sowing",
                    &[(IndicatorKey::Semences, 120.0), (IndicatorKey::Gnr, 15.0)],
                ),
                intervention(
                    "Fertilization",
                    &[(IndicatorKey::Frequence, 3.0), (IndicatorKey::Engrais, 40.0)],
                ),
            ],
        );
        wheat.start_date = Some("2022-10-01".to_string());
        wheat.end_date = Some("2023-07-31".to_string());
        wheat.values.insert(ValueEntry::user(IndicatorKey::RendementTms, 7.5));
        wheat.values.insert(ValueEntry::user(IndicatorKey::PrixVente, 200.0));

        let mut rapeseed = step(
            "Rapeseed",
            vec![intervention("Spraying", &[(IndicatorKey::CoutsPhytos, 60.0)])],
        );
        rapeseed.start_date = Some("2023-08-20".to_string());
        rapeseed.end_date = Some("2024-07-10".to_string());

        System {
            id: "sys-1".to_string(),
            name: "Cereal rotation".to_string(),
            surface: 10.0,
            steps: vec![wheat, rapeseed],
            ..System::default()
        }
    }

    #[test]
    fn test_frequency_weighted_step_sum() {
        let system = System {
            steps: vec![step(
                "Step",
                vec![
                    intervention(
                        "A",
                        &[(IndicatorKey::Frequence, 2.0), (IndicatorKey::Engrais, 10.0)],
                    ),
                    intervention(
                        "B",
                        &[(IndicatorKey::Frequence, 0.0), (IndicatorKey::Engrais, 1000.0)],
                    ),
                ],
            )],
            ..System::default()
        };

        let out = recompute(&system);
        let values = &out.steps[0].values;
        assert_eq!(values.number(IndicatorKey::Engrais), 20.0);
        assert_eq!(values.number(IndicatorKey::TotalCharges), 20.0);
        assert_eq!(values.number(IndicatorKey::Frequence), 2.0);
    }

    #[test]
    fn test_margin_from_yield_and_price() {
        let mut s = step(
            "Maize",
            vec![
                intervention("Sowing", &[(IndicatorKey::Semences, 100.0)]),
                intervention("Harvest", &[(IndicatorKey::Mecanisation, 50.0)]),
            ],
        );
        s.values.insert(ValueEntry::user(IndicatorKey::RendementTms, 5.0));
        s.values.insert(ValueEntry::user(IndicatorKey::PrixVente, 100.0));
        let system = System {
            steps: vec![s],
            ..System::default()
        };

        let out = recompute(&system);
        let values = &out.steps[0].values;
        assert_eq!(values.number(IndicatorKey::TotalCharges), 150.0);
        assert_eq!(values.number(IndicatorKey::TotalProduits), 500.0);
        assert_eq!(values.number(IndicatorKey::MargeBrute), 350.0);
    }

    #[test]
    fn test_forced_product_and_charges_are_kept() {
        let mut s = step("Fallow", vec![]);
        s.values.insert(ValueEntry::user(IndicatorKey::RendementTms, 5.0));
        s.values.insert(ValueEntry::user(IndicatorKey::PrixVente, 100.0));
        s.values.insert(ValueEntry::user(IndicatorKey::TotalProduits, 800.0));
        s.values.insert(ValueEntry::user(IndicatorKey::TotalCharges, 150.0));
        let system = System {
            steps: vec![s],
            ..System::default()
        };

        let out = recompute(&system);
        let values = &out.steps[0].values;
        assert_eq!(values.number(IndicatorKey::TotalProduits), 800.0);
        assert_eq!(values.number(IndicatorKey::MargeBrute), 650.0);
    }

    #[test]
    fn test_user_margin_is_not_rederived() {
        let mut s = step(
            "Wheat",
            vec![intervention("Sowing", &[(IndicatorKey::Semences, 100.0)])],
        );
        s.values.insert(ValueEntry::user(IndicatorKey::RendementTms, 5.0));
        s.values.insert(ValueEntry::user(IndicatorKey::PrixVente, 100.0));
        s.values.insert(ValueEntry::user(IndicatorKey::MargeBrute, 42.0));
        let system = System {
            steps: vec![s],
            ..System::default()
        };

        let out = recompute(&system);
        let values = &out.steps[0].values;
        // product 500 and charges 100 would give 400
        assert_eq!(values.number(IndicatorKey::TotalProduits), 500.0);
        assert_eq!(values.number(IndicatorKey::TotalCharges), 100.0);
        assert_eq!(values.number(IndicatorKey::MargeBrute), 42.0);
        assert!(values.is_user(IndicatorKey::MargeBrute));
        assert_eq!(out.system_values[&IndicatorKey::MargeBrute], 42.0);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let once = recompute(&sample_system());
        let twice = recompute(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_user_overrides_survive() {
        let mut system = sample_system();
        system.steps[0].interventions[0]
            .values
            .insert(ValueEntry::user(IndicatorKey::TotalCharges, 999.0));
        system.steps[1]
            .values
            .insert(ValueEntry::user(IndicatorKey::CoutsPhytos, 12.0));

        let out = recompute(&system);
        let forced = out.steps[0].interventions[0]
            .values
            .get(IndicatorKey::TotalCharges)
            .unwrap();
        assert_eq!(forced.status, Status::User);
        assert_eq!(forced.number(), 999.0);

        let forced_step = out.steps[1].values.get(IndicatorKey::CoutsPhytos).unwrap();
        assert_eq!(forced_step.status, Status::User);
        assert_eq!(forced_step.number(), 12.0);
    }

    #[test]
    fn test_weighted_sum_law_and_margin_law() {
        let out = recompute(&sample_system());
        let wheat = &out.steps[0];

        for key in IndicatorKey::ALL
            .iter()
            .copied()
            .filter(|k| k.is_summable() && *k != IndicatorKey::Frequence)
        {
            let expected: f64 = wheat
                .interventions
                .iter()
                .filter(|i| i.frequence() > 0.0)
                .map(|i| i.values.number(key) * i.frequence())
                .sum();
            assert_eq!(wheat.values.number(key), expected, "key {}", key);
        }

        for s in &out.steps {
            assert_eq!(
                s.values.number(IndicatorKey::MargeBrute),
                s.values.number(IndicatorKey::TotalProduits)
                    - s.values.number(IndicatorKey::TotalCharges)
            );
        }
    }

    #[test]
    fn test_system_totals_and_per_hectare_year() {
        let out = recompute(&sample_system());

        // wheat: 120 + 15 + 3 * 40 = 255, rapeseed: 60
        assert_eq!(out.system_values[&IndicatorKey::TotalCharges], 315.0);
        assert!(!out.system_values.contains_key(&IndicatorKey::PrixVente));
        assert_eq!(out.system_values[&IndicatorKey::TotalProduits], 1500.0);

        let years = out.system_indicators.rotation_years;
        assert!(years > 1.7 && years < 1.8);
        let per_ha_year = out.system_indicators.per_hectare_year[&IndicatorKey::TotalCharges];
        assert!((per_ha_year - 315.0 / (10.0 * years)).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_years_floor() {
        assert_eq!(rotation_years(&[]), 1.0);

        let mut short = Step::default();
        short.start_date = Some("2024-03-01".to_string());
        short.end_date = Some("2024-07-01".to_string());
        assert_eq!(rotation_years(&[short.clone()]), 1.0);

        short.end_date = Some("garbage".to_string());
        assert_eq!(rotation_years(&[short]), 1.0);
    }

    #[test]
    fn test_malformed_values_coerce_to_zero() {
        let mut i = Intervention::default();
        i.values.insert(ValueEntry {
            value: Some(IndicatorValue::Text("lots".to_string())),
            ..ValueEntry::empty(IndicatorKey::Engrais, Status::Ia)
        });
        i.values
            .insert(ValueEntry::user(IndicatorKey::Semences, f64::INFINITY));
        let system = System {
            surface: -3.0,
            steps: vec![step("S", vec![i])],
            ..System::default()
        };

        let out = recompute(&system);
        assert_eq!(out.steps[0].values.number(IndicatorKey::TotalCharges), 0.0);
        assert_eq!(out.system_indicators.surface, 1.0);
    }

    #[test]
    fn test_stale_rollups_are_dropped() {
        let mut system = sample_system();
        let out = recompute(&system);
        assert!(out.steps[1].values.contains(IndicatorKey::CoutsPhytos));

        system = out;
        system.steps[1].interventions[0] = intervention("Rolling", &[]);
        let out = recompute(&system);
        assert!(!out.steps[1].values.contains(IndicatorKey::CoutsPhytos));
    }

    #[test]
    fn test_status_distribution() {
        let out = recompute(&sample_system());
        let dist = status_distribution(&out);
        assert!(dist.get(&Status::User).copied().unwrap_or(0) >= 7);
        assert!(dist.get(&Status::Calculated).copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_top_steps_by() {
        let out = recompute(&sample_system());
        let top = top_steps_by(&out, IndicatorKey::TotalCharges, 1);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0.name, "Wheat");
    }
}
