//! Indicator keys and the registry sets used by the rollup and the scanner.
//!
//! Keys keep the camelCase names used in stored system documents, so an
//! unknown key fails deserialization instead of silently creating a new
//! indicator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a tracked indicator.
///
/// Variant order is the display order of indicator tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndicatorKey {
    /// Number of passes per rotation cycle (rollup weight).
    #[serde(rename = "frequence")]
    Frequence,
    /// Crop protection products cost.
    #[serde(rename = "coutsPhytos")]
    CoutsPhytos,
    /// Seed cost.
    #[serde(rename = "semences")]
    Semences,
    /// Fertilizer cost.
    #[serde(rename = "engrais")]
    Engrais,
    /// Machinery cost.
    #[serde(rename = "mecanisation")]
    Mecanisation,
    /// Off-road diesel cost.
    #[serde(rename = "gnr")]
    Gnr,
    /// Irrigation cost.
    #[serde(rename = "irrigation")]
    Irrigation,
    /// Sum of the cost indicators.
    #[serde(rename = "totalCharges")]
    TotalCharges,
    /// Working time (hours).
    #[serde(rename = "tempsTravail")]
    TempsTravail,
    /// Treatment frequency index.
    #[serde(rename = "ift")]
    Ift,
    /// Greenhouse gas emissions (kg CO2e).
    #[serde(rename = "emissionsGES")]
    EmissionsGes,
    /// Mineral nitrogen applied (kg N).
    #[serde(rename = "azoteMineral")]
    AzoteMineral,
    /// Dry matter yield (t).
    #[serde(rename = "rendementTMS")]
    RendementTms,
    /// Sale price per tonne.
    #[serde(rename = "prixVente")]
    PrixVente,
    /// Gross product (yield x price).
    #[serde(rename = "totalProduits")]
    TotalProduits,
    /// Gross margin (product minus charges).
    #[serde(rename = "margeBrute")]
    MargeBrute,
}

impl IndicatorKey {
    /// Every key, in display order.
    pub const ALL: [IndicatorKey; 16] = [
        IndicatorKey::Frequence,
        IndicatorKey::CoutsPhytos,
        IndicatorKey::Semences,
        IndicatorKey::Engrais,
        IndicatorKey::Mecanisation,
        IndicatorKey::Gnr,
        IndicatorKey::Irrigation,
        IndicatorKey::TotalCharges,
        IndicatorKey::TempsTravail,
        IndicatorKey::Ift,
        IndicatorKey::EmissionsGes,
        IndicatorKey::AzoteMineral,
        IndicatorKey::RendementTms,
        IndicatorKey::PrixVente,
        IndicatorKey::TotalProduits,
        IndicatorKey::MargeBrute,
    ];

    /// Keys summed into `totalCharges`.
    pub const COSTS: [IndicatorKey; 6] = [
        IndicatorKey::CoutsPhytos,
        IndicatorKey::Semences,
        IndicatorKey::Engrais,
        IndicatorKey::Mecanisation,
        IndicatorKey::Gnr,
        IndicatorKey::Irrigation,
    ];

    /// Stored name of the key.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKey::Frequence => "frequence",
            IndicatorKey::CoutsPhytos => "coutsPhytos",
            IndicatorKey::Semences => "semences",
            IndicatorKey::Engrais => "engrais",
            IndicatorKey::Mecanisation => "mecanisation",
            IndicatorKey::Gnr => "gnr",
            IndicatorKey::Irrigation => "irrigation",
            IndicatorKey::TotalCharges => "totalCharges",
            IndicatorKey::TempsTravail => "tempsTravail",
            IndicatorKey::Ift => "ift",
            IndicatorKey::EmissionsGes => "emissionsGES",
            IndicatorKey::AzoteMineral => "azoteMineral",
            IndicatorKey::RendementTms => "rendementTMS",
            IndicatorKey::PrixVente => "prixVente",
            IndicatorKey::TotalProduits => "totalProduits",
            IndicatorKey::MargeBrute => "margeBrute",
        }
    }

    /// Human-readable label with unit, used in prompts and reports.
    pub fn label(&self) -> &'static str {
        match self {
            IndicatorKey::Frequence => "Frequency (passes)",
            IndicatorKey::CoutsPhytos => "Crop protection cost (EUR)",
            IndicatorKey::Semences => "Seed cost (EUR)",
            IndicatorKey::Engrais => "Fertilizer cost (EUR)",
            IndicatorKey::Mecanisation => "Machinery cost (EUR)",
            IndicatorKey::Gnr => "Fuel cost (EUR)",
            IndicatorKey::Irrigation => "Irrigation cost (EUR)",
            IndicatorKey::TotalCharges => "Total charges (EUR)",
            IndicatorKey::TempsTravail => "Working time (h)",
            IndicatorKey::Ift => "Treatment frequency index",
            IndicatorKey::EmissionsGes => "GHG emissions (kg CO2e)",
            IndicatorKey::AzoteMineral => "Mineral nitrogen (kg N)",
            IndicatorKey::RendementTms => "Yield (t DM)",
            IndicatorKey::PrixVente => "Sale price (EUR/t)",
            IndicatorKey::TotalProduits => "Gross product (EUR)",
            IndicatorKey::MargeBrute => "Gross margin (EUR)",
        }
    }

    /// Step-only keys are entered or derived at step level and never
    /// rolled up from interventions.
    pub fn is_step_only(&self) -> bool {
        matches!(
            self,
            IndicatorKey::RendementTms
                | IndicatorKey::PrixVente
                | IndicatorKey::TotalProduits
                | IndicatorKey::MargeBrute
        )
    }

    /// Keys rolled up from interventions into their step.
    pub fn is_summable(&self) -> bool {
        !self.is_step_only()
    }

    /// Whether the key contributes to `totalCharges`.
    pub fn is_cost(&self) -> bool {
        Self::COSTS.contains(self)
    }
}

impl fmt::Display for IndicatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndicatorKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IndicatorKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s || k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown indicator key: {}", s))
    }
}

/// Ordered set of indicator keys the AI gateway may calculate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorRegistry {
    keys: Vec<IndicatorKey>,
}

impl IndicatorRegistry {
    /// Build a registry, dropping duplicates while keeping first-seen order.
    pub fn new(keys: impl IntoIterator<Item = IndicatorKey>) -> Self {
        let mut unique = Vec::new();
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        Self { keys: unique }
    }

    /// Parse a registry from stored key names.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let keys = names
            .iter()
            .map(|n| n.as_ref().parse::<IndicatorKey>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(keys))
    }

    pub fn keys(&self) -> &[IndicatorKey] {
        &self.keys
    }

    pub fn contains(&self, key: IndicatorKey) -> bool {
        self.keys.contains(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self::new([
            IndicatorKey::CoutsPhytos,
            IndicatorKey::Semences,
            IndicatorKey::Engrais,
            IndicatorKey::Mecanisation,
            IndicatorKey::Gnr,
            IndicatorKey::Irrigation,
            IndicatorKey::TempsTravail,
            IndicatorKey::Ift,
            IndicatorKey::EmissionsGes,
            IndicatorKey::AzoteMineral,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_round_trip_through_serde() {
        for key in IndicatorKey::ALL {
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(json, format!("\"{}\"", key.as_str()));
        }
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(serde_json::from_str::<IndicatorKey>("\"rendement\"").is_err());
        assert!("rendement".parse::<IndicatorKey>().is_err());
        assert_eq!(
            "EMISSIONSGES".parse::<IndicatorKey>(),
            Ok(IndicatorKey::EmissionsGes)
        );
    }

    #[test]
    fn test_step_only_set() {
        let step_only: Vec<_> = IndicatorKey::ALL
            .iter()
            .filter(|k| k.is_step_only())
            .collect();
        assert_eq!(step_only.len(), 4);
        assert!(IndicatorKey::Frequence.is_summable());
        assert!(IndicatorKey::TotalCharges.is_summable());
        assert!(!IndicatorKey::MargeBrute.is_summable());
    }

    #[test]
    fn test_registry_dedupes_in_order() {
        let registry = IndicatorRegistry::new([
            IndicatorKey::Ift,
            IndicatorKey::Engrais,
            IndicatorKey::Ift,
        ]);
        assert_eq!(registry.keys(), &[IndicatorKey::Ift, IndicatorKey::Engrais]);
    }

    #[test]
    fn test_registry_from_names() {
        let registry = IndicatorRegistry::from_names(&["gnr", "ift"]).unwrap();
        assert_eq!(registry.keys(), &[IndicatorKey::Gnr, IndicatorKey::Ift]);
        assert!(IndicatorRegistry::from_names(&["bogus"]).is_err());
    }
}
