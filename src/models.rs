//! Data models for cropping systems and their indicators.
//!
//! This module contains the typed document hierarchy
//! (System → Step → Intervention → ValueEntry), the conversation audit
//! trail attached to each value, and the process log records used by
//! batch runs.

use crate::indicators::IndicatorKey;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Provenance of an indicator value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Entered or forced by a person; never overwritten by automation.
    #[default]
    #[serde(rename = "user")]
    User,
    /// Produced by the aggregation engine.
    #[serde(rename = "calculated")]
    Calculated,
    /// Estimated by the AI gateway.
    #[serde(rename = "ia")]
    Ia,
    /// Judged not applicable to the intervention.
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::User => write!(f, "user"),
            Status::Calculated => write!(f, "calculated"),
            Status::Ia => write!(f, "ia"),
            Status::NotApplicable => write!(f, "n/a"),
        }
    }
}

/// Confidence attached to an AI estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    /// Lenient parse used on model output.
    pub fn parse_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" | "haute" | "élevée" => Some(Confidence::High),
            "medium" | "moyenne" => Some(Confidence::Medium),
            "low" | "faible" | "basse" => Some(Confidence::Low),
            _ => None,
        }
    }

    /// Returns an emoji representation of the confidence.
    pub fn emoji(&self) -> &'static str {
        match self {
            Confidence::Low => "🔴",
            Confidence::Medium => "🟡",
            Confidence::High => "🟢",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// A stored indicator value: numeric or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndicatorValue {
    Number(f64),
    Text(String),
}

impl IndicatorValue {
    /// Numeric view of the value. Anything that is not a finite number
    /// coerces to 0.
    pub fn as_number(&self) -> f64 {
        let n = match self {
            IndicatorValue::Number(n) => *n,
            IndicatorValue::Text(s) => s.trim().replace(',', ".").parse::<f64>().unwrap_or(0.0),
        };
        if n.is_finite() {
            n
        } else {
            0.0
        }
    }
}

impl fmt::Display for IndicatorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorValue::Number(n) => write!(f, "{}", format_number(*n)),
            IndicatorValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Format a number with at most two decimals and no trailing zeros.
pub fn format_number(n: f64) -> String {
    let s = format!("{:.2}", n);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the audit trail kept next to a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calculation_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caveats: Vec<String>,
}

impl ConversationMessage {
    /// A plain message without calculation metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            assumptions: Vec::new(),
            calculation_steps: Vec::new(),
            sources: Vec::new(),
            confidence: None,
            caveats: Vec::new(),
        }
    }
}

/// An indicator value with its provenance and audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEntry {
    pub key: IndicatorKey,
    #[serde(default)]
    pub value: Option<IndicatorValue>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation: Vec<ConversationMessage>,
}

impl ValueEntry {
    /// An entry with no value yet. Created lazily on first computation.
    pub fn empty(key: IndicatorKey, status: Status) -> Self {
        Self {
            key,
            value: None,
            status,
            confidence: None,
            conversation: Vec::new(),
        }
    }

    /// A user-entered numeric value.
    pub fn user(key: IndicatorKey, value: f64) -> Self {
        Self {
            value: Some(IndicatorValue::Number(value)),
            ..Self::empty(key, Status::User)
        }
    }

    pub fn is_user(&self) -> bool {
        self.status == Status::User
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Numeric view; absent values coerce to 0.
    pub fn number(&self) -> f64 {
        self.value.as_ref().map(IndicatorValue::as_number).unwrap_or(0.0)
    }

    /// Append messages to the audit trail.
    pub fn append_conversation(&mut self, messages: impl IntoIterator<Item = ConversationMessage>) {
        self.conversation.extend(messages);
    }
}

/// Indicator entries of one entity, keyed by indicator.
///
/// Stored documents keep entries as a list; loading a list with a repeated
/// key keeps the last entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ValueEntry>", into = "Vec<ValueEntry>")]
pub struct ValueSet {
    entries: BTreeMap<IndicatorKey, ValueEntry>,
}

impl From<Vec<ValueEntry>> for ValueSet {
    fn from(list: Vec<ValueEntry>) -> Self {
        let mut set = ValueSet::default();
        for entry in list {
            set.insert(entry);
        }
        set
    }
}

impl From<ValueSet> for Vec<ValueEntry> {
    fn from(set: ValueSet) -> Self {
        set.entries.into_values().collect()
    }
}

impl ValueSet {
    pub fn get(&self, key: IndicatorKey) -> Option<&ValueEntry> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: IndicatorKey) -> Option<&mut ValueEntry> {
        self.entries.get_mut(&key)
    }

    pub fn contains(&self, key: IndicatorKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Insert or replace the entry for its key.
    pub fn insert(&mut self, entry: ValueEntry) {
        self.entries.insert(entry.key, entry);
    }

    pub fn remove(&mut self, key: IndicatorKey) -> Option<ValueEntry> {
        self.entries.remove(&key)
    }

    /// Find-or-create the entry for `key`, new entries start as `calculated`.
    pub fn entry_mut(&mut self, key: IndicatorKey) -> &mut ValueEntry {
        self.entries
            .entry(key)
            .or_insert_with(|| ValueEntry::empty(key, Status::Calculated))
    }

    /// Numeric view of `key`; absent entries coerce to 0.
    pub fn number(&self, key: IndicatorKey) -> f64 {
        self.get(key).map(ValueEntry::number).unwrap_or(0.0)
    }

    pub fn is_user(&self, key: IndicatorKey) -> bool {
        self.get(key).map(ValueEntry::is_user).unwrap_or(false)
    }

    /// Write an engine-derived value. User entries are left untouched;
    /// the conversation of an automated entry is kept.
    ///
    /// Returns `true` when the value was written.
    pub fn set_calculated(&mut self, key: IndicatorKey, value: f64) -> bool {
        if self.is_user(key) {
            return false;
        }
        let entry = self.entry_mut(key);
        entry.value = Some(IndicatorValue::Number(value));
        entry.status = Status::Calculated;
        entry.confidence = None;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValueEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = IndicatorKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A field operation within a rotation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Free-text hint passed to the AI gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<String>,
    #[serde(default)]
    pub values: ValueSet,
}

impl Intervention {
    /// Rollup weight. Defaults to 1 when no frequency was entered.
    pub fn frequence(&self) -> f64 {
        match self.values.get(IndicatorKey::Frequence) {
            Some(entry) if entry.has_value() => entry.number(),
            _ => 1.0,
        }
    }
}

/// One crop-cycle phase of a rotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<String>,
    #[serde(default)]
    pub interventions: Vec<Intervention>,
    #[serde(default)]
    pub values: ValueSet,
}

impl Step {
    /// Parsed start date, `None` when missing or malformed.
    pub fn start(&self) -> Option<NaiveDate> {
        parse_date(self.start_date.as_deref())
    }

    /// Parsed end date, `None` when missing or malformed.
    pub fn end(&self) -> Option<NaiveDate> {
        parse_date(self.end_date.as_deref())
    }
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Per-hectare-per-year metrics derived from the system totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemIndicators {
    /// Rotation duration used as the divisor, at least 1.
    pub rotation_years: f64,
    /// Surface used as the divisor (hectares).
    pub surface: f64,
    #[serde(default)]
    pub per_hectare_year: BTreeMap<IndicatorKey, f64>,
}

/// A multi-year cropping system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id: String,
    pub name: String,
    /// Surface in hectares.
    #[serde(default = "default_surface")]
    pub surface: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumptions: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub system_values: BTreeMap<IndicatorKey, f64>,
    #[serde(default)]
    pub system_indicators: SystemIndicators,
}

fn default_surface() -> f64 {
    1.0
}

impl System {
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn intervention(&self, step: usize, intervention: usize) -> Option<&Intervention> {
        self.steps.get(step)?.interventions.get(intervention)
    }

    pub fn intervention_mut(
        &mut self,
        step: usize,
        intervention: usize,
    ) -> Option<&mut Intervention> {
        self.steps.get_mut(step)?.interventions.get_mut(intervention)
    }

    /// Total number of interventions across all steps.
    pub fn intervention_count(&self) -> usize {
        self.steps.iter().map(|s| s.interventions.len()).sum()
    }
}

/// Kind of run a process log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessScope {
    /// Whole-system AI batch.
    Batch,
    /// Single indicator calculation.
    Single,
}

/// Lifecycle of a process log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Started,
    Completed,
    Aborted,
    Error,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Started)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Started => write!(f, "started"),
            ProcessStatus::Completed => write!(f, "completed"),
            ProcessStatus::Aborted => write!(f, "aborted"),
            ProcessStatus::Error => write!(f, "error"),
        }
    }
}

/// Persisted metadata of a calculation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogRecord {
    pub id: String,
    pub scope: ProcessScope,
    pub system_id: String,
    /// Target indicator; `None` means every calculable indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<IndicatorKey>,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
    pub total_indicators: usize,
    pub processed_indicators: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessLogRecord {
    /// A fresh `started` record with a generated id.
    pub fn start(
        scope: ProcessScope,
        system_id: impl Into<String>,
        user_id: impl Into<String>,
        total_indicators: usize,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            system_id: system_id.into(),
            indicator: None,
            user_id: user_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: ProcessStatus::Started,
            total_indicators,
            processed_indicators: 0,
            error: None,
        }
    }

    /// Apply a patch. Status only moves out of `started`; terminal records
    /// keep their status.
    pub fn apply(&mut self, patch: &ProcessLogPatch) {
        if let Some(status) = patch.status {
            if !self.status.is_terminal() {
                self.status = status;
            }
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(total) = patch.total_indicators {
            self.total_indicators = total;
        }
        if let Some(processed) = patch.processed_indicators {
            self.processed_indicators = processed;
        }
        if let Some(ended_at) = patch.ended_at {
            self.ended_at = Some(ended_at);
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
    }

    /// Wall-clock duration of a finished run.
    pub fn duration_seconds(&self) -> Option<f64> {
        let ended = self.ended_at?;
        let millis = (ended - self.started_at).num_milliseconds();
        Some((millis.max(0) as f64) / 1000.0)
    }
}

/// Partial update of a process log record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessLogPatch {
    pub status: Option<ProcessStatus>,
    /// Restamps the start when a prepared record begins dispatching.
    pub started_at: Option<DateTime<Utc>>,
    pub total_indicators: Option<usize>,
    pub processed_indicators: Option<usize>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ProcessLogPatch {
    pub fn processed(count: usize) -> Self {
        Self {
            processed_indicators: Some(count),
            ..Self::default()
        }
    }

    /// Move to a terminal status, stamping the end time.
    pub fn finish(status: ProcessStatus, processed: usize) -> Self {
        Self {
            status: Some(status),
            processed_indicators: Some(processed),
            ended_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}
