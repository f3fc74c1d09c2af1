use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::{ExperimentError, Result};

pub const MIN_VARIANTS: usize = 2;
pub const MAX_VARIANTS: usize = 4;
pub const DEFAULT_DURATION_VALUE: u32 = 7;
pub const DEFAULT_MINIMUM_SAMPLE_SIZE: u64 = 100;

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub test_type: TestType,
    pub status: ExperimentStatus,
    pub variants: Vec<Variant>,
    pub settings: ExperimentSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    pub total_audience: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub winner: Option<Winner>,
    #[serde(default)]
    pub winner_applied: bool,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Start of the current running segment; `None` while not running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<i64>,
    /// Running time accumulated before the current segment.
    #[serde(default)]
    pub active_ms: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Running => "running",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "draft" => Ok(ExperimentStatus::Draft),
            "running" => Ok(ExperimentStatus::Running),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            _ => Err(ExperimentError::Validation(format!(
                "invalid status: {value}"
            ))),
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Subject,
    Time,
    Content,
    Comprehensive,
}

/// Content an operator authors for one variant. Which fields are required
/// depends on the experiment's [`TestType`].
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantContent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    #[serde(flatten)]
    pub content: VariantContent,
    #[serde(flatten)]
    pub counters: FunnelCounters,
}

impl Variant {
    pub fn new(content: VariantContent) -> Self {
        Self {
            content,
            counters: FunnelCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.content.name
    }
}

/// Per-variant funnel counters. Only ever added to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FunnelCounters {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub unsubscribed: u64,
    pub complained: u64,
    pub converted: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Unsubscribed,
    Complained,
    Converted,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Sent,
        EventKind::Delivered,
        EventKind::Opened,
        EventKind::Clicked,
        EventKind::Bounced,
        EventKind::Unsubscribed,
        EventKind::Complained,
        EventKind::Converted,
    ];
}

impl FunnelCounters {
    pub fn get(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::Sent => self.sent,
            EventKind::Delivered => self.delivered,
            EventKind::Opened => self.opened,
            EventKind::Clicked => self.clicked,
            EventKind::Bounced => self.bounced,
            EventKind::Unsubscribed => self.unsubscribed,
            EventKind::Complained => self.complained,
            EventKind::Converted => self.converted,
        }
    }

    pub fn add(&mut self, kind: EventKind, count: u64) {
        let slot = match kind {
            EventKind::Sent => &mut self.sent,
            EventKind::Delivered => &mut self.delivered,
            EventKind::Opened => &mut self.opened,
            EventKind::Clicked => &mut self.clicked,
            EventKind::Bounced => &mut self.bounced,
            EventKind::Unsubscribed => &mut self.unsubscribed,
            EventKind::Complained => &mut self.complained,
            EventKind::Converted => &mut self.converted,
        };
        *slot = slot.saturating_add(count);
    }
}

/// Rate a variant is judged on. Every metric is a share of `delivered`, so the
/// contingency table for any metric is well formed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    #[default]
    OpenRate,
    ClickRate,
    ConversionRate,
}

impl Metric {
    pub fn engaged_kind(&self) -> EventKind {
        match self {
            Metric::OpenRate => EventKind::Opened,
            Metric::ClickRate => EventKind::Clicked,
            Metric::ConversionRate => EventKind::Converted,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "openRate" => Ok(Metric::OpenRate),
            "clickRate" => Ok(Metric::ClickRate),
            "conversionRate" => Ok(Metric::ConversionRate),
            _ => Err(ExperimentError::Validation(format!(
                "invalid metric: {value}"
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConfidenceLevel {
    Ninety,
    #[default]
    NinetyFive,
    NinetyNine,
}

impl ConfidenceLevel {
    pub fn percent(&self) -> f64 {
        u8::from(*self) as f64
    }
}

impl TryFrom<u8> for ConfidenceLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            90 => Ok(ConfidenceLevel::Ninety),
            95 => Ok(ConfidenceLevel::NinetyFive),
            99 => Ok(ConfidenceLevel::NinetyNine),
            other => Err(format!("confidenceLevel must be 90, 95 or 99, got {other}")),
        }
    }
}

impl From<ConfidenceLevel> for u8 {
    fn from(level: ConfidenceLevel) -> Self {
        match level {
            ConfidenceLevel::Ninety => 90,
            ConfidenceLevel::NinetyFive => 95,
            ConfidenceLevel::NinetyNine => 99,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Hours,
    #[default]
    Days,
    Weeks,
}

impl DurationUnit {
    pub fn millis(&self, value: u32) -> i64 {
        let hours = match self {
            DurationUnit::Hours => 1,
            DurationUnit::Days => 24,
            DurationUnit::Weeks => 24 * 7,
        };
        value as i64 * hours * HOUR_MS
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentSettings {
    pub confidence_level: ConfidenceLevel,
    pub duration_value: u32,
    pub duration_unit: DurationUnit,
    /// Per-variant `delivered` floor before the auto-policy may pick a winner.
    pub minimum_sample_size: u64,
    pub auto_optimize: bool,
    pub metric: Metric,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            confidence_level: ConfidenceLevel::default(),
            duration_value: DEFAULT_DURATION_VALUE,
            duration_unit: DurationUnit::default(),
            minimum_sample_size: DEFAULT_MINIMUM_SAMPLE_SIZE,
            auto_optimize: false,
            metric: Metric::default(),
        }
    }
}

impl ExperimentSettings {
    pub fn duration_ms(&self) -> i64 {
        self.duration_unit.millis(self.duration_value)
    }
}

/// Member id → variant index, frozen when the resolved audience is handed
/// over at start. Stored next to the experiment, never inside it.
pub type MemberMap = BTreeMap<String, usize>;

/// Frozen split computed at start. `frozen_members` is the size of the
/// stored [`MemberMap`], or 0 when members are placed by hash slot.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub buckets: Vec<u64>,
    #[serde(default)]
    pub frozen_members: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredBy {
    Operator,
    Auto,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Winner {
    pub variant_index: usize,
    pub variant_name: String,
    pub metric: Metric,
    pub confidence: f64,
    pub improvement_percent: f64,
    pub p_value: f64,
    pub threshold_met: bool,
    pub declared_by: DeclaredBy,
}

/// Input for creating an experiment. Counters and lifecycle fields are never
/// accepted from callers.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    pub campaign_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub test_type: TestType,
    pub variants: Vec<VariantContent>,
    #[serde(default)]
    pub settings: ExperimentSettings,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub total_audience: u64,
}

/// Draft edits. Absent fields keep their current value.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variants: Option<Vec<VariantContent>>,
    #[serde(default)]
    pub settings: Option<ExperimentSettings>,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub total_audience: Option<u64>,
}

impl Experiment {
    pub fn from_new(input: NewExperiment, id: String, now_ms: i64) -> Self {
        Self {
            id,
            campaign_id: input.campaign_id,
            name: input.name,
            description: input.description,
            test_type: input.test_type,
            status: ExperimentStatus::Draft,
            variants: input.variants.into_iter().map(Variant::new).collect(),
            settings: input.settings,
            segment_id: input.segment_id,
            total_audience: input.total_audience,
            allocation: None,
            winner: None,
            winner_applied: false,
            created_at: now_ms,
            started_at: None,
            resumed_at: None,
            active_ms: 0,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn apply_patch(&mut self, patch: ExperimentPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(variants) = patch.variants {
            self.variants = variants.into_iter().map(Variant::new).collect();
        }
        if let Some(settings) = patch.settings {
            self.settings = settings;
        }
        if let Some(segment_id) = patch.segment_id {
            self.segment_id = Some(segment_id);
        }
        if let Some(total_audience) = patch.total_audience {
            self.total_audience = total_audience;
        }
    }

    pub fn variant(&self, index: usize) -> Result<&Variant> {
        self.variants.get(index).ok_or(ExperimentError::NoSuchVariant {
            index,
            count: self.variants.len(),
        })
    }

    /// Running time so far, excluding time spent paused.
    pub fn active_elapsed_ms(&self, now_ms: i64) -> i64 {
        let current = match (self.status, self.resumed_at) {
            (ExperimentStatus::Running, Some(resumed_at)) => (now_ms - resumed_at).max(0),
            _ => 0,
        };
        self.active_ms + current
    }

    pub fn duration_elapsed(&self, now_ms: i64) -> bool {
        self.status == ExperimentStatus::Running
            && self.active_elapsed_ms(now_ms) >= self.settings.duration_ms()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ExperimentError::Validation(
                "name must not be empty".to_string(),
            ));
        }
        if self.campaign_id.trim().is_empty() {
            return Err(ExperimentError::Validation(
                "campaignId must not be empty".to_string(),
            ));
        }
        if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&self.variants.len()) {
            return Err(ExperimentError::InvalidVariantCount(self.variants.len()));
        }
        if self.total_audience == 0 {
            return Err(ExperimentError::Validation(
                "totalAudience must be positive".to_string(),
            ));
        }
        if self.settings.duration_value == 0 {
            return Err(ExperimentError::Validation(
                "durationValue must be positive".to_string(),
            ));
        }
        if self.settings.minimum_sample_size == 0 {
            return Err(ExperimentError::Validation(
                "minimumSampleSize must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for variant in &self.variants {
            let content = &variant.content;
            if content.name.trim().is_empty() {
                return Err(ExperimentError::Validation(
                    "variant name must not be empty".to_string(),
                ));
            }
            if !names.insert(content.name.as_str()) {
                return Err(ExperimentError::Validation(format!(
                    "duplicate variant name '{}'",
                    content.name
                )));
            }
            if let Some(ref send_time) = content.send_time {
                chrono::DateTime::parse_from_rfc3339(send_time).map_err(|_| {
                    ExperimentError::Validation(format!(
                        "variant '{}' sendTime is not an RFC 3339 timestamp",
                        content.name
                    ))
                })?;
            }
            let missing = match self.test_type {
                TestType::Subject if content.subject.is_none() => Some("subject"),
                TestType::Time if content.send_time.is_none() => Some("sendTime"),
                TestType::Content if content.body_html.is_none() => Some("bodyHtml"),
                _ => None,
            };
            if let Some(field) = missing {
                return Err(ExperimentError::Validation(format!(
                    "variant '{}' needs {field} for a {:?} test",
                    content.name, self.test_type
                )));
            }
        }

        if let Some(started_at) = self.started_at {
            if started_at < self.created_at {
                return Err(ExperimentError::Validation(
                    "startedAt precedes createdAt".to_string(),
                ));
            }
            if let Some(completed_at) = self.completed_at {
                if completed_at < started_at {
                    return Err(ExperimentError::Validation(
                        "completedAt precedes startedAt".to_string(),
                    ));
                }
            }
        }
        if self.winner.is_some() && self.status != ExperimentStatus::Completed {
            return Err(ExperimentError::Validation(
                "winner is only allowed on completed experiments".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(name: &str) -> VariantContent {
        VariantContent {
            name: name.to_string(),
            subject: Some(format!("Subject {name}")),
            ..Default::default()
        }
    }

    fn valid_experiment() -> Experiment {
        Experiment::from_new(
            NewExperiment {
                campaign_id: "campaign-1".to_string(),
                name: "Spring launch subject test".to_string(),
                description: None,
                test_type: TestType::Subject,
                variants: vec![content("Variant A"), content("Variant B")],
                settings: ExperimentSettings::default(),
                segment_id: Some("segment-1".to_string()),
                total_audience: 1000,
            },
            "550e8400-e29b-41d4-a716-446655440000".to_string(),
            1_700_000_000_000,
        )
    }

    #[test]
    fn validate_valid_experiment_succeeds() {
        assert!(valid_experiment().validate().is_ok());
    }

    #[test]
    fn new_experiment_starts_in_draft_with_zero_counters() {
        let e = valid_experiment();
        assert_eq!(e.status, ExperimentStatus::Draft);
        assert!(e
            .variants
            .iter()
            .all(|v| v.counters == FunnelCounters::default()));
        assert!(e.winner.is_none());
        assert_eq!(e.revision, 0);
    }

    #[test]
    fn validate_five_variants_fails_with_variant_count() {
        let mut e = valid_experiment();
        e.variants = (0..5)
            .map(|i| Variant::new(content(&format!("V{i}"))))
            .collect();
        assert!(matches!(
            e.validate(),
            Err(ExperimentError::InvalidVariantCount(5))
        ));
    }

    #[test]
    fn validate_single_variant_fails() {
        let mut e = valid_experiment();
        e.variants.truncate(1);
        assert!(matches!(
            e.validate(),
            Err(ExperimentError::InvalidVariantCount(1))
        ));
    }

    #[test]
    fn validate_duplicate_variant_names_fails() {
        let mut e = valid_experiment();
        e.variants[1].content.name = "Variant A".to_string();
        assert!(matches!(e.validate(), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn validate_zero_audience_fails() {
        let mut e = valid_experiment();
        e.total_audience = 0;
        assert!(matches!(e.validate(), Err(ExperimentError::Validation(_))));
    }

    #[test]
    fn validate_subject_test_requires_subject() {
        let mut e = valid_experiment();
        e.variants[0].content.subject = None;
        assert!(e.validate().is_err());
    }

    #[test]
    fn validate_time_test_requires_parseable_send_time() {
        let mut e = valid_experiment();
        e.test_type = TestType::Time;
        e.variants[0].content.send_time = Some("2026-03-01T09:00:00Z".to_string());
        e.variants[1].content.send_time = Some("tomorrow morning".to_string());
        assert!(e.validate().is_err());
        e.variants[1].content.send_time = Some("2026-03-01T17:00:00+02:00".to_string());
        assert!(e.validate().is_ok());
    }

    #[test]
    fn validate_comprehensive_test_needs_no_content_fields() {
        let mut e = valid_experiment();
        e.test_type = TestType::Comprehensive;
        for v in &mut e.variants {
            v.content.subject = None;
        }
        assert!(e.validate().is_ok());
    }

    #[test]
    fn validate_winner_on_running_experiment_fails() {
        let mut e = valid_experiment();
        e.status = ExperimentStatus::Running;
        e.winner = Some(Winner {
            variant_index: 0,
            variant_name: "Variant A".to_string(),
            metric: Metric::OpenRate,
            confidence: 99.0,
            improvement_percent: 10.0,
            p_value: 0.01,
            threshold_met: true,
            declared_by: DeclaredBy::Operator,
        });
        assert!(e.validate().is_err());
    }

    #[test]
    fn duration_units_convert_to_millis() {
        assert_eq!(DurationUnit::Hours.millis(2), 2 * HOUR_MS);
        assert_eq!(DurationUnit::Days.millis(1), 24 * HOUR_MS);
        assert_eq!(DurationUnit::Weeks.millis(1), 7 * 24 * HOUR_MS);
    }

    #[test]
    fn active_elapsed_excludes_paused_time() {
        let mut e = valid_experiment();
        e.status = ExperimentStatus::Paused;
        e.active_ms = 5_000;
        e.resumed_at = None;
        assert_eq!(e.active_elapsed_ms(1_000_000_000_000_000), 5_000);

        e.status = ExperimentStatus::Running;
        e.resumed_at = Some(10_000);
        assert_eq!(e.active_elapsed_ms(12_000), 7_000);
    }

    #[test]
    fn confidence_level_rejects_other_values() {
        assert!(serde_json::from_str::<ConfidenceLevel>("95").is_ok());
        assert!(serde_json::from_str::<ConfidenceLevel>("80").is_err());
        assert_eq!(
            serde_json::to_string(&ConfidenceLevel::NinetyNine).unwrap(),
            "99"
        );
    }

    #[test]
    fn settings_default_when_omitted() {
        let s: ExperimentSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, ExperimentSettings::default());
        assert_eq!(s.duration_ms(), 7 * 24 * HOUR_MS);
    }

    #[test]
    fn variant_serializes_counters_inline() {
        let mut v = Variant::new(content("Variant A"));
        v.counters.add(EventKind::Opened, 3);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["name"], "Variant A");
        assert_eq!(json["opened"], 3);
        assert_eq!(json["sent"], 0);
        assert!(json.get("bodyHtml").is_none());
    }

    #[test]
    fn experiment_serializes_to_camel_case() {
        let e = valid_experiment();
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("campaignId"));
        assert!(json.contains("totalAudience"));
        assert!(!json.contains("total_audience"));
    }

    #[test]
    fn event_kind_rejects_unknown_strings() {
        assert_eq!(
            serde_json::from_str::<EventKind>("\"opened\"").unwrap(),
            EventKind::Opened
        );
        assert!(serde_json::from_str::<EventKind>("\"forwarded\"").is_err());
    }

    #[test]
    fn counters_add_only_touches_named_kind() {
        let mut c = FunnelCounters::default();
        c.add(EventKind::Clicked, 4);
        for kind in EventKind::ALL {
            let expected = if kind == EventKind::Clicked { 4 } else { 0 };
            assert_eq!(c.get(kind), expected, "{kind:?}");
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(
            ExperimentStatus::parse("Running").unwrap(),
            ExperimentStatus::Running
        );
        assert!(ExperimentStatus::parse("stopped").is_err());
    }

    #[test]
    fn patch_only_replaces_present_fields() {
        let mut e = valid_experiment();
        e.apply_patch(ExperimentPatch {
            name: Some("Renamed".to_string()),
            total_audience: Some(2000),
            ..Default::default()
        });
        assert_eq!(e.name, "Renamed");
        assert_eq!(e.total_audience, 2000);
        assert_eq!(e.variants.len(), 2);
        assert_eq!(e.segment_id.as_deref(), Some("segment-1"));
    }
}
