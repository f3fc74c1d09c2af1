//! Read-side view of an experiment: counters, rates, pairwise significance.
//!
//! Pure function of the stored experiment, so polling it repeatedly without
//! new events returns identical output.

use serde::Serialize;

use super::aggregator::{funnel_warnings, VariantRates};
use super::config::{
    ConfidenceLevel, Experiment, ExperimentStatus, FunnelCounters, Metric, TestType, Winner,
};
use super::stats::{self, SampleRatioCheck, SignificanceResult};
use super::winner::{suggest_winner, WinnerSuggestion};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantResult {
    pub index: usize,
    pub name: String,
    #[serde(flatten)]
    pub counters: FunnelCounters,
    pub rates: VariantRates,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub funnel_warnings: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub campaign_id: String,
    pub name: String,
    pub test_type: TestType,
    pub status: ExperimentStatus,
    pub metric: Metric,
    pub confidence_level: ConfidenceLevel,
    pub total_audience: u64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: i64,
    pub variants: Vec<VariantResult>,
    pub comparisons: Vec<SignificanceResult>,
    pub suggestion: Option<WinnerSuggestion>,
    pub winner: Option<Winner>,
    pub sample_ratio_mismatch: Option<SampleRatioCheck>,
}

impl ExperimentResults {
    pub fn build(experiment: &Experiment, metric: Metric) -> Self {
        let variants = experiment
            .variants
            .iter()
            .enumerate()
            .map(|(index, v)| VariantResult {
                index,
                name: v.name().to_string(),
                counters: v.counters,
                rates: VariantRates::from_counters(&v.counters),
                funnel_warnings: funnel_warnings(&v.counters),
            })
            .collect();

        let sample_ratio_mismatch = experiment.allocation.as_ref().and_then(|allocation| {
            let sent: Vec<u64> = experiment.variants.iter().map(|v| v.counters.sent).collect();
            stats::check_sample_ratio_mismatch(&sent, &allocation.buckets)
        });

        Self {
            experiment_id: experiment.id.clone(),
            campaign_id: experiment.campaign_id.clone(),
            name: experiment.name.clone(),
            test_type: experiment.test_type,
            status: experiment.status,
            metric,
            confidence_level: experiment.settings.confidence_level,
            total_audience: experiment.total_audience,
            started_at: experiment.started_at,
            completed_at: experiment.completed_at,
            duration_ms: experiment.settings.duration_ms(),
            variants,
            comparisons: stats::pairwise(&experiment.variants, metric),
            suggestion: suggest_winner(experiment, metric),
            winner: experiment.winner.clone(),
            sample_ratio_mismatch,
        }
    }
}
