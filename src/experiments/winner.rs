//! Winner scoring, suggestion, the auto-declare policy and hand-off of the
//! winning content to the campaign system.

use serde::{Deserialize, Serialize};

use super::aggregator::metric_rate;
use super::config::{DeclaredBy, Experiment, ExperimentStatus, Metric, Winner};
use super::stats;
use crate::error::{ExperimentError, Result};

/// How a candidate variant fares against the best of the others.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score {
    runner_up: usize,
    rate: f64,
    improvement_percent: f64,
    confidence: f64,
    p_value: f64,
    threshold_met: bool,
}

/// Index of the highest-rate variant other than `index`. Ties go to the
/// lowest index.
fn best_other(experiment: &Experiment, index: usize, metric: Metric) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, variant) in experiment.variants.iter().enumerate() {
        if i == index {
            continue;
        }
        let rate = metric_rate(&variant.counters, metric);
        if best.map_or(true, |(_, r)| rate > r) {
            best = Some((i, rate));
        }
    }
    best.map(|(i, _)| i)
}

fn score(experiment: &Experiment, index: usize, metric: Metric) -> Result<Score> {
    let candidate = experiment.variant(index)?;
    let runner_up = best_other(experiment, index, metric).ok_or(ExperimentError::InvalidVariantCount(
        experiment.variants.len(),
    ))?;
    let other = &experiment.variants[runner_up];

    let rate = metric_rate(&candidate.counters, metric);
    let other_rate = metric_rate(&other.counters, metric);
    let improvement_percent = if other_rate == 0.0 {
        0.0
    } else {
        (rate - other_rate) / other_rate * 100.0
    };

    let test = stats::compare(candidate, other, metric);
    let confidence = (1.0 - test.p_value) * 100.0;
    Ok(Score {
        runner_up,
        rate,
        improvement_percent,
        confidence,
        p_value: test.p_value,
        threshold_met: confidence >= experiment.settings.confidence_level.percent(),
    })
}

/// Builds the winner record for `index`, scored against the best other variant.
pub fn evaluate(
    experiment: &Experiment,
    index: usize,
    metric: Metric,
    declared_by: DeclaredBy,
) -> Result<Winner> {
    let s = score(experiment, index, metric)?;
    Ok(Winner {
        variant_index: index,
        variant_name: experiment.variants[index].name().to_string(),
        metric,
        confidence: s.confidence,
        improvement_percent: s.improvement_percent,
        p_value: s.p_value,
        threshold_met: s.threshold_met,
        declared_by,
    })
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinnerSuggestion {
    pub variant_index: usize,
    pub variant_name: String,
    pub metric: Metric,
    pub rate: f64,
    pub runner_up_index: usize,
    pub improvement_percent: f64,
    pub confidence: f64,
    pub p_value: f64,
    pub threshold_met: bool,
}

impl WinnerSuggestion {
    pub fn into_winner(self, declared_by: DeclaredBy) -> Winner {
        Winner {
            variant_index: self.variant_index,
            variant_name: self.variant_name,
            metric: self.metric,
            confidence: self.confidence,
            improvement_percent: self.improvement_percent,
            p_value: self.p_value,
            threshold_met: self.threshold_met,
            declared_by,
        }
    }
}

/// Leading variant on `metric` compared with the runner-up. `None` when every
/// variant has the same rate.
pub fn suggest_winner(experiment: &Experiment, metric: Metric) -> Option<WinnerSuggestion> {
    let rates: Vec<f64> = experiment
        .variants
        .iter()
        .map(|v| metric_rate(&v.counters, metric))
        .collect();
    let first = *rates.first()?;
    if rates.iter().all(|&r| r == first) {
        return None;
    }

    let mut leader = 0;
    for (i, &rate) in rates.iter().enumerate() {
        if rate > rates[leader] {
            leader = i;
        }
    }
    let s = score(experiment, leader, metric).ok()?;
    Some(WinnerSuggestion {
        variant_index: leader,
        variant_name: experiment.variants[leader].name().to_string(),
        metric,
        rate: s.rate,
        runner_up_index: s.runner_up,
        improvement_percent: s.improvement_percent,
        confidence: s.confidence,
        p_value: s.p_value,
        threshold_met: s.threshold_met,
    })
}

/// Winner the auto-optimize policy would declare right now, if any.
pub fn auto_winner(experiment: &Experiment) -> Option<Winner> {
    let settings = &experiment.settings;
    if !settings.auto_optimize || experiment.status != ExperimentStatus::Running {
        return None;
    }
    if experiment
        .variants
        .iter()
        .any(|v| v.counters.delivered < settings.minimum_sample_size)
    {
        return None;
    }
    let suggestion = suggest_winner(experiment, settings.metric)?;
    if !suggestion.threshold_met {
        return None;
    }
    Some(suggestion.into_winner(DeclaredBy::Auto))
}

// ── Publishing ──────────────────────────────────────────────────────

/// Content reference handed to the campaign system once a winner is applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WinningContent {
    pub campaign_id: String,
    pub experiment_id: String,
    pub variant_index: usize,
    pub variant_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_time: Option<String>,
}

impl WinningContent {
    pub fn for_winner(experiment: &Experiment, winner: &Winner) -> Result<Self> {
        let content = &experiment.variant(winner.variant_index)?.content;
        Ok(Self {
            campaign_id: experiment.campaign_id.clone(),
            experiment_id: experiment.id.clone(),
            variant_index: winner.variant_index,
            variant_name: content.name.clone(),
            subject: content.subject.clone(),
            body_html: content.body_html.clone(),
            send_time: content.send_time.clone(),
        })
    }
}

/// Campaign-system collaborator that receives the winning variant's content.
pub trait WinnerPublisher: Send + Sync {
    fn publish(&self, content: &WinningContent) -> std::result::Result<(), String>;
}

/// Publisher that only logs the hand-off.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl WinnerPublisher for TracingPublisher {
    fn publish(&self, content: &WinningContent) -> std::result::Result<(), String> {
        tracing::info!(
            campaign_id = %content.campaign_id,
            experiment_id = %content.experiment_id,
            variant = %content.variant_name,
            "winning content published"
        );
        Ok(())
    }
}
