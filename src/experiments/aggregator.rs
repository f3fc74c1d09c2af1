//! Event folding and derived rates.
//!
//! Counters are only ever added to, so any set of events yields the same
//! totals regardless of arrival order or batching. Rates are derived on read.

use serde::{Deserialize, Serialize};

use super::config::{EventKind, Experiment, FunnelCounters, Metric, Variant};
use crate::error::{ExperimentError, Result};

/// One delivery or engagement observation for a variant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VariantEvent {
    pub variant_index: usize,
    pub kind: EventKind,
    #[serde(default = "default_count")]
    pub count: u64,
}

fn default_count() -> u64 {
    1
}

/// Ingest acknowledgement. `accepted` is false when the experiment was not
/// running and the events were dropped.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub accepted: bool,
    pub events: usize,
}

/// Checks a batch against the experiment before anything is applied.
pub fn validate_events(experiment: &Experiment, events: &[VariantEvent]) -> Result<()> {
    if events.is_empty() {
        return Err(ExperimentError::Validation(
            "at least one event is required".to_string(),
        ));
    }
    for event in events {
        if event.count == 0 {
            return Err(ExperimentError::Validation(
                "event count must be positive".to_string(),
            ));
        }
        experiment.variant(event.variant_index)?;
    }
    Ok(())
}

/// Adds every event to its variant's counters. Callers validate first.
pub fn apply_events(variants: &mut [Variant], events: &[VariantEvent]) {
    for event in events {
        if let Some(variant) = variants.get_mut(event.variant_index) {
            variant.counters.add(event.kind, event.count);
        }
    }
}

// ── Derived rates ───────────────────────────────────────────────────

fn safe_div(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Funnel rates as fractions in `[0, 1]` for consistent counters.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VariantRates {
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub click_to_open_rate: f64,
    pub conversion_rate: f64,
    pub bounce_rate: f64,
    pub unsubscribe_rate: f64,
    pub complaint_rate: f64,
}

impl VariantRates {
    pub fn from_counters(c: &FunnelCounters) -> Self {
        Self {
            delivery_rate: safe_div(c.delivered, c.sent),
            open_rate: safe_div(c.opened, c.delivered),
            click_rate: safe_div(c.clicked, c.delivered),
            click_to_open_rate: safe_div(c.clicked, c.opened),
            conversion_rate: safe_div(c.converted, c.delivered),
            bounce_rate: safe_div(c.bounced, c.sent),
            unsubscribe_rate: safe_div(c.unsubscribed, c.delivered),
            complaint_rate: safe_div(c.complained, c.delivered),
        }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::OpenRate => self.open_rate,
            Metric::ClickRate => self.click_rate,
            Metric::ConversionRate => self.conversion_rate,
        }
    }
}

pub fn metric_rate(counters: &FunnelCounters, metric: Metric) -> f64 {
    safe_div(counters.get(metric.engaged_kind()), counters.delivered)
}

/// Funnel orderings that out-of-order webhooks can temporarily break.
pub fn funnel_warnings(c: &FunnelCounters) -> Vec<String> {
    let checks = [
        (c.delivered, "delivered", c.sent, "sent"),
        (c.bounced, "bounced", c.sent, "sent"),
        (c.opened, "opened", c.delivered, "delivered"),
        (c.clicked, "clicked", c.delivered, "delivered"),
        (c.converted, "converted", c.delivered, "delivered"),
    ];
    checks
        .iter()
        .filter(|(lhs, _, rhs, _)| lhs > rhs)
        .map(|(lhs, lhs_name, rhs, rhs_name)| {
            format!("{lhs_name} ({lhs}) exceeds {rhs_name} ({rhs})")
        })
        .collect()
}
