//! Experiment lifecycle: draft → running ⇄ paused → completed.
//!
//! Every mutation is read → verify → compare-and-swap on `revision`, with a
//! per-experiment mutex around the read-modify-write. A lost swap is retried
//! once from a fresh read.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::aggregator::{apply_events, validate_events, EventAck, VariantEvent};
use super::allocation::build_allocation;
use super::clock::{Clock, SystemClock};
use super::config::{
    DeclaredBy, EventKind, Experiment, ExperimentPatch, ExperimentStatus, Metric, NewExperiment,
    Winner,
};
use super::results::ExperimentResults;
use super::store::{ExperimentFilter, ExperimentRepository};
use super::winner::{auto_winner, evaluate, TracingPublisher, WinnerPublisher, WinningContent};
use crate::error::{ExperimentError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: ExperimentFilter,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentPage {
    pub experiments: Vec<Experiment>,
    pub count: usize,
    pub total: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub member_id: String,
    pub variant_index: usize,
    pub variant_name: String,
}

/// Outcome of a mutation closure: write the modified experiment, or leave the
/// stored copy untouched.
enum Step<T> {
    Write(T),
    Keep(T),
}

pub struct ExperimentManager {
    repo: Arc<dyn ExperimentRepository>,
    clock: Arc<dyn Clock>,
    publisher: Arc<dyn WinnerPublisher>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExperimentManager {
    pub fn new(repo: Arc<dyn ExperimentRepository>) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
            publisher: Arc::new(TracingPublisher),
            locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn WinnerPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    // ── CRUD ────────────────────────────────────────────────────────

    pub fn create_experiment(&self, input: NewExperiment) -> Result<Experiment> {
        let id = uuid::Uuid::new_v4().to_string();
        let experiment = Experiment::from_new(input, id, self.clock.now_ms());
        let created = self.repo.insert(experiment)?;
        tracing::info!(
            experiment_id = %created.id,
            campaign_id = %created.campaign_id,
            variants = created.variants.len(),
            "experiment created"
        );
        Ok(created)
    }

    pub fn get_experiment(&self, id: &str) -> Result<Experiment> {
        let experiment = self.repo.get(id)?;
        self.refresh(experiment)
    }

    /// Newest first, then paged. Lazy completion runs before the status filter
    /// so a running filter never returns an experiment that has expired.
    pub fn list_experiments(&self, query: &ListQuery) -> Result<ExperimentPage> {
        let scope = ExperimentFilter {
            status: None,
            campaign_id: query.filter.campaign_id.clone(),
        };
        let mut experiments = Vec::new();
        for experiment in self.repo.list(&scope)? {
            let experiment = match self.refresh(experiment) {
                Ok(e) => e,
                Err(ExperimentError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if query.filter.matches(&experiment) {
                experiments.push(experiment);
            }
        }
        experiments.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let total = experiments.len();
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let experiments: Vec<Experiment> = experiments
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();
        Ok(ExperimentPage {
            count: experiments.len(),
            experiments,
            total,
        })
    }

    pub fn update_experiment(&self, id: &str, patch: ExperimentPatch) -> Result<Experiment> {
        let (experiment, ()) = self.mutate(id, "update", |experiment, _| {
            require(experiment, ExperimentStatus::Draft, "update")?;
            experiment.apply_patch(patch.clone());
            Ok(Step::Write(()))
        })?;
        tracing::info!(experiment_id = %id, "experiment updated");
        Ok(experiment)
    }

    pub fn delete_experiment(&self, id: &str) -> Result<()> {
        self.repo.get(id)?;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.delete_draft(id)
        };
        drop(lock);
        if matches!(result, Ok(()) | Err(ExperimentError::NotFound(_))) {
            self.release_lock(id);
        }
        result?;
        tracing::info!(experiment_id = %id, "experiment deleted");
        Ok(())
    }

    fn delete_draft(&self, id: &str) -> Result<()> {
        let experiment = self.repo.get(id)?;
        require(&experiment, ExperimentStatus::Draft, "delete")?;
        match self.repo.delete(id, experiment.revision) {
            Err(ExperimentError::ConcurrencyConflict(_)) => {
                tracing::warn!(experiment_id = %id, "revision conflict on delete, retrying");
                let experiment = self.repo.get(id)?;
                require(&experiment, ExperimentStatus::Draft, "delete")?;
                self.repo.delete(id, experiment.revision)
            }
            other => other,
        }
    }

    // ── Transitions ─────────────────────────────────────────────────

    /// Starts a draft (freezing the allocation) or resumes a paused experiment.
    /// `members` is the resolved audience and is only accepted for drafts.
    pub fn start_experiment(&self, id: &str, members: Option<Vec<String>>) -> Result<Experiment> {
        let (experiment, resumed) = self.mutate(id, "start", |experiment, now| {
            match experiment.status {
                ExperimentStatus::Draft => {
                    let (allocation, member_map) = build_allocation(
                        &experiment.id,
                        experiment.total_audience,
                        experiment.variants.len(),
                        members.as_deref(),
                    )?;
                    // partitioning is deterministic, so a retried start rewrites the same map
                    if allocation.has_member_map() {
                        self.repo.save_members(&experiment.id, &member_map)?;
                    }
                    experiment.allocation = Some(allocation);
                    experiment.status = ExperimentStatus::Running;
                    experiment.started_at = Some(now);
                    experiment.resumed_at = Some(now);
                    experiment.active_ms = 0;
                    Ok(Step::Write(false))
                }
                ExperimentStatus::Paused if members.is_some() => Err(ExperimentError::Validation(
                    "members can only be supplied when starting a draft".to_string(),
                )),
                ExperimentStatus::Paused => {
                    resume(experiment, now);
                    Ok(Step::Write(true))
                }
                from => Err(ExperimentError::InvalidTransition {
                    from,
                    action: "start",
                }),
            }
        })?;
        if resumed {
            tracing::info!(experiment_id = %id, "experiment resumed");
        } else {
            tracing::info!(
                experiment_id = %id,
                buckets = ?experiment.allocation.as_ref().map(|a| &a.buckets),
                "experiment started"
            );
        }
        Ok(experiment)
    }

    pub fn pause_experiment(&self, id: &str) -> Result<Experiment> {
        let (experiment, ()) = self.mutate(id, "pause", |experiment, now| {
            require(experiment, ExperimentStatus::Running, "pause")?;
            suspend(experiment, now);
            experiment.status = ExperimentStatus::Paused;
            Ok(Step::Write(()))
        })?;
        tracing::info!(experiment_id = %id, active_ms = experiment.active_ms, "experiment paused");
        Ok(experiment)
    }

    pub fn resume_experiment(&self, id: &str) -> Result<Experiment> {
        let (experiment, ()) = self.mutate(id, "resume", |experiment, now| {
            require(experiment, ExperimentStatus::Paused, "resume")?;
            resume(experiment, now);
            Ok(Step::Write(()))
        })?;
        tracing::info!(experiment_id = %id, "experiment resumed");
        Ok(experiment)
    }

    // ── Events ──────────────────────────────────────────────────────

    pub fn record_event(
        &self,
        id: &str,
        variant_index: usize,
        kind: EventKind,
        count: u64,
    ) -> Result<EventAck> {
        self.record_events(
            id,
            &[VariantEvent {
                variant_index,
                kind,
                count,
            }],
        )
    }

    /// Applies a batch under one lock acquisition. Outside `running` the batch
    /// is dropped and acknowledged with `accepted = false`.
    pub fn record_events(&self, id: &str, events: &[VariantEvent]) -> Result<EventAck> {
        let (_, ack) = self.mutate(id, "record events", |experiment, _| {
            validate_events(experiment, events)?;
            if experiment.status != ExperimentStatus::Running {
                tracing::warn!(
                    experiment_id = %experiment.id,
                    status = %experiment.status,
                    events = events.len(),
                    "dropping events for experiment that is not running"
                );
                return Ok(Step::Keep(EventAck {
                    accepted: false,
                    events: events.len(),
                }));
            }
            apply_events(&mut experiment.variants, events);
            Ok(Step::Write(EventAck {
                accepted: true,
                events: events.len(),
            }))
        })?;
        Ok(ack)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// `metric` defaults to the experiment's configured metric.
    pub fn get_results(&self, id: &str, metric: Option<Metric>) -> Result<ExperimentResults> {
        let experiment = self.get_experiment(id)?;
        let metric = metric.unwrap_or(experiment.settings.metric);
        Ok(ExperimentResults::build(&experiment, metric))
    }

    pub fn get_assignment(&self, id: &str, member_id: &str) -> Result<Assignment> {
        if member_id.is_empty() {
            return Err(ExperimentError::Validation(
                "member id must not be empty".to_string(),
            ));
        }
        let experiment = self.get_experiment(id)?;
        let allocation = experiment
            .allocation
            .as_ref()
            .ok_or(ExperimentError::InvalidTransition {
                from: experiment.status,
                action: "look up assignments for",
            })?;
        let variant_index = if allocation.has_member_map() {
            self.repo
                .member_variant(&experiment.id, member_id)?
                .ok_or_else(|| {
                    ExperimentError::NotFound(format!("member {member_id} in experiment {id}"))
                })?
        } else {
            allocation.slot_for(&experiment.id, member_id)
        };
        Ok(Assignment {
            member_id: member_id.to_string(),
            variant_index,
            variant_name: experiment.variant(variant_index)?.name().to_string(),
        })
    }

    // ── Winner ──────────────────────────────────────────────────────

    /// Declares `variant_index` the winner and completes the experiment.
    /// Repeating the call with the same index on a completed experiment
    /// returns the stored winner.
    pub fn declare_winner(
        &self,
        id: &str,
        variant_index: usize,
        metric: Option<Metric>,
    ) -> Result<Winner> {
        let (_, winner) = self.mutate(id, "declare winner", |experiment, now| {
            experiment.variant(variant_index)?;
            if experiment.status == ExperimentStatus::Draft {
                return Err(ExperimentError::ExperimentNotCompletable(
                    ExperimentStatus::Draft,
                ));
            }
            // only completed experiments carry a winner
            if let Some(existing) = &experiment.winner {
                if existing.variant_index != variant_index {
                    return Err(ExperimentError::InvalidTransition {
                        from: experiment.status,
                        action: "declare a different winner for",
                    });
                }
                return Ok(Step::Keep(existing.clone()));
            }

            let metric = metric.unwrap_or(experiment.settings.metric);
            let winner = evaluate(experiment, variant_index, metric, DeclaredBy::Operator)?;
            if !winner.threshold_met {
                tracing::warn!(
                    experiment_id = %experiment.id,
                    confidence = winner.confidence,
                    "winner declared below the configured confidence level"
                );
            }
            if experiment.status != ExperimentStatus::Completed {
                complete(experiment, now, now);
            }
            experiment.winner = Some(winner.clone());
            Ok(Step::Write(winner))
        })?;
        tracing::info!(
            experiment_id = %id,
            variant = %winner.variant_name,
            confidence = winner.confidence,
            "winner declared"
        );
        Ok(winner)
    }

    /// Hands the winning content to the publisher once and marks the
    /// experiment as applied. Later calls return the content without
    /// publishing again.
    pub fn apply_winner(&self, id: &str) -> Result<WinningContent> {
        let publisher = Arc::clone(&self.publisher);
        let (_, content) = self.mutate(id, "apply winner", |experiment, _| {
            let winner = experiment
                .winner
                .as_ref()
                .ok_or(ExperimentError::InvalidTransition {
                    from: experiment.status,
                    action: "apply the winner of",
                })?;
            let content = WinningContent::for_winner(experiment, winner)?;
            if experiment.winner_applied {
                return Ok(Step::Keep(content));
            }
            publisher.publish(&content).map_err(|reason| {
                tracing::error!(
                    experiment_id = %experiment.id,
                    error = %reason,
                    "failed to publish winning content"
                );
                ExperimentError::PublishFailed(reason)
            })?;
            experiment.winner_applied = true;
            Ok(Step::Write(content))
        })?;
        Ok(content)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// Drops the lock entry for `id` unless another caller still holds it.
    fn release_lock(&self, id: &str) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Settles a freshly read experiment. Only takes the lock when expiry or
    /// the auto-policy actually has something to write.
    fn refresh(&self, experiment: Experiment) -> Result<Experiment> {
        let now = self.clock.now_ms();
        if !experiment.duration_elapsed(now) && auto_winner(&experiment).is_none() {
            return Ok(experiment);
        }
        let (experiment, ()) = self.mutate(&experiment.id, "refresh", |_, _| Ok(Step::Keep(())))?;
        Ok(experiment)
    }

    fn mutate<T, F>(&self, id: &str, action: &'static str, mut apply: F) -> Result<(Experiment, T)>
    where
        F: FnMut(&mut Experiment, i64) -> Result<Step<T>>,
    {
        // unknown ids never get a lock entry
        self.repo.get(id)?;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.try_mutate(id, &mut apply) {
                Err(ExperimentError::ConcurrencyConflict(_)) => {
                    tracing::warn!(experiment_id = %id, action, "revision conflict, retrying once");
                    self.try_mutate(id, &mut apply)
                }
                other => other,
            }
        };
        drop(lock);
        if matches!(result, Err(ExperimentError::NotFound(_))) {
            self.release_lock(id);
        }
        result
    }

    fn try_mutate<T, F>(&self, id: &str, apply: &mut F) -> Result<(Experiment, T)>
    where
        F: FnMut(&mut Experiment, i64) -> Result<Step<T>>,
    {
        let now = self.clock.now_ms();
        let experiment = self.settle(self.repo.get(id)?, now)?;
        let expected = experiment.revision;
        let mut working = experiment.clone();
        match apply(&mut working, now)? {
            Step::Keep(value) => Ok((experiment, value)),
            Step::Write(value) => {
                let saved = self.repo.compare_and_swap(expected, working)?;
                Ok((saved, value))
            }
        }
    }

    /// Applies lazy duration completion, then the auto-declare policy, and
    /// persists whichever fired.
    fn settle(&self, mut experiment: Experiment, now: i64) -> Result<Experiment> {
        let expected = experiment.revision;
        if experiment.duration_elapsed(now) {
            let ran_out_at = match experiment.resumed_at {
                Some(resumed_at) => {
                    let remaining = experiment.settings.duration_ms() - experiment.active_ms;
                    (resumed_at + remaining.max(0)).min(now)
                }
                None => now,
            };
            complete(&mut experiment, ran_out_at, now);
            tracing::info!(experiment_id = %experiment.id, "duration elapsed, experiment completed");
        } else if let Some(winner) = auto_winner(&experiment) {
            tracing::info!(
                experiment_id = %experiment.id,
                variant = %winner.variant_name,
                confidence = winner.confidence,
                "auto-declaring winner"
            );
            complete(&mut experiment, now, now);
            experiment.winner = Some(winner);
        } else {
            return Ok(experiment);
        }
        self.repo.compare_and_swap(expected, experiment)
    }
}

fn require(experiment: &Experiment, status: ExperimentStatus, action: &'static str) -> Result<()> {
    if experiment.status == status {
        Ok(())
    } else {
        Err(ExperimentError::InvalidTransition {
            from: experiment.status,
            action,
        })
    }
}

/// Folds the current running segment into `active_ms`.
fn suspend(experiment: &mut Experiment, now: i64) {
    experiment.active_ms = experiment.active_elapsed_ms(now);
    experiment.resumed_at = None;
}

fn resume(experiment: &mut Experiment, now: i64) {
    experiment.status = ExperimentStatus::Running;
    experiment.resumed_at = Some(now);
}

/// `ended_at` is when the run stopped counting; never later than `now`.
fn complete(experiment: &mut Experiment, ended_at: i64, now: i64) {
    let ended_at = ended_at.min(now);
    suspend(experiment, ended_at);
    experiment.status = ExperimentStatus::Completed;
    let floor = experiment.started_at.unwrap_or(experiment.created_at);
    experiment.completed_at = Some(ended_at.max(floor));
}
