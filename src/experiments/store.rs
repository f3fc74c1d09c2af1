use std::path::{Path, PathBuf};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::config::{Experiment, ExperimentStatus, MemberMap};
use crate::error::{ExperimentError, Result};

#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    pub campaign_id: Option<String>,
}

impl ExperimentFilter {
    pub fn matches(&self, experiment: &Experiment) -> bool {
        if let Some(status) = self.status {
            if experiment.status != status {
                return false;
            }
        }
        if let Some(ref campaign_id) = self.campaign_id {
            if &experiment.campaign_id != campaign_id {
                return false;
            }
        }
        true
    }
}

/// Persistence boundary for experiments.
///
/// Every write is conditional on the stored `revision`: a writer that read
/// revision `n` can only replace the record while it is still at `n`, and
/// the stored copy then carries `n + 1`.
pub trait ExperimentRepository: Send + Sync {
    fn insert(&self, experiment: Experiment) -> Result<Experiment>;

    fn get(&self, id: &str) -> Result<Experiment>;

    fn list(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>>;

    /// Replaces the stored experiment if its revision is still
    /// `expected_revision`; otherwise `ConcurrencyConflict`.
    fn compare_and_swap(&self, expected_revision: u64, experiment: Experiment) -> Result<Experiment>;

    fn delete(&self, id: &str, expected_revision: u64) -> Result<()>;

    /// Stores the member map frozen when `id` was started, replacing any
    /// earlier one. Written once per start, never on the event path.
    fn save_members(&self, id: &str, members: &MemberMap) -> Result<()>;

    /// Variant frozen for `member_id`, or `None` if the member is not part of
    /// the stored map.
    fn member_variant(&self, id: &str, member_id: &str) -> Result<Option<usize>>;
}

/// DashMap-backed repository, optionally mirrored to one JSON file per
/// experiment under `<data_dir>/.experiments` and one per member map under
/// `<data_dir>/.experiments/members`.
pub struct ExperimentStore {
    experiments: DashMap<String, Experiment>,
    members: DashMap<String, MemberMap>,
    dir: Option<PathBuf>,
}

const MEMBERS_DIR: &str = "members";

impl ExperimentStore {
    pub fn in_memory() -> Self {
        Self {
            experiments: DashMap::new(),
            members: DashMap::new(),
            dir: None,
        }
    }

    /// Opens (or creates) the file-backed store and loads every saved experiment.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(".experiments");
        std::fs::create_dir_all(dir.join(MEMBERS_DIR))?;
        let store = Self {
            experiments: DashMap::new(),
            members: DashMap::new(),
            dir: Some(dir),
        };
        store.load_all()?;
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    fn load_all(&self) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            let experiment: Experiment = serde_json::from_str(&data)?;
            experiment.validate()?;
            self.experiments.insert(experiment.id.clone(), experiment);
        }
        for entry in std::fs::read_dir(dir.join(MEMBERS_DIR))? {
            let path = entry?.path();
            let Some(id) = json_stem(&path) else {
                continue;
            };
            let data = std::fs::read_to_string(&path)?;
            let members: MemberMap = serde_json::from_str(&data)?;
            self.members.insert(id, members);
        }
        tracing::debug!(
            count = self.experiments.len(),
            member_maps = self.members.len(),
            "loaded experiments from disk"
        );
        Ok(())
    }

    fn atomic_write(&self, experiment: &Experiment) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        write_json(dir, &experiment.id, experiment)
    }

    fn remove_file(&self, id: &str) -> Result<()> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        for path in [
            dir.join(format!("{}.json", id)),
            dir.join(MEMBERS_DIR).join(format!("{}.json", id)),
        ] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Writes `<dir>/<id>.json` via a temp file and rename.
fn write_json<T: serde::Serialize>(dir: &Path, id: &str, value: &T) -> Result<()> {
    let tmp_path = dir.join(format!("{}.json.tmp", id));
    let final_path = dir.join(format!("{}.json", id));
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

fn json_stem(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

impl ExperimentRepository for ExperimentStore {
    fn insert(&self, experiment: Experiment) -> Result<Experiment> {
        experiment.validate()?;
        match self.experiments.entry(experiment.id.clone()) {
            Entry::Occupied(_) => Err(ExperimentError::AlreadyExists(experiment.id)),
            Entry::Vacant(slot) => {
                self.atomic_write(&experiment)?;
                slot.insert(experiment.clone());
                Ok(experiment)
            }
        }
    }

    fn get(&self, id: &str) -> Result<Experiment> {
        self.experiments
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))
    }

    fn list(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>> {
        Ok(self
            .experiments
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn compare_and_swap(&self, expected_revision: u64, mut experiment: Experiment) -> Result<Experiment> {
        experiment.validate()?;
        let mut stored = self
            .experiments
            .get_mut(&experiment.id)
            .ok_or_else(|| ExperimentError::NotFound(experiment.id.clone()))?;
        if stored.revision != expected_revision {
            return Err(ExperimentError::ConcurrencyConflict(experiment.id));
        }
        experiment.revision = expected_revision + 1;
        self.atomic_write(&experiment)?;
        *stored = experiment.clone();
        Ok(experiment)
    }

    fn delete(&self, id: &str, expected_revision: u64) -> Result<()> {
        match self.experiments.entry(id.to_string()) {
            Entry::Vacant(_) => Err(ExperimentError::NotFound(id.to_string())),
            Entry::Occupied(entry) if entry.get().revision != expected_revision => {
                Err(ExperimentError::ConcurrencyConflict(id.to_string()))
            }
            Entry::Occupied(entry) => {
                // files go first so a failed unlink leaves the record in place
                self.remove_file(id)?;
                entry.remove();
                self.members.remove(id);
                Ok(())
            }
        }
    }

    fn save_members(&self, id: &str, members: &MemberMap) -> Result<()> {
        if let Some(ref dir) = self.dir {
            write_json(&dir.join(MEMBERS_DIR), id, members)?;
        }
        self.members.insert(id.to_string(), members.clone());
        Ok(())
    }

    fn member_variant(&self, id: &str, member_id: &str) -> Result<Option<usize>> {
        Ok(self
            .members
            .get(id)
            .and_then(|map| map.get(member_id).copied()))
    }
}
