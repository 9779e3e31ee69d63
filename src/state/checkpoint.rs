//! Durable per-phase checkpoints
//!
//! Layout: `<run_root>/<run_id>/<phase>_state.json` plus a
//! `run_summary.json` per run. Writes go through a temp file and an atomic
//! rename so a crash never leaves a truncated checkpoint visible.

use crate::config::TopicContext;
use crate::error::{ReviewError, ReviewResult};
use crate::prisma::PrismaCounts;
use crate::state::{PhasePayload, RunId, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable record of one completed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub phase: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub dependencies: Vec<String>,
    pub topic_context: TopicContext,
    pub data: PhasePayload,
    pub prisma_counts: PrismaCounts,
    pub database_breakdown: BTreeMap<String, u64>,
}

/// Top-level metadata for one run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub topic: String,
    pub fingerprint: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// A stored run matching a topic during resume discovery.
#[derive(Debug, Clone)]
pub struct ResumeCandidate {
    pub run_id: RunId,
    pub run_dir: PathBuf,
    /// Number of distinct checkpointed phases
    pub completeness: usize,
    pub latest_phase: String,
    pub latest_ordinal: u32,
}

/// File-backed checkpoint store for one run.
pub struct CheckpointStore {
    run_id: RunId,
    run_dir: PathBuf,
}

const SUMMARY_FILE: &str = "run_summary.json";
const STATE_SUFFIX: &str = "_state.json";

impl CheckpointStore {
    /// Create the run directory (fresh run).
    pub fn create(run_root: &Path, run_id: RunId) -> ReviewResult<Self> {
        let run_dir = run_root.join(run_id.to_string());
        std::fs::create_dir_all(&run_dir)?;
        Ok(Self { run_id, run_dir })
    }

    /// Open an existing run directory (resume).
    pub fn open(run_root: &Path, run_id: RunId) -> ReviewResult<Self> {
        let run_dir = run_root.join(run_id.to_string());
        if !run_dir.is_dir() {
            return Err(ReviewError::StatePersistence(format!(
                "run directory not found: {}",
                run_dir.display()
            )));
        }
        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn phase_path(&self, phase: &str) -> PathBuf {
        self.run_dir.join(format!("{}{}", phase, STATE_SUFFIX))
    }

    /// Serialize to a temp file in the run directory, fsync, then rename
    /// over the target. Readers see either the old or the new checkpoint.
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> ReviewResult<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.run_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target)
            .map_err(|e| ReviewError::StatePersistence(e.to_string()))?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &RunSummary) -> ReviewResult<()> {
        let bytes = serde_json::to_vec_pretty(summary)?;
        self.write_atomic(&self.run_dir.join(SUMMARY_FILE), &bytes)
    }

    pub fn read_summary(&self) -> ReviewResult<Option<RunSummary>> {
        read_summary_in(&self.run_dir)
    }

    /// Persist one phase checkpoint. Re-running a phase overwrites its
    /// checkpoint atomically.
    pub fn save(&self, checkpoint: &PhaseCheckpoint) -> ReviewResult<PathBuf> {
        let target = self.phase_path(&checkpoint.phase);
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        self.write_atomic(&target, &bytes)?;
        info!(phase = %checkpoint.phase, path = %target.display(), "saved checkpoint");
        Ok(target)
    }

    /// Load one phase checkpoint; `Ok(None)` when never written.
    pub fn load(&self, phase: &str) -> ReviewResult<Option<PhaseCheckpoint>> {
        let path = self.phase_path(phase);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let checkpoint: PhaseCheckpoint = serde_json::from_str(&content).map_err(|e| {
            ReviewError::DataCorrupt(format!("checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(checkpoint))
    }

    /// Names of all phases with a valid checkpoint in this run.
    pub fn checkpointed_phases(&self) -> Vec<String> {
        let mut phases = Vec::new();
        let entries = match std::fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(_) => return phases,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(phase) = name.strip_suffix(STATE_SUFFIX) {
                phases.push(phase.to_string());
            }
        }
        phases.sort();
        phases
    }

    /// Merge checkpoints for `phases` (in order) into one accumulated
    /// state; duplicate fields resolve last-writer-wins. Also returns the
    /// checkpoint of the last phase in the chain, which carries the
    /// authoritative PRISMA snapshot and topic context.
    pub fn load_chain(
        &self,
        phases: &[String],
    ) -> ReviewResult<(WorkflowState, Option<PhaseCheckpoint>)> {
        let mut state = WorkflowState::default();
        let mut latest = None;
        for phase in phases {
            match self.load(phase)? {
                Some(checkpoint) => {
                    state.apply(&checkpoint.data);
                    latest = Some(checkpoint);
                }
                None => {
                    debug!(phase = %phase, "no checkpoint in chain");
                }
            }
        }
        Ok((state, latest))
    }
}

fn read_summary_in(run_dir: &Path) -> ReviewResult<Option<RunSummary>> {
    let path = run_dir.join(SUMMARY_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let summary: RunSummary = serde_json::from_str(&content)
        .map_err(|e| ReviewError::DataCorrupt(format!("{}: {}", path.display(), e)))?;
    Ok(Some(summary))
}

/// Scan all runs under `run_root` for checkpoints whose topic matches
/// (normalized), and return the most complete candidate: highest number of
/// distinct checkpointed phases, ties broken by highest phase ordinal,
/// then most recent checkpoint mtime.
///
/// Unreadable files and foreign directories are skipped, not errors; this
/// is discovery, not loading.
pub fn find_by_topic(
    run_root: &Path,
    topic: &str,
    phase_ordinals: &BTreeMap<String, u32>,
) -> ReviewResult<Option<ResumeCandidate>> {
    if !run_root.is_dir() {
        return Ok(None);
    }
    let wanted = topic.trim().to_lowercase();
    let mut best: Option<(ResumeCandidate, std::time::SystemTime)> = None;

    for entry in std::fs::read_dir(run_root)?.flatten() {
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let mut checkpoints: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        let Ok(files) = std::fs::read_dir(&run_dir) else {
            continue;
        };
        for file in files.flatten() {
            let name = file.file_name().to_string_lossy().into_owned();
            if !name.ends_with(STATE_SUFFIX) {
                continue;
            }
            let mtime = file
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            checkpoints.push((file.path(), mtime));
        }
        if checkpoints.is_empty() {
            continue;
        }

        // Topic lives in every checkpoint envelope; read the most recent.
        checkpoints.sort_by_key(|(_, mtime)| *mtime);
        let Some((latest_path, latest_mtime)) = checkpoints.last().cloned() else {
            continue;
        };
        let Some(latest_cp) = read_checkpoint_lenient(&latest_path) else {
            continue;
        };
        if latest_cp.topic_context.normalized_topic() != wanted {
            continue;
        }

        let mut seen = BTreeMap::new();
        for (path, _) in &checkpoints {
            if let Some(cp) = read_checkpoint_lenient(path) {
                if let Some(ordinal) = phase_ordinals.get(&cp.phase) {
                    seen.insert(cp.phase.clone(), *ordinal);
                }
            }
        }
        if seen.is_empty() {
            continue;
        }
        let (latest_phase, latest_ordinal) = seen
            .iter()
            .max_by_key(|(_, ordinal)| **ordinal)
            .map(|(phase, ordinal)| (phase.clone(), *ordinal))
            .unwrap_or_default();
        let candidate = ResumeCandidate {
            run_id: latest_cp.run_id,
            run_dir: run_dir.clone(),
            completeness: seen.len(),
            latest_phase,
            latest_ordinal,
        };
        debug!(
            run_id = %candidate.run_id,
            completeness = candidate.completeness,
            latest = %candidate.latest_phase,
            "resume candidate"
        );

        let better = match &best {
            None => true,
            Some((current, current_mtime)) => {
                (candidate.completeness, candidate.latest_ordinal, latest_mtime)
                    > (current.completeness, current.latest_ordinal, *current_mtime)
            }
        };
        if better {
            best = Some((candidate, latest_mtime));
        }
    }
    Ok(best.map(|(candidate, _)| candidate))
}

fn read_checkpoint_lenient(path: &Path) -> Option<PhaseCheckpoint> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(cp) => Some(cp),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
            None
        }
    }
}

/// Scan run directories for a `run_summary.json` with the given run ID.
/// Used when the central registry row is missing.
pub fn find_summary_by_run_id(run_root: &Path, run_id: RunId) -> ReviewResult<Option<PathBuf>> {
    if !run_root.is_dir() {
        return Ok(None);
    }
    for entry in std::fs::read_dir(run_root)?.flatten() {
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        if let Ok(Some(summary)) = read_summary_in(&run_dir) {
            if summary.run_id == run_id {
                return Ok(Some(run_dir));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PaperRef;
    use crate::state::{PHASE_DEDUP, PHASE_SEARCH, PHASE_TA_SCREEN};

    fn topic_context(topic: &str) -> TopicContext {
        TopicContext {
            topic: topic.to_string(),
            ..TopicContext::default()
        }
    }

    fn checkpoint(run_id: RunId, phase: &str, topic: &str, data: PhasePayload) -> PhaseCheckpoint {
        PhaseCheckpoint {
            phase: phase.to_string(),
            run_id,
            timestamp: Utc::now(),
            dependencies: vec![],
            topic_context: topic_context(topic),
            data,
            prisma_counts: PrismaCounts::default(),
            database_breakdown: BTreeMap::new(),
        }
    }

    fn search_payload(n: usize) -> PhasePayload {
        let papers = (0..n)
            .map(|i| PaperRef {
                title: format!("Paper {}", i),
                abstract_text: None,
                authors: vec![],
                year: None,
                doi: Some(format!("10.1/p{}", i)),
                journal: None,
                url: None,
                source_db: "a".to_string(),
            })
            .collect();
        PhasePayload::Search {
            papers,
            database_breakdown: [("a".to_string(), n as u64)].into_iter().collect(),
        }
    }

    fn ordinals() -> BTreeMap<String, u32> {
        [
            (PHASE_SEARCH.to_string(), 1),
            (PHASE_DEDUP.to_string(), 2),
            (PHASE_TA_SCREEN.to_string(), 3),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = CheckpointStore::create(dir.path(), run_id).unwrap();
        let cp = checkpoint(run_id, PHASE_SEARCH, "T1", search_payload(2));
        store.save(&cp).unwrap();

        let loaded = store.load(PHASE_SEARCH).unwrap().unwrap();
        assert_eq!(loaded.phase, PHASE_SEARCH);
        assert_eq!(loaded.data, cp.data);
        assert!(store.load(PHASE_DEDUP).unwrap().is_none());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = CheckpointStore::create(dir.path(), run_id).unwrap();
        store
            .save(&checkpoint(run_id, PHASE_SEARCH, "T1", search_payload(1)))
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(store.run_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}{}", PHASE_SEARCH, STATE_SUFFIX)]);
    }

    #[test]
    fn load_chain_merges_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = CheckpointStore::create(dir.path(), run_id).unwrap();
        store
            .save(&checkpoint(run_id, PHASE_SEARCH, "T1", search_payload(3)))
            .unwrap();
        store
            .save(&checkpoint(
                run_id,
                PHASE_DEDUP,
                "T1",
                PhasePayload::Deduplication {
                    unique_papers: vec![],
                    duplicates_removed: 3,
                },
            ))
            .unwrap();

        let chain = vec![PHASE_SEARCH.to_string(), PHASE_DEDUP.to_string()];
        let (state, latest) = store.load_chain(&chain).unwrap();
        assert_eq!(state.papers.len(), 3);
        assert_eq!(state.duplicates_removed, 3);
        assert_eq!(state.completed_phases.len(), 2);
        assert_eq!(latest.unwrap().phase, PHASE_DEDUP);
    }

    #[test]
    fn corrupt_checkpoint_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = CheckpointStore::create(dir.path(), run_id).unwrap();
        std::fs::write(
            store.run_dir().join(format!("{}{}", PHASE_SEARCH, STATE_SUFFIX)),
            "{ not json",
        )
        .unwrap();
        let err = store.load(PHASE_SEARCH).unwrap_err();
        assert!(matches!(err, ReviewError::DataCorrupt(_)));
    }

    #[test]
    fn find_by_topic_picks_most_complete_run() {
        let dir = tempfile::tempdir().unwrap();

        let shallow = RunId::new();
        let store = CheckpointStore::create(dir.path(), shallow).unwrap();
        store
            .save(&checkpoint(shallow, PHASE_SEARCH, "T1", search_payload(1)))
            .unwrap();

        let deep = RunId::new();
        let store = CheckpointStore::create(dir.path(), deep).unwrap();
        store
            .save(&checkpoint(deep, PHASE_SEARCH, "T1", search_payload(1)))
            .unwrap();
        store
            .save(&checkpoint(
                deep,
                PHASE_DEDUP,
                "T1",
                PhasePayload::Deduplication {
                    unique_papers: vec![],
                    duplicates_removed: 0,
                },
            ))
            .unwrap();

        let other = RunId::new();
        let store = CheckpointStore::create(dir.path(), other).unwrap();
        store
            .save(&checkpoint(other, PHASE_SEARCH, "T2", search_payload(1)))
            .unwrap();

        let found = find_by_topic(dir.path(), "  t1 ", &ordinals())
            .unwrap()
            .unwrap();
        assert_eq!(found.run_id, deep);
        assert_eq!(found.completeness, 2);
        assert_eq!(found.latest_phase, PHASE_DEDUP);
    }

    #[test]
    fn find_by_topic_ignores_foreign_topics() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let store = CheckpointStore::create(dir.path(), run_id).unwrap();
        store
            .save(&checkpoint(run_id, PHASE_SEARCH, "T2", search_payload(1)))
            .unwrap();
        assert!(find_by_topic(dir.path(), "T1", &ordinals())
            .unwrap()
            .is_none());
    }
}
