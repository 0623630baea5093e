
use crate::case::{Case, CaseStatus, Job, Outputs, Variables};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// written last, a case directory without it is never a result
pub const MANIFEST: &str = "manifest.yaml";
const MANIFEST_TMP: &str = ".manifest.yaml.tmp";
/// per attempt scratch directories live below this directory of the results root
pub const WORK_DIR: &str = ".work";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access result files")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize manifest")]
    Manifest(#[from] serde_yaml::Error),
    #[error("Invalid cache glob")]
    Glob(#[from] globset::Error),
    #[error("Failed to walk result directories")]
    Walk(#[from] ignore::Error),
}

/// How case directories below the results root are named
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaseNaming {
    #[default]
    Index,
    Fingerprint,
}

/// Persisted form of a finished case
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub index: usize,
    pub fingerprint: String,
    pub variables: Variables,
    pub outputs: Outputs,
    pub artifacts_dir: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub calculator: String,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub outcome: String,
}

impl From<&Job> for AttemptRecord {
    fn from(job: &Job) -> Self {
        Self {
            attempt: job.attempt,
            calculator: job.calculator.to_string(),
            started_at: job.started_at,
            ended_at: job.ended_at,
            outcome: job.result.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Manifest {
    pub status: CaseStatus,
    #[serde(flatten)]
    pub record: ResultRecord,
    /// case directory a cached result was copied from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

/// On-disk store for per-case artifacts and manifests
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
    naming: CaseNaming,
    /// fingerprint -> index of the first case that claimed its directory
    owners: Arc<Mutex<HashMap<String, usize>>>,
}

impl ResultStore {
    pub fn open(root: impl Into<PathBuf>, naming: CaseNaming) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            naming,
            owners: Arc::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the case directory. Under fingerprint naming a design point evaluated again by
    /// a later case keeps the first case's directory, the later one gets its index appended.
    pub fn case_id(&self, case: &Case) -> String {
        match self.naming {
            CaseNaming::Index => case.index.to_string(),
            CaseNaming::Fingerprint => {
                let owner = *self
                    .owners
                    .lock()
                    .entry(case.fingerprint.clone())
                    .or_insert(case.index);

                if owner == case.index {
                    case.fingerprint.clone()
                } else {
                    format!("{}-{}", case.fingerprint, case.index)
                }
            }
        }
    }

    /// Reserve case directories in the given order, the first of repeated design points keeps
    /// the plain fingerprint whichever finishes first
    pub fn claim<'a>(&self, cases: impl IntoIterator<Item = &'a Case>) {
        if self.naming != CaseNaming::Fingerprint {
            return;
        }

        let mut owners = self.owners.lock();
        for case in cases {
            owners.entry(case.fingerprint.clone()).or_insert(case.index);
        }
    }

    pub fn case_dir(&self, case: &Case) -> PathBuf {
        self.root.join(self.case_id(case))
    }

    pub fn attempt_path(&self, case: &Case, attempt: usize) -> PathBuf {
        self.root
            .join(WORK_DIR)
            .join(format!("{}-{}.attempt{attempt}", case.index, case.fingerprint))
    }

    /// Fresh, empty directory exclusive to one attempt of a case
    pub fn attempt_dir(&self, case: &Case, attempt: usize) -> Result<PathBuf, StoreError> {
        let dir = self.attempt_path(case, attempt);

        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        Ok(dir)
    }

    /// Copy cached artifacts into a scratch directory of `case`. Hits are staged before any of
    /// them is persisted, the source may be a case directory that persisting replaces.
    pub fn stage(&self, case: &Case, from: &Path) -> Result<PathBuf, StoreError> {
        let dir = self
            .root
            .join(WORK_DIR)
            .join(format!("{}-{}.cached", case.index, case.fingerprint));

        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        copy_tree(from, &dir)?;

        for stale in [MANIFEST, MANIFEST_TMP] {
            let stale = dir.join(stale);
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }
        trace!(case = case.index, from = ?from, dir = ?dir, "Staged cached artifacts");

        Ok(dir)
    }

    /// Move (or copy, for foreign directories) the artifacts into the case directory and commit
    /// the manifest last.
    pub fn persist(
        &self,
        case: &Case,
        artifacts: Option<&Path>,
        source: Option<&Path>,
    ) -> Result<ResultRecord, StoreError> {
        let dir = self.case_dir(case);
        let in_place = artifacts.map_or(false, |artifacts| same_dir(artifacts, &dir));

        if dir.exists() && !in_place {
            debug!(dir = ?dir, "Replacing previous case directory");
            fs::remove_dir_all(&dir)?;
        }

        match artifacts {
            Some(_) if in_place => {}
            Some(artifacts) if artifacts.starts_with(self.root.join(WORK_DIR)) => {
                fs::rename(artifacts, &dir)?;
            }
            Some(artifacts) => {
                fs::create_dir_all(&dir)?;
                copy_tree(artifacts, &dir)?;
                // the copied manifest belongs to the source
                let stale = dir.join(MANIFEST);
                if stale.exists() {
                    fs::remove_file(stale)?;
                }
            }
            None => fs::create_dir_all(&dir)?,
        }

        let record = ResultRecord {
            index: case.index,
            fingerprint: case.fingerprint.clone(),
            variables: case.variables().clone(),
            outputs: case.outputs.clone(),
            artifacts_dir: dir.clone(),
        };
        let manifest = Manifest {
            status: case.status,
            record: record.clone(),
            source: source.map(Path::to_path_buf),
            attempts: case.attempts.iter().map(AttemptRecord::from).collect(),
        };

        write_manifest(&dir, &manifest)?;
        info!(case = case.index, status = ?case.status, dir = ?dir, "Persisted case");

        Ok(record)
    }

    /// remove leftover attempt directories
    pub fn cleanup(&self) -> Result<(), StoreError> {
        let work = self.root.join(WORK_DIR);

        if work.exists() {
            fs::remove_dir_all(work)?;
        }

        Ok(())
    }
}

/// Find a succeeded result for `fingerprint` in the case directories matching `pattern`.
///
/// A directory matches if it or its parent matches the glob, so a pattern may name case
/// directories directly or whole results roots. Failed or half written cases never match.
pub fn lookup(pattern: &str, fingerprint: &str) -> Result<Option<ResultRecord>, StoreError> {
    let matcher = compile_pattern(pattern)?;
    let base = literal_prefix(pattern);

    if !base.exists() {
        trace!(base = ?base, "Cache base does not exist");
        return Ok(None);
    }

    let walker = WalkBuilder::new(&base)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| entry.file_name() != WORK_DIR)
        .build();

    for entry in walker {
        let entry = entry?;

        if entry.file_name() != MANIFEST {
            continue;
        }

        let Some(dir) = entry.path().parent() else {
            continue;
        };

        if !matches(&matcher, dir) {
            continue;
        }

        match read_manifest(dir) {
            Ok(manifest) if manifest.status.is_success() => {
                if manifest.record.fingerprint == fingerprint {
                    debug!(dir = ?dir, fingerprint = fingerprint, "Cache hit");

                    return Ok(Some(ResultRecord {
                        artifacts_dir: dir.to_path_buf(),
                        ..manifest.record
                    }));
                }
            }
            Ok(manifest) => {
                trace!(dir = ?dir, status = ?manifest.status, "Skipped unsuccessful result");
            }
            Err(error) => {
                warn!(dir = ?dir, error = %error, "Skipped unreadable manifest");
            }
        }
    }

    Ok(None)
}

pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher, StoreError> {
    Ok(GlobBuilder::new(strip_current(Path::new(pattern)).to_string_lossy().as_ref())
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

fn matches(matcher: &GlobMatcher, dir: &Path) -> bool {
    let dir = strip_current(dir);

    matcher.is_match(&dir) || dir.parent().map_or(false, |parent| matcher.is_match(parent))
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn strip_current(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

/// leading path components without glob meta characters
fn literal_prefix(pattern: &str) -> PathBuf {
    let prefix: PathBuf = Path::new(pattern)
        .components()
        .take_while(|component| {
            !component
                .as_os_str()
                .to_string_lossy()
                .contains(['*', '?', '[', '{'])
        })
        .collect();

    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

pub fn read_manifest(dir: &Path) -> Result<Manifest, StoreError> {
    let content = fs::read_to_string(dir.join(MANIFEST))?;

    Ok(serde_yaml::from_str(&content)?)
}

/// write to a temporary file first, the rename makes the manifest appear atomically
fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let tmp = dir.join(MANIFEST_TMP);

    fs::write(&tmp, serde_yaml::to_string(manifest)?)?;
    fs::rename(&tmp, dir.join(MANIFEST))?;

    Ok(())
}

/// recursively copy all files below `from` into `to`
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), StoreError> {
    for entry in WalkBuilder::new(from).standard_filters(false).build() {
        let entry: DirEntry = entry?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };

        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = to.join(relative);

        if entry.file_type().map_or(false, |kind| kind.is_dir()) {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}
