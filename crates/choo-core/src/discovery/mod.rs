//! Discovery: walks a tasks directory, parses each unit's plan file and
//! task files, and validates the whole set before any worker is spawned.
//!
//! Discovery is fatal to a run: `discover()` returns every validation
//! failure it finds rather than stopping at the first one, so the operator
//! sees the whole picture in one pass.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// A task file discovered within a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTask {
    pub number: u32,
    pub status: String,
    pub backpressure: String,
    pub depends_on: Vec<u32>,
    pub title: String,
    pub content: String,
}

/// A unit directory discovered under the tasks directory.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUnit {
    pub unit_id: String,
    pub path: PathBuf,
    pub depends_on: Vec<String>,
    pub provider: Option<String>,
    pub orch_status: Option<String>,
    pub orch_branch: Option<String>,
    pub orch_worktree: Option<String>,
    pub orch_pr_number: Option<i64>,
    pub orch_started_at: Option<DateTime<Utc>>,
    pub orch_completed_at: Option<DateTime<Utc>>,
    pub tasks: Vec<DiscoveredTask>,
}

/// One validation failure. Discovery aggregates these rather than failing
/// on the first one so the operator sees the whole picture in one pass.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DiscoveryError {
    #[error("{unit}: missing IMPLEMENTATION_PLAN.md")]
    MissingPlanFile { unit: String },

    #[error("{unit}: missing metadata block (no frontmatter or ## Metadata section)")]
    MissingMetadata { unit: String },

    #[error("{unit}: 'unit' field is empty")]
    EmptyUnitId { unit: String },

    #[error("{file}: invalid YAML metadata: {detail}")]
    InvalidYaml { file: String, detail: String },

    #[error("{file}: missing required 'task' field")]
    MissingTaskNumber { file: String },

    #[error("{file}: task {task} has empty backpressure command")]
    EmptyBackpressure { file: String, task: u32 },

    #[error("{file}: invalid status {status:?} (expected pending, in_progress, complete, or failed)")]
    InvalidTaskStatus { file: String, status: String },

    #[error("unit {unit}: duplicate task number {number}")]
    DuplicateTaskNumber { unit: String, number: u32 },

    #[error("unit {unit}: task numbers must be contiguous starting at 1, found {found:?}")]
    NonContiguousTaskNumbers { unit: String, found: Vec<u32> },

    #[error("unit {unit}: task {task} depends_on references unknown task number {dependency}")]
    UnknownTaskDependency { unit: String, task: u32, dependency: u32 },
}

#[derive(Debug, Deserialize, Default)]
struct UnitFrontmatter {
    unit: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
    provider: Option<String>,
    orch_status: Option<String>,
    orch_branch: Option<String>,
    orch_worktree: Option<String>,
    orch_pr_number: Option<i64>,
    orch_started_at: Option<DateTime<Utc>>,
    orch_completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
struct TaskFrontmatter {
    task: Option<u32>,
    #[serde(default)]
    status: Option<String>,
    backpressure: Option<String>,
    #[serde(default)]
    depends_on: Vec<u32>,
}

/// Walk `tasks_dir`, parse every conforming unit, and validate the whole
/// set. Non-conforming directories (no `IMPLEMENTATION_PLAN.md`) are
/// silently skipped rather than reported as errors.
pub fn discover(tasks_dir: &Path) -> Result<Vec<DiscoveredUnit>, Vec<DiscoveryError>> {
    let mut errors = Vec::new();
    let mut units = Vec::new();

    let entries = match fs::read_dir(tasks_dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(DiscoveryError::MissingPlanFile {
                unit: format!("<{}>: {e}", tasks_dir.display()),
            });
            return Err(errors);
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let plan_path = dir.join("IMPLEMENTATION_PLAN.md");
        if !plan_path.exists() {
            continue;
        }
        match discover_unit(&dir, &plan_path) {
            Ok(Some(unit)) => units.push(unit),
            Ok(None) => {}
            Err(mut unit_errors) => errors.append(&mut unit_errors),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    validate_cross_references(&units, &mut errors);
    if errors.is_empty() {
        Ok(units)
    } else {
        Err(errors)
    }
}

/// Returns `Ok(None)` for a directory with a plan file but no task files --
/// §4.1 step 3 skips these silently rather than discovering a zero-task
/// unit (§8's "unit with zero tasks -> skipped silently" boundary case).
fn discover_unit(dir: &Path, plan_path: &Path) -> Result<Option<DiscoveredUnit>, Vec<DiscoveryError>> {
    let unit_label = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    // §4.1 step 3: skip (not error) a directory with a plan file but no
    // matching task file, before metadata is even parsed.
    let task_filename = Regex::new(r"^(\d{2})-.+\.md$").unwrap();
    let mut task_files: Vec<(u32, PathBuf)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(caps) = task_filename.captures(name) {
                let number: u32 = caps[1].parse().unwrap();
                task_files.push((number, path));
            }
        }
    }
    task_files.sort_by_key(|(n, _)| *n);

    if task_files.is_empty() {
        return Ok(None);
    }

    let mut errors = Vec::new();

    let content = match fs::read_to_string(plan_path) {
        Ok(c) => c,
        Err(e) => {
            errors.push(DiscoveryError::MissingPlanFile {
                unit: format!("{unit_label}: {e}"),
            });
            return Err(errors);
        }
    };

    let yaml = match extract_metadata_block(&content) {
        Some(y) => y,
        None => {
            errors.push(DiscoveryError::MissingMetadata { unit: unit_label });
            return Err(errors);
        }
    };

    let meta: UnitFrontmatter = match serde_yaml::from_str(&yaml) {
        Ok(m) => m,
        Err(e) => {
            errors.push(DiscoveryError::InvalidYaml {
                file: plan_path.display().to_string(),
                detail: e.to_string(),
            });
            return Err(errors);
        }
    };

    let unit_id = match meta.unit.map(|s| s.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => {
            errors.push(DiscoveryError::EmptyUnitId { unit: unit_label });
            return Err(errors);
        }
    };

    let orch_status = meta.orch_status.map(|s| coerce_legacy_status(&s));

    let mut tasks = Vec::new();
    let mut seen_numbers = HashSet::new();
    for (_, path) in &task_files {
        match parse_task_file(path) {
            Ok(task) => {
                if !seen_numbers.insert(task.number) {
                    errors.push(DiscoveryError::DuplicateTaskNumber {
                        unit: unit_id.clone(),
                        number: task.number,
                    });
                }
                tasks.push(task);
            }
            Err(mut task_errors) => errors.append(&mut task_errors),
        }
    }
    tasks.sort_by_key(|t| t.number);

    if !errors.is_empty() {
        return Err(errors);
    }

    let numbers: Vec<u32> = tasks.iter().map(|t| t.number).collect();
    let contiguous = numbers.iter().enumerate().all(|(i, n)| *n == (i as u32) + 1);
    if !numbers.is_empty() && !contiguous {
        errors.push(DiscoveryError::NonContiguousTaskNumbers {
            unit: unit_id.clone(),
            found: numbers,
        });
        return Err(errors);
    }

    Ok(Some(DiscoveredUnit {
        unit_id,
        path: dir.to_path_buf(),
        depends_on: meta.depends_on,
        provider: meta.provider,
        orch_status,
        orch_branch: meta.orch_branch,
        orch_worktree: meta.orch_worktree,
        orch_pr_number: meta.orch_pr_number,
        orch_started_at: meta.orch_started_at,
        orch_completed_at: meta.orch_completed_at,
        tasks,
    }))
}

fn parse_task_file(path: &Path) -> Result<DiscoveredTask, Vec<DiscoveryError>> {
    let mut errors = Vec::new();
    let file_label = path.display().to_string();

    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            errors.push(DiscoveryError::MissingTaskNumber {
                file: format!("{file_label}: {e}"),
            });
            return Err(errors);
        }
    };

    let yaml = match extract_metadata_block(&content) {
        Some(y) => y,
        None => {
            errors.push(DiscoveryError::MissingTaskNumber { file: file_label });
            return Err(errors);
        }
    };

    let meta: TaskFrontmatter = match serde_yaml::from_str(&yaml) {
        Ok(m) => m,
        Err(e) => {
            errors.push(DiscoveryError::InvalidYaml {
                file: file_label,
                detail: e.to_string(),
            });
            return Err(errors);
        }
    };

    let number = match meta.task {
        Some(n) if n >= 1 => n,
        _ => {
            errors.push(DiscoveryError::MissingTaskNumber { file: file_label });
            return Err(errors);
        }
    };

    let status = meta.status.unwrap_or_default();
    let status = if status.trim().is_empty() {
        "pending".to_string()
    } else {
        status
    };
    if !matches!(status.as_str(), "pending" | "in_progress" | "complete" | "failed") {
        errors.push(DiscoveryError::InvalidTaskStatus {
            file: file_label,
            status,
        });
        return Err(errors);
    }

    let backpressure = meta.backpressure.unwrap_or_default();
    if backpressure.trim().is_empty() {
        errors.push(DiscoveryError::EmptyBackpressure {
            file: file_label,
            task: number,
        });
        return Err(errors);
    }

    let title = content
        .lines()
        .find(|l| l.trim_start().starts_with("# "))
        .map(|l| l.trim_start().trim_start_matches('#').trim().to_string())
        .unwrap_or_default();

    Ok(DiscoveredTask {
        number,
        status,
        backpressure,
        depends_on: meta.depends_on,
        title,
        content,
    })
}

/// Extract the YAML metadata block, preferring leading frontmatter over a
/// `## Metadata` section when both are present.
fn extract_metadata_block(content: &str) -> Option<String> {
    if let Some(stripped) = content.strip_prefix("---\n") {
        if let Some(end) = stripped.find("\n---") {
            return Some(stripped[..end].to_string());
        }
    }

    if let Some(idx) = content.find("## Metadata") {
        let rest = &content[idx..];
        for fence in ["```yaml", "```yml"] {
            if let Some(start) = rest.find(fence) {
                let after_fence = &rest[start + fence.len()..];
                if let Some(end) = after_fence.find("```") {
                    return Some(after_fence[..end].to_string());
                }
            }
        }
    }

    None
}

/// Old on-disk status of `pr_open | in_review | merging` is coerced to
/// `in_progress` on read (legacy migration); every other value passes
/// through unchanged.
fn coerce_legacy_status(status: &str) -> String {
    match status {
        "pr_open" | "in_review" | "merging" => "in_progress".to_string(),
        other => other.to_string(),
    }
}

fn validate_cross_references(units: &[DiscoveredUnit], errors: &mut Vec<DiscoveryError>) {
    let known_units: HashSet<&str> = units.iter().map(|u| u.unit_id.as_str()).collect();
    for unit in units {
        for dep in &unit.depends_on {
            if !known_units.contains(dep.as_str()) {
                // Unknown unit deps are tolerated: corpora are often partial
                // (a dependency tracked outside this run), so this is logged
                // and otherwise ignored rather than failing discovery.
                warn!(
                    unit = unit.unit_id.as_str(),
                    dependency = dep.as_str(),
                    "depends_on references a unit not found in this run"
                );
            }
        }

        let known_tasks: HashSet<u32> = unit.tasks.iter().map(|t| t.number).collect();
        for task in &unit.tasks {
            for dep in &task.depends_on {
                if !known_tasks.contains(dep) {
                    errors.push(DiscoveryError::UnknownTaskDependency {
                        unit: unit.unit_id.clone(),
                        task: task.number,
                        dependency: *dep,
                    });
                }
            }
        }
    }
}
