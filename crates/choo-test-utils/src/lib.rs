//! Shared test fixtures for choo's integration tests.
//!
//! Two kinds of throwaway state come up repeatedly: a journal database and
//! a git repository to orchestrate against. SQLite needs no server, so
//! unlike a Postgres-backed fixture this is file-based rather than
//! container-based -- each test gets its own file under a `tempfile::TempDir`
//! that is deleted when the guard drops.

use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::SqlitePool;
use tempfile::TempDir;

use choo_db::config::DbConfig;
use choo_db::pool::{create_pool, default_migrations_path, run_migrations};

/// A temporary journal database. Keeps the backing `TempDir` alive for as
/// long as the pool is in use.
pub struct TestJournal {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a temporary SQLite journal with migrations applied.
pub async fn create_test_journal() -> TestJournal {
    let dir = TempDir::new().expect("failed to create temp dir for journal");
    let db_path = dir.path().join("journal.db");
    let config = DbConfig::new(format!("sqlite:{}", db_path.display()));

    let pool = create_pool(&config)
        .await
        .expect("failed to create journal pool");
    run_migrations(&pool, default_migrations_path())
        .await
        .expect("failed to run journal migrations");

    TestJournal { pool, _dir: dir }
}

/// A temporary git repository with an initial commit on `main`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Initialize a throwaway git repository: `git init`, identity config, one
/// commit on `main` so there is a HEAD to branch and worktree from.
pub fn init_test_repo() -> TestRepo {
    let dir = TempDir::new().expect("failed to create temp dir for repo");
    let path = dir.path();

    run_git(path, &["init", "--initial-branch=main"]);
    run_git(path, &["config", "user.name", "choo-test"]);
    run_git(path, &["config", "user.email", "test@choo.dev"]);

    std::fs::write(path.join("README.md"), "# test repo\n").expect("failed to write README");
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", "initial commit"]);

    TestRepo { dir }
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Write a unit directory under `tasks_dir` with an `IMPLEMENTATION_PLAN.md`
/// and the given task bodies (already including frontmatter), named
/// `01-*.md`, `02-*.md`, ... in the order given.
pub fn write_unit(
    tasks_dir: &Path,
    unit_id: &str,
    plan_frontmatter: &str,
    tasks: &[(&str, &str)],
) -> PathBuf {
    let unit_dir = tasks_dir.join(unit_id);
    std::fs::create_dir_all(&unit_dir).expect("failed to create unit dir");
    std::fs::write(
        unit_dir.join("IMPLEMENTATION_PLAN.md"),
        format!("{plan_frontmatter}\n\n# {unit_id}\n"),
    )
    .expect("failed to write IMPLEMENTATION_PLAN.md");

    for (name, content) in tasks {
        std::fs::write(unit_dir.join(name), content).expect("failed to write task file");
    }

    unit_dir
}
