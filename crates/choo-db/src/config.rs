use std::env;
use std::path::{Path, PathBuf};

/// Journal storage configuration.
///
/// Reads from the `CHOO_DATABASE_URL` environment variable (a `sqlite:` URL
/// or bare filesystem path), falling back to `~/.choo/journal.db` when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `sqlite:` connection URL, or a bare path to the database file.
    pub database_url: String,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `CHOO_DATABASE_URL` env var, then the default journal path
    /// under the user's home directory.
    pub fn from_env() -> Self {
        let database_url = env::var("CHOO_DATABASE_URL").unwrap_or_else(|_| {
            let path = default_journal_path();
            format!("sqlite:{}", path.display())
        });
        Self { database_url }
    }

    /// Build a config from an explicit URL or path (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// The filesystem path backing this database, if the URL is a `sqlite:`
    /// URL or a bare path. Returns `None` for `sqlite::memory:`.
    pub fn file_path(&self) -> Option<PathBuf> {
        let trimmed = self
            .database_url
            .strip_prefix("sqlite:")
            .unwrap_or(&self.database_url);
        if trimmed == ":memory:" {
            return None;
        }
        Some(PathBuf::from(trimmed))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Default journal location: `~/.choo/journal.db`.
pub fn default_journal_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".choo")
        .join("journal.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_roundtrips() {
        let cfg = DbConfig::new("sqlite:/tmp/choo-test/journal.db");
        assert_eq!(
            cfg.file_path(),
            Some(PathBuf::from("/tmp/choo-test/journal.db"))
        );
    }

    #[test]
    fn in_memory_has_no_file_path() {
        let cfg = DbConfig::new("sqlite::memory:");
        assert_eq!(cfg.file_path(), None);
    }

    #[test]
    fn bare_path_without_scheme() {
        let cfg = DbConfig::new("/tmp/choo-test/other.db");
        assert_eq!(
            cfg.file_path(),
            Some(PathBuf::from("/tmp/choo-test/other.db"))
        );
    }
}
