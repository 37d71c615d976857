use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::memory::Memory;
use crate::projects::Projects;
use crate::scheduler::jobs::CronJobs;
use crate::store::{timestamp, JsonFile};
use crate::tasks::Tasks;

/// Conversation key to agent session id.
pub type SessionMap = BTreeMap<String, String>;

/// Which chat surface a session file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Telegram,
    Tui,
}

impl Surface {
    fn file_name(self) -> &'static str {
        match self {
            Surface::Telegram => "sessions.json",
            Surface::Tui => "sessions_tui.json",
        }
    }
}

/// The on-disk layout under the workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn new(path: PathBuf) -> Result<Self> {
        let workspace = Self { path };
        for dir in [
            workspace.data_dir(),
            workspace.logs_dir(),
            workspace.projects_dir(),
            workspace.inbox_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir().join("projects")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir().join("journal")
    }

    /// Where chat surfaces drop downloaded attachments.
    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir().join("inbox")
    }

    pub fn cron_jobs(&self) -> CronJobs {
        CronJobs::new(JsonFile::new(self.data_dir().join("cron.json")))
    }

    pub fn tasks(&self) -> Tasks {
        Tasks::new(JsonFile::new(self.data_dir().join("tasks.json")))
    }

    pub fn projects(&self) -> Projects {
        Projects::new(
            JsonFile::new(self.data_dir().join("projects.json")),
            self.projects_dir(),
        )
    }

    pub fn memory(&self) -> Memory {
        Memory::new(JsonFile::new(self.data_dir().join("memory.json")))
    }

    pub fn sessions(&self, surface: Surface) -> JsonFile<SessionMap> {
        JsonFile::new(self.data_dir().join(surface.file_name()))
    }

    /// Appends one line to today's activity log. Failures are only traced;
    /// the activity log never stops the caller.
    pub fn log_line(&self, text: &str) {
        let now = timestamp::now();
        let path = self
            .logs_dir()
            .join(format!("{}.log", now.date().format("%Y-%m-%d")));
        let line = format!("[{}] {}\n", timestamp::format(&now), text);
        let result = std::fs::create_dir_all(self.logs_dir()).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?
                .write_all(line.as_bytes())
        });
        if let Err(e) = result {
            warn!(path = %path.display(), "Failed to write activity log: {}", e);
        }
    }

    /// Deletes `YYYY-MM-DD.log` files dated before `today - retention_days`.
    /// Files whose names are not dates are left alone.
    pub fn cleanup_logs(&self, retention_days: i64, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(retention_days);
        let entries = match std::fs::read_dir(self.logs_dir()) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No log directory to clean: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(date) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if date >= cutoff {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to remove old log: {}", e),
            }
        }
        if removed > 0 {
            info!("Removed {} old log file(s)", removed);
        }
        removed
    }

    /// Appends a timestamped markdown section to today's journal.
    pub fn journal_append(&self, text: &str) -> Result<PathBuf> {
        let now = timestamp::now();
        let dir = self.journal_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.md", now.date().format("%Y-%m-%d")));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        write!(file, "\n\n## {}\n\n{}\n", timestamp::format(&now), text)?;
        Ok(path)
    }
}
