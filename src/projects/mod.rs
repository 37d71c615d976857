use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

use crate::store::{timestamp, JsonFile, Record, Records};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    /// Unknown keys, plus timestamp values that did not parse.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(
        default,
        with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created: Option<NaiveDateTime>,
}

impl Record for Project {
    const TIMESTAMPS: &'static [&'static str] = &["created"];

    fn extra_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.extra
    }
}

/// Lowercase, spaces to dashes, everything but letters, digits and dashes
/// dropped. Falls back to `project` when nothing is left.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug.to_string()
    }
}

/// CRUD over `projects.json`. Each project also owns a markdown notes file.
#[derive(Debug, Clone)]
pub struct Projects {
    file: JsonFile<Records<Project>>,
    notes_dir: PathBuf,
}

impl Projects {
    pub fn new(file: JsonFile<Records<Project>>, notes_dir: impl Into<PathBuf>) -> Self {
        Self {
            file,
            notes_dir: notes_dir.into(),
        }
    }

    pub fn list(&self) -> Vec<Project> {
        self.file.load().into_vec()
    }

    pub fn add(&self, name: &str) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("Project name must not be empty"));
        }
        let notes_dir = self.notes_dir.clone();
        let project = self.file.update(|projects| -> Result<Project> {
            let base = slugify(name);
            let id = if projects.iter().any(|p| p.id == base) {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{}-{}", base, &suffix[..8])
            } else {
                base
            };

            std::fs::create_dir_all(&notes_dir)
                .with_context(|| format!("Failed to create {}", notes_dir.display()))?;
            let notes = notes_dir.join(format!("{}.md", id));
            if !notes.exists() {
                std::fs::write(&notes, format!("# {}\n\n", name))
                    .with_context(|| format!("Failed to write {}", notes.display()))?;
            }

            let project = Project {
                id,
                name: name.to_string(),
                status: "active".to_string(),
                file: Some(notes.display().to_string()),
                created: Some(timestamp::now()),
                extra: Map::new(),
            };
            projects.push(project.clone());
            Ok(project)
        })??;
        Ok(project)
    }

    pub fn update(&self, id: &str, name: Option<&str>, status: Option<&str>) -> Result<()> {
        let found = self.file.update_if_changed(|projects| {
            let Some(project) = projects.iter_mut().find(|p| p.id == id) else {
                return (false, false);
            };
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                project.name = name.to_string();
            }
            if let Some(status) = status.filter(|s| !s.trim().is_empty()) {
                project.status = status.to_string();
            }
            (true, true)
        })?;
        if !found {
            return Err(anyhow!("Project not found: {}", id));
        }
        Ok(())
    }

    pub fn archive(&self, id: &str) -> Result<()> {
        self.update(id, None, Some("archived"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(slugify("Home Renovation"), "home-renovation");
        assert_eq!(slugify("  Q3 plan!  "), "q3-plan");
        assert_eq!(slugify("Café Ideas"), "café-ideas");
        assert_eq!(slugify("???"), "project");
    }

    #[test]
    fn add_creates_notes_and_suffixes_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let projects = Projects::new(
            JsonFile::new(dir.path().join("projects.json")),
            dir.path().join("projects"),
        );

        let first = projects.add("Garden").unwrap();
        assert_eq!(first.id, "garden");
        assert_eq!(first.status, "active");
        let notes = std::fs::read_to_string(dir.path().join("projects/garden.md")).unwrap();
        assert_eq!(notes, "# Garden\n\n");

        let second = projects.add("garden").unwrap();
        assert!(second.id.starts_with("garden-"));
        assert_eq!(second.id.len(), "garden-".len() + 8);
        assert_eq!(projects.list().len(), 2);
    }

    #[test]
    fn archive_sets_status() {
        let dir = tempfile::tempdir().unwrap();
        let projects = Projects::new(
            JsonFile::new(dir.path().join("projects.json")),
            dir.path().join("projects"),
        );
        let p = projects.add("Taxes").unwrap();
        projects.archive(&p.id).unwrap();
        assert_eq!(projects.list()[0].status, "archived");
        assert!(projects.archive("nope").is_err());
    }
}
