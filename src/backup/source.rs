//! What to back up
//!
//! A [`SourceSelector`] tells the chain manager where a backup reads from.
//! Scheduled runs look it up through a [`ProjectDirectory`]; the settings
//! file is the directory used by the CLI.

use std::path::PathBuf;

use crate::artifact::dump::DatabaseTarget;
use crate::config::settings::{ProjectSource, Settings};
use crate::error::{VaultError, VaultResult};
use crate::models::{BackupKind, ProjectId};

/// Source of one backup
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSelector {
    /// Project file tree with its exclude globs
    Files { root: PathBuf, exclude: Vec<String> },
    Database(DatabaseTarget),
}

impl SourceSelector {
    pub fn kind(&self) -> BackupKind {
        match self {
            Self::Files { .. } => BackupKind::File,
            Self::Database(_) => BackupKind::Database,
        }
    }
}

/// Resolves a project and kind to its backup source
pub trait ProjectDirectory: Send + Sync {
    fn resolve(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<SourceSelector>;
}

/// Concatenate exclude lists, dropping blanks and repeats, first one wins
pub fn merge_excludes(layers: &[&[String]]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for pattern in layers.iter().flat_map(|layer| layer.iter()) {
        let pattern = pattern.trim();
        if !pattern.is_empty() && !merged.iter().any(|p| p == pattern) {
            merged.push(pattern.to_string());
        }
    }
    merged
}

/// Project directory backed by the `projects` list in settings
pub struct SettingsDirectory {
    projects: Vec<ProjectSource>,
    default_excludes: Vec<String>,
}

impl SettingsDirectory {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            projects: settings.projects.clone(),
            default_excludes: settings.default_excludes.clone(),
        }
    }
}

impl ProjectDirectory for SettingsDirectory {
    fn resolve(&self, project_id: ProjectId, kind: BackupKind) -> VaultResult<SourceSelector> {
        let project = self
            .projects
            .iter()
            .find(|p| p.project_id == project_id)
            .ok_or_else(|| VaultError::project_not_found(project_id.to_string()))?;

        match kind {
            BackupKind::File => {
                let root = project.source_path.clone().ok_or_else(|| {
                    VaultError::Validation(format!("project {} has no source_path", project_id))
                })?;
                Ok(SourceSelector::Files {
                    root,
                    exclude: merge_excludes(&[&self.default_excludes, &project.excludes]),
                })
            }
            BackupKind::Database => project
                .database
                .clone()
                .map(SourceSelector::Database)
                .ok_or_else(|| {
                    VaultError::Validation(format!("project {} has no database configured", project_id))
                }),
        }
    }
}
