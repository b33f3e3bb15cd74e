//! Project CLI commands
//!
//! Projects tell chainvault what to back up: a source directory, a database,
//! or both. They live in the settings file.

use std::path::PathBuf;

use clap::Subcommand;

use crate::artifact::dump::{DatabaseEngine, DatabaseTarget};
use crate::config::paths::VaultPaths;
use crate::config::settings::{ProjectSource, Settings};
use crate::error::{VaultError, VaultResult};
use crate::models::ProjectId;

/// Project subcommands
#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a project
    Add {
        /// Project name
        name: String,
        /// Root of the project's files
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Database name (or file path for sqlite)
        #[arg(short, long)]
        database: Option<String>,
        /// Database engine (mysql, postgres, sqlite)
        #[arg(short, long, default_value = "mysql")]
        engine: String,
        /// Database host
        #[arg(long)]
        host: Option<String>,
        /// Database port
        #[arg(long)]
        port: Option<u16>,
        /// Database user
        #[arg(short, long)]
        user: Option<String>,
        /// Database password
        #[arg(long, env = "CHAINVAULT_DB_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Extra exclude glob (repeatable)
        #[arg(short = 'x', long = "exclude")]
        excludes: Vec<String>,
    },
    /// List registered projects
    List,
}

/// Handle a project command
pub fn handle_project_command(
    paths: &VaultPaths,
    settings: &mut Settings,
    cmd: ProjectCommands,
) -> VaultResult<()> {
    match cmd {
        ProjectCommands::Add {
            name,
            path,
            database,
            engine,
            host,
            port,
            user,
            password,
            excludes,
        } => {
            if path.is_none() && database.is_none() {
                return Err(VaultError::Validation(
                    "a project needs --path, --database, or both".into(),
                ));
            }
            if settings
                .projects
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&name))
            {
                return Err(VaultError::Duplicate {
                    entity_type: "Project",
                    identifier: name,
                });
            }

            let database = match database {
                Some(db) => {
                    let engine: DatabaseEngine = engine.parse()?;
                    let mut target = DatabaseTarget::new(engine, db);
                    target.host = host;
                    target.port = port;
                    target.username = user;
                    target.password = password;
                    Some(target)
                }
                None => None,
            };

            let project = ProjectSource {
                project_id: ProjectId::new(),
                name,
                source_path: path,
                excludes,
                database,
            };
            println!("Added project: {} ({})", project.name, project.project_id);
            settings.projects.push(project);
            settings.save(paths)?;
        }

        ProjectCommands::List => {
            if settings.projects.is_empty() {
                println!("No projects registered.");
                println!("Add one with: chainvault project add <name> --path <dir>");
                return Ok(());
            }

            for project in &settings.projects {
                println!("{}  {}", project.project_id.short(), project.name);
                if let Some(path) = &project.source_path {
                    println!("    files:    {}", path.display());
                }
                if let Some(db) = &project.database {
                    println!("    database: {} ({})", db.database, db.engine);
                }
                if !project.excludes.is_empty() {
                    println!("    excludes: {}", project.excludes.join(", "));
                }
            }
        }
    }

    Ok(())
}
