//! `cadence migrate`: schema migrations for the shared database.

use std::path::Path;

use miette::Result;

use cadence_messenger::{Migrator, db};

/// What to do with the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrateAction {
    Up,
    /// Revert one version, or the most recent one.
    Down { version: Option<String> },
    Status,
}

pub fn run(database: &Path, action: MigrateAction) -> Result<()> {
    let conn = db::open(database).map_err(|e| miette::miette!("{}", e))?;
    let migrator = Migrator::new(&conn).map_err(|e| miette::miette!("{}", e))?;

    match action {
        MigrateAction::Up => {
            let applied = migrator.migrate_up().map_err(|e| miette::miette!("{}", e))?;
            if applied.is_empty() {
                println!("No pending migrations to run.");
            }
            for version in applied {
                println!("  [APPLIED] {}", version);
            }
        }
        MigrateAction::Down { version: Some(version) } => {
            let reverted = migrator
                .migrate_down(&version)
                .map_err(|e| miette::miette!("{}", e))?;
            if reverted {
                println!("  [REVERTED] {}", version);
            } else {
                println!("{} is not applied.", version);
            }
        }
        MigrateAction::Down { version: None } => {
            match migrator.rollback_last().map_err(|e| miette::miette!("{}", e))? {
                Some(version) => println!("  [REVERTED] {}", version),
                None => println!("No applied migrations to revert."),
            }
        }
        MigrateAction::Status => {
            println!("Migrations:\n");
            for status in migrator.status().map_err(|e| miette::miette!("{}", e))? {
                let state = match status.applied_at {
                    Some(at) => format!("[APPLIED {}]", at.format("%Y-%m-%d %H:%M:%S")),
                    None => "[PENDING]".to_string(),
                };
                println!("  {} {}", state, status.version);
                println!("      {}\n", status.description);
            }
        }
    }

    Ok(())
}
