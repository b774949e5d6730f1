//! `cadence failed`: inspect and redeliver dead-lettered messages.

use chrono::Utc;
use miette::{IntoDiagnostic, Result};

use cadence_messenger::{FailedMessageFilter, FailedMessageRecord, FailedMessageReplayer, ReplayOutcome};

use crate::daemon::Services;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedAction {
    List {
        queue: Option<String>,
        all: bool,
        limit: Option<usize>,
    },
    Show {
        id: u64,
    },
    /// Handle the message inline, now.
    Replay {
        id: u64,
    },
    /// Put the message back on its queue.
    Requeue {
        id: u64,
    },
}

pub async fn run(services: &Services, action: FailedAction) -> Result<()> {
    let replayer = FailedMessageReplayer::new(
        services.failed.clone(),
        services.handlers.clone(),
        services.transport.clone(),
        services.events.clone(),
    );

    match action {
        FailedAction::List { queue, all, limit } => {
            let records = services
                .failed
                .list(&FailedMessageFilter {
                    queue_name: queue,
                    include_delivered: all,
                    limit,
                })
                .await
                .map_err(|e| miette::miette!("{}", e))?;

            if records.is_empty() {
                println!("No failed messages.");
            }
            for record in &records {
                println!("{}", summary(record));
            }
        }
        FailedAction::Show { id } => {
            let record = services
                .failed
                .get(id)
                .await
                .map_err(|e| miette::miette!("{}", e))?
                .ok_or_else(|| miette::miette!("no failed message with id {}", id))?;
            println!("{}", serde_json::to_string_pretty(&record).into_diagnostic()?);
        }
        FailedAction::Replay { id } => {
            match replayer
                .replay(id, Utc::now())
                .await
                .map_err(|e| miette::miette!("{}", e))?
            {
                ReplayOutcome::Delivered(record) => {
                    println!("Delivered {}", summary(&record));
                }
                ReplayOutcome::Failed {
                    original_id,
                    new_record,
                } => {
                    println!(
                        "Replay of {} failed again; recorded as {}",
                        original_id,
                        summary(&new_record)
                    );
                }
            }
        }
        FailedAction::Requeue { id } => {
            let record = replayer
                .requeue(id, Utc::now())
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            println!("Requeued {}", summary(&record));
        }
    }

    Ok(())
}

/// One-line description of a record.
fn summary(record: &FailedMessageRecord) -> String {
    let kind = record.message().kind().unwrap_or("-").to_string();
    let state = match record.delivered_at {
        Some(at) => format!("delivered {}", at.to_rfc3339()),
        None => "pending".to_string(),
    };
    format!(
        "#{} [{}] queue={} kind={} failed_at={} error={}",
        record.id,
        state,
        record.queue_name,
        kind,
        record.created_at.to_rfc3339(),
        record.last_error().unwrap_or("-"),
    )
}
