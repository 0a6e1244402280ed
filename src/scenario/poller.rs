// Status poller: advances started scenarios from the batch queue listing

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{job_presence_policy, next_status, output_archive, ScenarioStatus};
use super::{Scenario, ScenarioPatch};
use crate::output::errors::SylvaError;
use crate::remote::queue::{index_by_job_id, QueueEntry};
use crate::remote::SessionManager;
use crate::store::{DocumentStore, LocalStorage};

/// Outcome of one poll
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// No active scenarios, so the queue was not listed
    pub skipped: bool,
    pub checked: usize,
    /// (scenario id, new status)
    pub transitions: Vec<(String, ScenarioStatus)>,
    pub downloads: usize,
    pub failures: usize,
}

pub struct StatusPoller {
    store: Arc<dyn DocumentStore>,
    session: Arc<SessionManager>,
    storage: LocalStorage,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Arc<SessionManager>,
        storage: LocalStorage,
        interval: Duration,
    ) -> Self {
        StatusPoller {
            store,
            session,
            storage,
            interval,
        }
    }

    /// Poll until `shutdown` fires. A tick in progress always completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "status poller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.skipped => {
                            tracing::debug!(
                                checked = report.checked,
                                transitions = report.transitions.len(),
                                failures = report.failures,
                                "poll complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, suggestion = ?e.suggestion(), "poll failed");
                        }
                    }
                }
            }
        }

        tracing::info!("status poller stopped");
    }

    /// One full pass over the active scenarios
    pub async fn tick(&self) -> Result<TickReport, SylvaError> {
        let active = self.store.scenarios_with_status(&ScenarioStatus::ACTIVE).await?;
        if active.is_empty() {
            return Ok(TickReport {
                skipped: true,
                ..Default::default()
            });
        }

        let entries = self.session.list_queue().await?;
        let queue = index_by_job_id(&entries);

        let mut report = TickReport::default();
        for scenario in &active {
            report.checked += 1;
            let Some(job_id) = scenario.job_id.as_deref() else {
                tracing::error!(scenario_id = %scenario.id, status = %scenario.status, "started scenario has no job id");
                report.failures += 1;
                continue;
            };
            let entry = queue.get(job_id).copied();

            if let Err(e) = self.advance(scenario, entry, &mut report).await {
                tracing::error!(
                    scenario_id = %scenario.id,
                    job_id = ?scenario.job_id,
                    error = %e,
                    "failed to update scenario"
                );
                report.failures += 1;
            }
        }

        Ok(report)
    }

    async fn advance(
        &self,
        scenario: &Scenario,
        entry: Option<&QueueEntry>,
        report: &mut TickReport,
    ) -> Result<(), SylvaError> {
        let observation = job_presence_policy(entry);
        let Some(next) = next_status(scenario.status, observation) else {
            return Ok(());
        };

        let archive = output_archive(&scenario.id);
        let patch = match next {
            ScenarioStatus::Finished => ScenarioPatch {
                status: Some(next),
                output_file: Some(archive.clone()),
                ..Default::default()
            },
            _ => ScenarioPatch {
                status: Some(next),
                ..Default::default()
            },
        };

        let applied = self
            .store
            .update_scenario(&scenario.id, scenario.status, &patch)
            .await?;
        if !applied {
            tracing::debug!(scenario_id = %scenario.id, "scenario changed since listing, skipped");
            return Ok(());
        }

        tracing::info!(
            scenario_id = %scenario.id,
            job_id = ?scenario.job_id,
            from = %scenario.status,
            to = %next,
            "scenario status changed"
        );
        report.transitions.push((scenario.id.clone(), next));

        if next == ScenarioStatus::Finished {
            self.session.download(&archive, &self.storage.output_dir()).await?;
            report.downloads += 1;
        }
        Ok(())
    }
}
