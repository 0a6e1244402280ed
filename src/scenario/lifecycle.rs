// Scenario lifecycle: NOT_STARTED -> WAITING -> RUNNING -> FINISHED

use serde::{Deserialize, Serialize};

use crate::output::errors::SylvaError;
use crate::remote::QueueEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    NotStarted,
    Waiting,
    Running,
    Finished,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::NotStarted => "NOT_STARTED",
            ScenarioStatus::Waiting => "WAITING",
            ScenarioStatus::Running => "RUNNING",
            ScenarioStatus::Finished => "FINISHED",
        }
    }

    /// Statuses the poller tracks
    pub const ACTIVE: [ScenarioStatus; 2] = [ScenarioStatus::Waiting, ScenarioStatus::Running];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl std::fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one queue listing says about a scenario's job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobObservation {
    /// Listed but not yet running (pending, configuring, ...)
    Queued,
    /// Listed with the running state code
    Running,
    /// No longer listed
    Completed,
}

/// Decide what a job's presence in the queue means.
///
/// A job missing from the listing counts as completed. This cannot tell a
/// successful run from a failed, cancelled or evicted one; all of them end up
/// FINISHED. Replace this function once the scheduler's exit state is queried.
pub fn job_presence_policy(entry: Option<&QueueEntry>) -> JobObservation {
    match entry {
        None => JobObservation::Completed,
        Some(entry) if entry.is_running() => JobObservation::Running,
        Some(_) => JobObservation::Queued,
    }
}

/// Status a scenario moves to after an observation, if any.
///
/// Returns `None` when the observation changes nothing, so re-observing the
/// same queue state is a no-op.
pub fn next_status(current: ScenarioStatus, observation: JobObservation) -> Option<ScenarioStatus> {
    match (current, observation) {
        (ScenarioStatus::Waiting, JobObservation::Running) => Some(ScenarioStatus::Running),
        (ScenarioStatus::Waiting | ScenarioStatus::Running, JobObservation::Completed) => {
            Some(ScenarioStatus::Finished)
        }
        _ => None,
    }
}

/// Only never-started scenarios may be started
pub fn ensure_startable(status: ScenarioStatus) -> Result<(), SylvaError> {
    match status {
        ScenarioStatus::NotStarted => Ok(()),
        other => Err(SylvaError::Conflict {
            message: format!("Scenario already started (status {})", other),
            string_code: "already_started",
        }),
    }
}

/// Name of the archive a finished scenario's job leaves in the output area
pub fn output_archive(scenario_id: &str) -> String {
    format!("{}.zip", scenario_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::parse_queue;

    const LISTING: &str = "JOBID PARTITION NAME USER ST TIME NODES NODELIST
            42   batch   sim1   alice   R   0:05   1      node01
            43   batch   sim2   alice   PD  0:00   1      (Priority)
";

    #[test]
    fn test_policy_reads_queue_entries() {
        let entries = parse_queue(LISTING);
        let find = |id: &str| entries.iter().find(|e| e.job_id == id);

        assert_eq!(job_presence_policy(find("42")), JobObservation::Running);
        assert_eq!(job_presence_policy(find("43")), JobObservation::Queued);
        assert_eq!(job_presence_policy(find("44")), JobObservation::Completed);
    }

    #[test]
    fn test_transitions() {
        use JobObservation::*;

        assert_eq!(
            next_status(ScenarioStatus::Waiting, Running),
            Some(ScenarioStatus::Running)
        );
        assert_eq!(next_status(ScenarioStatus::Waiting, Queued), None);
        assert_eq!(
            next_status(ScenarioStatus::Waiting, Completed),
            Some(ScenarioStatus::Finished)
        );
        assert_eq!(
            next_status(ScenarioStatus::Running, Completed),
            Some(ScenarioStatus::Finished)
        );
    }

    #[test]
    fn test_reobserving_is_a_noop() {
        use JobObservation::*;

        assert_eq!(next_status(ScenarioStatus::Running, Running), None);
        assert_eq!(next_status(ScenarioStatus::Running, Queued), None);
        assert_eq!(next_status(ScenarioStatus::Finished, Completed), None);
        assert_eq!(next_status(ScenarioStatus::NotStarted, Completed), None);
    }

    #[test]
    fn test_start_guard() {
        assert!(ensure_startable(ScenarioStatus::NotStarted).is_ok());
        for status in [ScenarioStatus::Waiting, ScenarioStatus::Running, ScenarioStatus::Finished] {
            let err = ensure_startable(status).unwrap_err();
            assert_eq!(err.status_code(), 409);
            assert_eq!(err.string_code(), "already_started");
        }
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&ScenarioStatus::NotStarted).unwrap(),
            "\"NOT_STARTED\""
        );
        let status: ScenarioStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(status, ScenarioStatus::Running);
        assert!(status.is_active());
        assert!(!ScenarioStatus::Finished.is_active());
    }

    #[test]
    fn test_output_archive_name() {
        assert_eq!(output_archive("5f1a"), "5f1a.zip");
    }
}
