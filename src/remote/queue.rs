// Parsers for the batch scheduler's textual output (squeue / sbatch)

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::output::errors::{ParseError, ParseErrorKind};

/// Eight whitespace-delimited columns: JOBID PARTITION NAME USER ST TIME NODES NODELIST
static QUEUE_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s*$")
        .expect("queue row pattern is valid")
});

static SUBMITTED_JOB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"job (.*)").expect("job id pattern is valid"));

/// Status code the scheduler prints for running jobs
pub const RUNNING_CODE: &str = "R";

/// One live row of the queue listing. Parsed per poll, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub job_id: String,
    pub partition: String,
    pub name: String,
    pub user: String,
    pub status: String,
    pub time: String,
    pub nodes: String,
    pub nodelist: String,
}

impl QueueEntry {
    pub fn is_running(&self) -> bool {
        self.status == RUNNING_CODE
    }
}

/// Parse a queue listing into entries, in source order.
///
/// The first line is the header and is discarded. Rows that do not have exactly
/// eight columns (summary lines, wrapped reasons) are skipped.
pub fn parse_queue(output: &str) -> Vec<QueueEntry> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(parse_row)
        .collect()
}

/// Like [`parse_queue`] but rejects output with no header line at all.
///
/// An empty listing is indistinguishable from "every job finished", so callers
/// that act on absence must use this variant.
pub fn parse_queue_strict(output: &str) -> Result<Vec<QueueEntry>, ParseError> {
    let has_header = output.lines().any(|line| !line.trim().is_empty());
    if !has_header {
        return Err(ParseError::new(
            ParseErrorKind::MissingHeader,
            "queue listing is empty",
        ));
    }
    Ok(parse_queue(output))
}

fn parse_row(line: &str) -> Option<QueueEntry> {
    let caps = QUEUE_ROW.captures(line)?;
    let field = |i: usize| caps[i].to_string();

    Some(QueueEntry {
        job_id: field(1),
        partition: field(2),
        name: field(3),
        user: field(4),
        status: field(5),
        time: field(6),
        nodes: field(7),
        nodelist: field(8),
    })
}

/// Index entries by job id for per-scenario lookups
pub fn index_by_job_id(entries: &[QueueEntry]) -> HashMap<&str, &QueueEntry> {
    entries.iter().map(|e| (e.job_id.as_str(), e)).collect()
}

/// Extract the job id from submission output such as "Submitted batch job 42"
///
/// The capture must be a single token, so error text like
/// "Batch job submission failed" is not mistaken for an id.
pub fn parse_job_id(output: &str) -> Result<String, ParseError> {
    output
        .lines()
        .filter_map(|line| SUBMITTED_JOB.captures(line))
        .map(|caps| caps[1].trim().to_string())
        .find(|id| !id.is_empty() && !id.contains(char::is_whitespace))
        .ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::MissingJobId,
                "submission output has no 'job <id>' line",
            )
            .with_input(output)
        })
}
