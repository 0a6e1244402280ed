// Scenario module - simulation runs and their remote job lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::catalog::{ModelCategory, OperationKind};
use crate::output::errors::SylvaError;

pub mod compiler;
pub mod lifecycle;
pub mod poller;
pub mod service;

pub use compiler::ScenarioCompiler;
pub use lifecycle::{job_presence_policy, next_status, JobObservation, ScenarioStatus};
pub use poller::{StatusPoller, TickReport};
pub use service::ScenarioService;

/// A user-defined simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(rename = "_id")]
    pub id: String,
    /// Weak reference, resolved by lookup
    pub inventory_id: String,
    pub steps: Vec<Step>,
    /// Job configuration file name in local input storage
    pub json_file: String,
    pub status: ScenarioStatus,
    /// Set only once the scenario is FINISHED
    pub output_file: Option<String>,
    /// Scheduler job id, set when started
    pub job_id: Option<String>,
    /// Projection model used for the first operation
    pub model_class: String,
    pub model_path: String,
    pub creator_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// One stage of a scenario
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: Option<ModelRef>,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// The model a step runs, as embedded by the client
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub model_path: String,
    pub model_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ModelCategory>,
}

impl ModelRef {
    /// Explicit operation, or the one implied by the model category
    pub fn operation(&self) -> OperationKind {
        match (self.operation, self.category) {
            (Some(op), _) => op,
            (None, Some(ModelCategory::Cutting)) => OperationKind::Harvest,
            (None, _) => OperationKind::Execution,
        }
    }
}

impl Step {
    /// Turn numeric text ("12", "0.5") into JSON numbers
    pub fn coerce_variables(&mut self) {
        for value in self.variables.values_mut() {
            if let Value::String(text) = value {
                if let Some(number) = parse_number(text) {
                    *value = Value::Number(number);
                }
            }
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(int) = text.parse::<i64>() {
        return Some(Number::from(int));
    }
    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}

/// Steps arrive either as a JSON array or as a JSON-encoded string of one
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepsField {
    Encoded(String),
    List(Vec<Step>),
}

impl StepsField {
    pub fn into_steps(self) -> Result<Vec<Step>, SylvaError> {
        match self {
            StepsField::List(steps) => Ok(steps),
            StepsField::Encoded(text) => {
                serde_json::from_str(&text).map_err(|e| SylvaError::BadRequest {
                    message: format!("steps is not a valid JSON array: {}", e),
                    string_code: "required_params",
                })
            }
        }
    }
}

/// Body of a scenario creation request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScenario {
    pub steps: StepsField,
    pub inventory_id: String,
    pub model_class: String,
    pub model_path: String,
}

/// Fields the lifecycle writes; `None` leaves the stored value alone
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScenarioPatch {
    pub status: Option<ScenarioStatus>,
    pub job_id: Option<String>,
    pub output_file: Option<String>,
}

impl ScenarioPatch {
    pub fn apply(&self, scenario: &mut Scenario) {
        if let Some(status) = self.status {
            scenario.status = status;
        }
        if let Some(job_id) = &self.job_id {
            scenario.job_id = Some(job_id.clone());
        }
        if let Some(output_file) = &self.output_file {
            scenario.output_file = Some(output_file.clone());
        }
    }
}
