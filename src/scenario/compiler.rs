// Job configuration compiler: scenario steps to the remote executor's JSON document

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde_json::{json, Map, Value};

use super::Step;
use crate::output::errors::{ParseError, ParseErrorKind, SylvaError};
use crate::remote::RemoteLayout;

/// Skeleton every job configuration starts from
const TEMPLATE: &str = include_str!("template.json");

pub const OUTPUT_DIR_TOKEN: &str = "$OUTPUT_DIR";
pub const INPUT_DIR_TOKEN: &str = "$INPUT_DIR";
pub const INVENTORY_FILE_TOKEN: &str = "$INVENTORY_FILE";

/// Variable of the first operation naming the inventory file
const INPUT_VARIABLE: &str = "input";

static OUTPUT_DIR_RE: Lazy<Regex> = Lazy::new(|| literal(OUTPUT_DIR_TOKEN));
static INPUT_DIR_RE: Lazy<Regex> = Lazy::new(|| literal(INPUT_DIR_TOKEN));
static INVENTORY_FILE_RE: Lazy<Regex> = Lazy::new(|| literal(INVENTORY_FILE_TOKEN));

fn literal(token: &str) -> Regex {
    Regex::new(&regex::escape(token)).expect("escaped token is a valid regex")
}

/// Renders scenarios into job configuration documents
#[derive(Debug, Clone)]
pub struct ScenarioCompiler {
    layout: RemoteLayout,
    template: Value,
}

impl ScenarioCompiler {
    pub fn new(layout: RemoteLayout) -> Result<Self, SylvaError> {
        Self::with_template(layout, TEMPLATE)
    }

    pub fn with_template(layout: RemoteLayout, template: &str) -> Result<Self, SylvaError> {
        let template: Value = serde_json::from_str(template).map_err(|e| {
            ParseError::new(ParseErrorKind::InvalidTemplate, e.to_string()).with_input(template)
        })?;

        let has_first_slot = template
            .pointer("/operations/operation_1")
            .map(Value::is_object)
            .unwrap_or(false);
        if !has_first_slot {
            return Err(ParseError::new(
                ParseErrorKind::InvalidTemplate,
                "template has no operations.operation_1 object",
            )
            .into());
        }

        Ok(ScenarioCompiler { layout, template })
    }

    /// Render the job configuration for one scenario.
    ///
    /// The first step fills the template's `operation_1` slot, which always runs
    /// the scenario-level projection model; each later step is appended as
    /// `operation_<n>` in order.
    pub fn compile(
        &self,
        scenario_id: &str,
        steps: &[Step],
        inventory_file: &str,
        model_path: &str,
        model_class: &str,
    ) -> Result<String, SylvaError> {
        let mut document = self.template.clone();
        let operations = document
            .get_mut("operations")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| ParseError::new(ParseErrorKind::InvalidTemplate, "operations is not an object"))?;

        if let Some(first) = operations.get_mut("operation_1").and_then(Value::as_object_mut) {
            first.insert("model_path".to_string(), Value::from(model_path));
            first.insert("model_class".to_string(), Value::from(model_class));
            if let Some(step) = steps.first() {
                fill_first_operation(first, step);
            }
        }

        for (index, step) in steps.iter().enumerate().skip(1) {
            let model = step.model.as_ref().ok_or_else(|| SylvaError::BadRequest {
                message: format!("Step {} has no model", index + 1),
                string_code: "no_step",
            })?;
            let key = format!("operation_{}", operations.len() + 1);
            operations.insert(
                key,
                json!({
                    "name": step.name,
                    "description": step.description,
                    "model_path": model.model_path,
                    "model_class": model.model_class,
                    "operation": model.operation().as_str(),
                    "variables": Value::Object(step.variables.clone()),
                }),
            );
        }

        let text = serde_json::to_string_pretty(&document).map_err(|e| {
            ParseError::new(ParseErrorKind::InvalidJson, format!("failed to serialize: {}", e))
        })?;

        let text = substitute(&OUTPUT_DIR_RE, &text, &self.layout.output_prefix(scenario_id));
        let text = substitute(&INPUT_DIR_RE, &text, &self.layout.input_dir());
        Ok(substitute(&INVENTORY_FILE_RE, &text, inventory_file))
    }
}

/// The first step runs in the template's INIT slot with the scenario's model.
/// Its name and description replace the template's when given, and its
/// variables are merged in; the slot's `input` is never overridden.
fn fill_first_operation(first: &mut Map<String, Value>, step: &Step) {
    if !step.name.is_empty() {
        first.insert("name".to_string(), Value::from(step.name.as_str()));
    }
    if !step.description.is_empty() {
        first.insert("description".to_string(), Value::from(step.description.as_str()));
    }
    if let Some(variables) = first.get_mut("variables").and_then(Value::as_object_mut) {
        for (name, value) in &step.variables {
            if name != INPUT_VARIABLE {
                variables.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Replace every match with `value`, escaped for use inside a JSON string
fn substitute(re: &Regex, text: &str, value: &str) -> String {
    let encoded = Value::from(value).to_string();
    let escaped = &encoded[1..encoded.len() - 1];
    re.replace_all(text, NoExpand(escaped)).into_owned()
}

/// Operations of a rendered document, in execution order
pub fn operations(document: &str) -> Result<Map<String, Value>, SylvaError> {
    let value: Value = serde_json::from_str(document).map_err(|e| {
        ParseError::new(ParseErrorKind::InvalidJson, e.to_string()).with_input(document)
    })?;
    match value.get("operations") {
        Some(Value::Object(ops)) => Ok(ops.clone()),
        _ => Err(ParseError::new(ParseErrorKind::InvalidJson, "document has no operations").into()),
    }
}
