// Scenario operations: create, start, delete, fetch results

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;

use super::lifecycle::{ensure_startable, ScenarioStatus};
use super::{NewScenario, Scenario, ScenarioCompiler, ScenarioPatch};
use crate::api::auth::Requester;
use crate::catalog::Inventory;
use crate::output::errors::SylvaError;
use crate::remote::SessionManager;
use crate::store::{new_object_id, DocumentStore, LocalStorage};

/// A scenario as listed, with the inventory name when it still resolves
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioListing {
    #[serde(flatten)]
    pub scenario: Scenario,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory_name: Option<String>,
}

pub struct ScenarioService {
    store: Arc<dyn DocumentStore>,
    session: Arc<SessionManager>,
    compiler: ScenarioCompiler,
    storage: LocalStorage,
    /// Scenarios with a start sequence currently running
    starting: DashSet<String>,
}

/// Releases a scenario's start slot when the start attempt ends
struct StartSlot<'a> {
    starting: &'a DashSet<String>,
    id: String,
}

impl Drop for StartSlot<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.id);
    }
}

fn scenario_not_found() -> SylvaError {
    SylvaError::not_found("Scenario item")
}

fn inventory_not_found() -> SylvaError {
    SylvaError::not_found("Inventory")
}

impl ScenarioService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Arc<SessionManager>,
        compiler: ScenarioCompiler,
        storage: LocalStorage,
    ) -> Self {
        ScenarioService {
            store,
            session,
            compiler,
            storage,
            starting: DashSet::new(),
        }
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub async fn list(&self, requester: &Requester) -> Result<Vec<ScenarioListing>, SylvaError> {
        let scenarios = self.store.list_scenarios(requester.scope()).await?;

        let mut listings = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let inventory_name = match self.store.find_inventory(&scenario.inventory_id).await? {
                Some(inventory) => Some(inventory.name),
                None => {
                    tracing::info!(
                        scenario_id = %scenario.id,
                        inventory_id = %scenario.inventory_id,
                        "scenario references a missing inventory"
                    );
                    None
                }
            };
            listings.push(ScenarioListing {
                scenario,
                inventory_name,
            });
        }
        Ok(listings)
    }

    /// A scenario the requester may see; others' scenarios look missing
    pub async fn get(&self, requester: &Requester, id: &str) -> Result<Scenario, SylvaError> {
        match self.store.find_scenario(id).await? {
            Some(scenario) if requester.owns(&scenario.creator_id) => Ok(scenario),
            _ => Err(scenario_not_found()),
        }
    }

    async fn accessible_inventory(
        &self,
        requester: &Requester,
        inventory_id: &str,
    ) -> Result<Inventory, SylvaError> {
        match self.store.find_inventory(inventory_id).await? {
            Some(inventory) if inventory.is_accessible_by(&requester.id, requester.is_admin()) => {
                Ok(inventory)
            }
            _ => Err(inventory_not_found()),
        }
    }

    /// Record a new scenario and render its job configuration
    pub async fn create(
        &self,
        requester: &Requester,
        request: NewScenario,
    ) -> Result<Scenario, SylvaError> {
        let mut steps = request.steps.into_steps()?;
        if steps.first().and_then(|s| s.model.as_ref()).is_none() {
            return Err(SylvaError::BadRequest {
                message: "At least 1 step is necessary.".to_string(),
                string_code: "no_step",
            });
        }
        for step in &mut steps {
            step.coerce_variables();
        }

        let inventory = self.accessible_inventory(requester, &request.inventory_id).await?;

        let id = new_object_id();
        let document = self.compiler.compile(
            &id,
            &steps,
            &inventory.file_url,
            &request.model_path,
            &request.model_class,
        )?;
        let (json_file, path) = self
            .storage
            .write_new_scenario(Utc::now().timestamp_millis(), &document)?;

        let scenario = Scenario {
            id,
            inventory_id: request.inventory_id,
            steps,
            json_file,
            status: ScenarioStatus::NotStarted,
            output_file: None,
            job_id: None,
            model_class: request.model_class,
            model_path: request.model_path,
            creator_id: requester.id.trim().to_string(),
            created_at: Some(Utc::now()),
        };

        match self.store.insert_scenario(scenario).await {
            Ok(scenario) => {
                tracing::info!(scenario_id = %scenario.id, json_file = %scenario.json_file, "scenario created");
                Ok(scenario)
            }
            Err(e) => {
                self.storage.remove_quietly(&path);
                Err(e)
            }
        }
    }

    /// Stage inputs, submit the job and move the scenario to WAITING.
    ///
    /// Nothing is persisted unless submission succeeds. Files already staged
    /// remotely when a later step fails are logged for manual cleanup.
    pub async fn start(&self, requester: &Requester, id: &str) -> Result<Scenario, SylvaError> {
        let scenario = self.get(requester, id).await?;
        ensure_startable(scenario.status)?;

        if !self.starting.insert(scenario.id.clone()) {
            return Err(SylvaError::Conflict {
                message: "Scenario start already in progress".to_string(),
                string_code: "start_in_progress",
            });
        }
        let _slot = StartSlot {
            starting: &self.starting,
            id: scenario.id.clone(),
        };

        let inventory = self.accessible_inventory(requester, &scenario.inventory_id).await?;

        let mut staged: Vec<String> = Vec::new();
        let uploads = inventory
            .files()
            .map(|f| self.storage.inventory_file(f))
            .chain(std::iter::once(self.storage.scenario_file(&scenario.json_file)));

        for local in uploads {
            if let Err(e) = self.session.upload(&local).await {
                self.log_partial_start(&scenario, &staged, &e);
                return Err(e);
            }
            if let Some(name) = local.file_name() {
                staged.push(name.to_string_lossy().into_owned());
            }
        }

        let job_id = match self.session.submit(&scenario.json_file, &scenario.id).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.log_partial_start(&scenario, &staged, &e);
                return Err(e);
            }
        };

        let patch = ScenarioPatch {
            status: Some(ScenarioStatus::Waiting),
            job_id: Some(job_id.clone()),
            ..Default::default()
        };
        let applied = self
            .store
            .update_scenario(&scenario.id, ScenarioStatus::NotStarted, &patch)
            .await?;
        if !applied {
            tracing::error!(
                scenario_id = %scenario.id,
                job_id = %job_id,
                "scenario changed while starting; submitted job is not tracked"
            );
            return Err(SylvaError::Conflict {
                message: "Scenario changed while it was being started".to_string(),
                string_code: "already_started",
            });
        }

        tracing::info!(scenario_id = %scenario.id, job_id = %job_id, "scenario started");

        let mut started = scenario;
        patch.apply(&mut started);
        Ok(started)
    }

    fn log_partial_start(&self, scenario: &Scenario, staged: &[String], error: &SylvaError) {
        if staged.is_empty() {
            tracing::warn!(scenario_id = %scenario.id, error = %error, "scenario start failed");
        } else {
            tracing::warn!(
                scenario_id = %scenario.id,
                remote_dir = %self.session.layout().input_dir(),
                staged = ?staged,
                error = %error,
                "scenario start failed after staging files; remove them manually"
            );
        }
    }

    /// Remove the record and its local files. Missing files are ignored.
    pub async fn delete(&self, requester: &Requester, id: &str) -> Result<(), SylvaError> {
        let scenario = self.get(requester, id).await?;

        self.storage
            .remove_quietly(&self.storage.scenario_file(&scenario.json_file));
        if let Some(output) = &scenario.output_file {
            self.storage.remove_quietly(&self.storage.output_file(output));
        }

        if !self.store.remove_scenario(&scenario.id).await? {
            return Err(scenario_not_found());
        }
        tracing::info!(scenario_id = %scenario.id, "scenario deleted");
        Ok(())
    }

    /// Local path of a finished scenario's result archive
    pub async fn result_path(&self, requester: &Requester, id: &str) -> Result<PathBuf, SylvaError> {
        let scenario = self.get(requester, id).await?;
        let output = scenario
            .output_file
            .ok_or_else(|| SylvaError::not_found("Result file"))?;

        let path = self.storage.output_file(&output);
        if !path.is_file() {
            return Err(SylvaError::not_found("Result file"));
        }
        Ok(path)
    }
}
