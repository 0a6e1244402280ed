// Document store: scenarios, inventories and models

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{Inventory, Model};
use crate::output::errors::SylvaError;
use crate::scenario::{Scenario, ScenarioPatch, ScenarioStatus};

pub mod files;

pub use files::LocalStorage;

/// New 24-hex-digit document identifier
pub fn new_object_id() -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Persistence seam used by the API and the poller
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a scenario, assigning an id when it has none
    async fn insert_scenario(&self, scenario: Scenario) -> Result<Scenario, SylvaError>;
    async fn find_scenario(&self, id: &str) -> Result<Option<Scenario>, SylvaError>;
    /// All scenarios, or only those created by `creator`
    async fn list_scenarios(&self, creator: Option<&str>) -> Result<Vec<Scenario>, SylvaError>;
    async fn scenarios_with_status(
        &self,
        statuses: &[ScenarioStatus],
    ) -> Result<Vec<Scenario>, SylvaError>;
    /// Apply `patch` only if the stored status still equals `expected`.
    /// Returns false when the precondition failed or the scenario is gone.
    async fn update_scenario(
        &self,
        id: &str,
        expected: ScenarioStatus,
        patch: &ScenarioPatch,
    ) -> Result<bool, SylvaError>;
    async fn remove_scenario(&self, id: &str) -> Result<bool, SylvaError>;

    async fn insert_inventory(&self, inventory: Inventory) -> Result<Inventory, SylvaError>;
    async fn find_inventory(&self, id: &str) -> Result<Option<Inventory>, SylvaError>;

    async fn insert_model(&self, model: Model) -> Result<Model, SylvaError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Collections {
    scenarios: Vec<Scenario>,
    inventories: Vec<Inventory>,
    models: Vec<Model>,
}

/// Document store kept in memory and saved as one pretty-printed JSON file
pub struct JsonStore {
    path: Option<PathBuf>,
    data: RwLock<Collections>,
}

impl JsonStore {
    /// Open (or create) a store file
    pub fn open(path: &Path) -> Result<Self, SylvaError> {
        let data = if path.exists() {
            let json = fs::read_to_string(path)
                .map_err(|e| SylvaError::io(format!("Failed to read store: {}", e), path))?;
            serde_json::from_str(&json).map_err(|e| {
                SylvaError::store(format!("Failed to parse store {}: {}", path.display(), e))
            })?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    SylvaError::io(format!("Failed to create store directory: {}", e), parent)
                })?;
            }
            Collections::default()
        };

        tracing::debug!(path = %path.display(), "document store opened");

        Ok(JsonStore {
            path: Some(path.to_path_buf()),
            data: RwLock::new(data),
        })
    }

    /// A store that never touches disk
    pub fn in_memory() -> Self {
        JsonStore {
            path: None,
            data: RwLock::new(Collections::default()),
        }
    }

    /// Write the collections out; called with the write lock held so saves stay ordered
    fn persist(&self, data: &Collections) -> Result<(), SylvaError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(data)
            .map_err(|e| SylvaError::store(format!("Failed to serialize store: {}", e)))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| SylvaError::io(format!("Failed to write store: {}", e), &tmp))?;
        fs::rename(&tmp, path)
            .map_err(|e| SylvaError::io(format!("Failed to replace store: {}", e), path))
    }

    /// Apply `f` to a copy of the collections; the copy replaces them only once saved
    fn mutate<T>(&self, f: impl FnOnce(&mut Collections) -> T) -> Result<T, SylvaError> {
        let mut data = self.data.write();
        let mut next = data.clone();
        let result = f(&mut next);
        self.persist(&next)?;
        *data = next;
        Ok(result)
    }
}

#[async_trait]
impl DocumentStore for JsonStore {
    async fn insert_scenario(&self, mut scenario: Scenario) -> Result<Scenario, SylvaError> {
        if scenario.id.is_empty() {
            scenario.id = new_object_id();
        }
        let stored = scenario.clone();
        self.mutate(|data| data.scenarios.push(stored))?;
        Ok(scenario)
    }

    async fn find_scenario(&self, id: &str) -> Result<Option<Scenario>, SylvaError> {
        Ok(self.data.read().scenarios.iter().find(|s| s.id == id).cloned())
    }

    async fn list_scenarios(&self, creator: Option<&str>) -> Result<Vec<Scenario>, SylvaError> {
        let data = self.data.read();
        Ok(data
            .scenarios
            .iter()
            .filter(|s| creator.map_or(true, |c| s.creator_id == c))
            .cloned()
            .collect())
    }

    async fn scenarios_with_status(
        &self,
        statuses: &[ScenarioStatus],
    ) -> Result<Vec<Scenario>, SylvaError> {
        let data = self.data.read();
        Ok(data
            .scenarios
            .iter()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }

    async fn update_scenario(
        &self,
        id: &str,
        expected: ScenarioStatus,
        patch: &ScenarioPatch,
    ) -> Result<bool, SylvaError> {
        let actual = self
            .data
            .read()
            .scenarios
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.status);

        match actual {
            None => return Ok(false),
            Some(actual) if actual != expected => {
                tracing::debug!(
                    scenario_id = id,
                    expected = %expected,
                    actual = %actual,
                    "status precondition failed"
                );
                return Ok(false);
            }
            Some(_) => {}
        }

        // Re-checked under the write lock so the swap stays atomic
        self.mutate(|data| match data.scenarios.iter_mut().find(|s| s.id == id) {
            Some(scenario) if scenario.status == expected => {
                patch.apply(scenario);
                true
            }
            _ => false,
        })
    }

    async fn remove_scenario(&self, id: &str) -> Result<bool, SylvaError> {
        self.mutate(|data| {
            let before = data.scenarios.len();
            data.scenarios.retain(|s| s.id != id);
            data.scenarios.len() != before
        })
    }

    async fn insert_inventory(&self, mut inventory: Inventory) -> Result<Inventory, SylvaError> {
        if inventory.id.is_empty() {
            inventory.id = new_object_id();
        }
        let stored = inventory.clone();
        self.mutate(|data| data.inventories.push(stored))?;
        Ok(inventory)
    }

    async fn find_inventory(&self, id: &str) -> Result<Option<Inventory>, SylvaError> {
        Ok(self.data.read().inventories.iter().find(|i| i.id == id).cloned())
    }

    async fn insert_model(&self, mut model: Model) -> Result<Model, SylvaError> {
        if model.id.is_empty() {
            model.id = new_object_id();
        }
        let stored = model.clone();
        self.mutate(|data| data.models.push(stored))?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InventoryFormat;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn scenario(creator: &str) -> Scenario {
        Scenario {
            id: String::new(),
            inventory_id: "inv".to_string(),
            steps: Vec::new(),
            json_file: "scenario_1.json".to_string(),
            status: ScenarioStatus::NotStarted,
            output_file: None,
            job_id: None,
            model_class: "PinusSylvestris".to_string(),
            model_path: "models.trees.Psylvestris".to_string(),
            creator_id: creator.to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_object_ids() {
        let id = new_object_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_object_id());
    }

    #[tokio::test]
    async fn test_insert_and_filter() {
        let store = JsonStore::in_memory();
        let a = store.insert_scenario(scenario("alice")).await.unwrap();
        store.insert_scenario(scenario("bob")).await.unwrap();

        assert_eq!(a.id.len(), 24);
        assert_eq!(store.list_scenarios(None).await.unwrap().len(), 2);
        assert_eq!(store.list_scenarios(Some("alice")).await.unwrap(), vec![a.clone()]);
        assert_eq!(store.find_scenario(&a.id).await.unwrap(), Some(a));
        assert_eq!(store.find_scenario("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_update() {
        let store = JsonStore::in_memory();
        let s = store.insert_scenario(scenario("alice")).await.unwrap();

        let start = ScenarioPatch {
            status: Some(ScenarioStatus::Waiting),
            job_id: Some("42".to_string()),
            ..Default::default()
        };
        assert!(store
            .update_scenario(&s.id, ScenarioStatus::NotStarted, &start)
            .await
            .unwrap());

        // A second writer holding the stale status loses
        assert!(!store
            .update_scenario(&s.id, ScenarioStatus::NotStarted, &start)
            .await
            .unwrap());

        let stored = store.find_scenario(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScenarioStatus::Waiting);
        assert_eq!(stored.job_id.as_deref(), Some("42"));
        assert_eq!(stored.output_file, None);

        assert!(!store
            .update_scenario("missing", ScenarioStatus::Waiting, &start)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_scenarios_with_status() {
        let store = JsonStore::in_memory();
        let s = store.insert_scenario(scenario("alice")).await.unwrap();
        store.insert_scenario(scenario("alice")).await.unwrap();

        assert!(store
            .scenarios_with_status(&ScenarioStatus::ACTIVE)
            .await
            .unwrap()
            .is_empty());

        let patch = ScenarioPatch {
            status: Some(ScenarioStatus::Waiting),
            ..Default::default()
        };
        store
            .update_scenario(&s.id, ScenarioStatus::NotStarted, &patch)
            .await
            .unwrap();

        let active = store.scenarios_with_status(&ScenarioStatus::ACTIVE).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, s.id);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("sylva.json");

        let (id, inventory_id) = {
            let store = JsonStore::open(&path).unwrap();
            let s = store.insert_scenario(scenario("alice")).await.unwrap();
            let inventory = store
                .insert_inventory(Inventory {
                    id: String::new(),
                    inventory_id: "abcd".to_string(),
                    name: "Plots".to_string(),
                    format: InventoryFormat::Xlsx,
                    file_url: "inventory_1.xlsx".to_string(),
                    file_url2: None,
                    public: false,
                    smartelo: false,
                    creator_id: "alice".to_string(),
                    creation_date: None,
                })
                .await
                .unwrap();
            (s.id, inventory.id)
        };

        let reopened = JsonStore::open(&path).unwrap();
        assert!(reopened.find_scenario(&id).await.unwrap().is_some());
        assert!(reopened.find_inventory(&inventory_id).await.unwrap().is_some());

        assert!(reopened.remove_scenario(&id).await.unwrap());
        assert!(!reopened.remove_scenario(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("db");
        let store = JsonStore::open(&db.join("sylva.json")).unwrap();
        let s = store.insert_scenario(scenario("alice")).await.unwrap();

        std::fs::remove_dir_all(&db).unwrap();

        let start = ScenarioPatch {
            status: Some(ScenarioStatus::Waiting),
            job_id: Some("42".to_string()),
            ..Default::default()
        };
        assert!(store
            .update_scenario(&s.id, ScenarioStatus::NotStarted, &start)
            .await
            .is_err());
        assert!(store.insert_scenario(scenario("bob")).await.is_err());
        assert!(store.remove_scenario(&s.id).await.is_err());

        let stored = store.find_scenario(&s.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScenarioStatus::NotStarted);
        assert_eq!(stored.job_id, None);
        assert_eq!(store.list_scenarios(None).await.unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sylva.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(JsonStore::open(&path), Err(SylvaError::Store { .. })));
    }
}
