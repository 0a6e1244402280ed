// Catalog entries referenced by scenarios: simulation models and inventories

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::output::errors::SylvaError;

/// Kind of analysis unit a model implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    /// Growth projection
    Projection,
    /// Harvest / cutting operation
    Cutting,
}

/// Operation the remote executor runs a model as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Execution,
    Harvest,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Execution => "EXECUTION",
            OperationKind::Harvest => "HARVEST",
        }
    }
}

/// A catalog model. Only admins create or edit these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub category: ModelCategory,
    pub model_path: String,
    pub model_class: String,
    pub operation: OperationKind,
    #[serde(default)]
    pub specie: String,
    #[serde(default)]
    pub application_area: String,
    #[serde(default)]
    pub execution_period: String,
    #[serde(default)]
    pub creator_id: String,
}

/// Load model entries from a YAML list
pub fn models_from_yaml(content: &str) -> Result<Vec<Model>, SylvaError> {
    serde_yaml::from_str(content).map_err(|e| SylvaError::BadRequest {
        message: format!("Invalid model catalog: {}", e),
        string_code: "required_params",
    })
}

/// How the inventory data was uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryFormat {
    /// One workbook holding plot and tree sheets
    Xlsx,
    /// Separate plot and tree CSV files
    Csv,
}

/// An uploaded plot/tree dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Derived from the uploaded content
    pub inventory_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub format: InventoryFormat,
    /// Stored file name (the plot file for CSV uploads)
    pub file_url: String,
    /// Tree file for CSV uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url2: Option<String>,
    #[serde(default)]
    pub public: bool,
    /// Eligible for the secondary export workflow
    #[serde(default)]
    pub smartelo: bool,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
}

impl Inventory {
    /// Stored files, in upload order
    pub fn files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.file_url.as_str()).chain(self.file_url2.as_deref())
    }

    pub fn is_accessible_by(&self, user_id: &str, is_admin: bool) -> bool {
        is_admin || self.public || self.creator_id == user_id
    }
}

/// Content-derived inventory identifier: first 16 hex digits of the SHA-256
/// over every file, in order.
pub fn inventory_content_id(files: &[&Path]) -> Result<String, SylvaError> {
    let mut hasher = Sha256::new();
    for path in files {
        let content = std::fs::read(path)
            .map_err(|e| SylvaError::io(format!("Failed to read inventory file: {}", e), *path))?;
        hasher.update(&content);
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}

/// Copy inventory files into local storage and describe them as an `Inventory`.
///
/// Stored names follow the `plot_<ts>.csv` / `tree_<ts>.csv` /
/// `inventory_<ts>.xlsx` convention so concurrent uploads never collide.
pub fn register_inventory(
    name: &str,
    files: &[PathBuf],
    owner: &str,
    public: bool,
    inventory_dir: &Path,
) -> Result<Inventory, SylvaError> {
    let (format, stored) = match files {
        [_] => {
            let ts = Utc::now().timestamp_millis();
            (InventoryFormat::Xlsx, vec![format!("inventory_{}.xlsx", ts)])
        }
        [_, _] => {
            let ts = Utc::now().timestamp_millis();
            (
                InventoryFormat::Csv,
                vec![format!("plot_{}.csv", ts), format!("tree_{}.csv", ts)],
            )
        }
        _ => {
            return Err(SylvaError::BadRequest {
                message: "An inventory is one workbook or a plot/tree CSV pair".to_string(),
                string_code: "required_params",
            })
        }
    };

    let paths: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
    let inventory_id = inventory_content_id(&paths)?;

    std::fs::create_dir_all(inventory_dir).map_err(|e| {
        SylvaError::io(format!("Failed to create inventory directory: {}", e), inventory_dir)
    })?;
    for (source, stored_name) in files.iter().zip(&stored) {
        let target = inventory_dir.join(stored_name);
        std::fs::copy(source, &target)
            .map_err(|e| SylvaError::io(format!("Failed to store inventory file: {}", e), &target))?;
    }

    let mut stored = stored.into_iter();
    Ok(Inventory {
        id: String::new(),
        inventory_id,
        name: name.to_string(),
        format,
        file_url: stored.next().unwrap_or_default(),
        file_url2: stored.next(),
        public,
        smartelo: false,
        creator_id: owner.to_string(),
        creation_date: Some(Utc::now()),
    })
}
