// Local staging directories for job configurations, inventories and results

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::output::errors::SylvaError;

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStorage { root: root.into() }
    }

    /// Create every staging directory
    pub fn ensure(&self) -> Result<(), SylvaError> {
        for dir in [self.scenario_dir(), self.inventory_dir(), self.output_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                SylvaError::io(format!("Failed to create storage directory: {}", e), &dir)
            })?;
        }
        Ok(())
    }

    /// Rendered job configurations
    pub fn scenario_dir(&self) -> PathBuf {
        self.root.join("input").join("scenario")
    }

    /// Uploaded inventory files
    pub fn inventory_dir(&self) -> PathBuf {
        self.root.join("input").join("inventory")
    }

    /// Downloaded result archives
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn scenario_file(&self, name: &str) -> PathBuf {
        self.scenario_dir().join(name)
    }

    pub fn inventory_file(&self, name: &str) -> PathBuf {
        self.inventory_dir().join(name)
    }

    pub fn output_file(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }

    /// Write a job configuration under a new `scenario_<millis>.json` name.
    ///
    /// The file is created exclusively; a taken name is bumped by one
    /// millisecond until a free one is found. Returns the name and the path.
    pub fn write_new_scenario(
        &self,
        millis: i64,
        content: &str,
    ) -> Result<(String, PathBuf), SylvaError> {
        let mut ts = millis;
        loop {
            let name = format!("scenario_{}.json", ts);
            let path = self.scenario_file(&name);

            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    ts += 1;
                    continue;
                }
                Err(e) => {
                    return Err(SylvaError::io(
                        format!("Failed to create job configuration: {}", e),
                        &path,
                    ))
                }
            };

            if let Err(e) = file.write_all(content.as_bytes()) {
                self.remove_quietly(&path);
                return Err(SylvaError::io(
                    format!("Failed to write job configuration: {}", e),
                    &path,
                ));
            }
            return Ok((name, path));
        }
    }

    /// Remove a file, treating "already gone" as success. Other failures are
    /// logged and reported as `false`.
    pub fn remove_quietly(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove file");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let storage = LocalStorage::new("/srv/sylva");
        assert_eq!(
            storage.scenario_file("scenario_1.json"),
            PathBuf::from("/srv/sylva/input/scenario/scenario_1.json")
        );
        assert_eq!(
            storage.inventory_file("plot_1.csv"),
            PathBuf::from("/srv/sylva/input/inventory/plot_1.csv")
        );
        assert_eq!(storage.output_file("a.zip"), PathBuf::from("/srv/sylva/output/a.zip"));
    }

    #[test]
    fn test_write_and_remove() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.ensure().unwrap();

        let (name, path) = storage.write_new_scenario(1, "{}").unwrap();
        assert_eq!(name, "scenario_1.json");
        assert!(path.exists());

        assert!(storage.remove_quietly(&path));
        assert!(!path.exists());
        // Missing files are not an error
        assert!(storage.remove_quietly(&path));
    }
    #[test]
    fn test_taken_names_are_bumped() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.ensure().unwrap();

        let (first, _) = storage.write_new_scenario(1000, "first").unwrap();
        let (second, _) = storage.write_new_scenario(1000, "second").unwrap();

        assert_eq!(first, "scenario_1000.json");
        assert_eq!(second, "scenario_1001.json");
        assert_eq!(
            std::fs::read_to_string(storage.scenario_file(&first)).unwrap(),
            "first"
        );
        assert_eq!(
            std::fs::read_to_string(storage.scenario_file(&second)).unwrap(),
            "second"
        );
    }

    #[test]
    fn test_concurrent_writers_never_share_a_name() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.ensure().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                std::thread::spawn(move || storage.write_new_scenario(5, &i.to_string()).unwrap())
            })
            .collect();
        let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap().0).collect();
        names.sort();
        names.dedup();

        assert_eq!(names.len(), 8);
    }
}
