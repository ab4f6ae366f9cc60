//! Test-script storage
//!
//! Layout: `{root}/{escaped origin}/{assignment_id}/` holds the uploaded test
//! scripts, with the assignment's test specification in `settings.json`.

use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{AutotestError, Result};
use crate::identity::escape_origin;
use crate::types::TestSpecs;
use crate::workdir::remove_dir_idempotent;

pub const SPECS_FILE_NAME: &str = "settings.json";

pub trait TestScriptStore {
    /// Directory holding the scripts for an assignment, if any were uploaded.
    fn find_test_scripts(&self, origin: &str, assignment_id: u64) -> Result<Option<PathBuf>>;

    fn load_specs(&self, origin: &str, assignment_id: u64) -> Result<TestSpecs>;
}

#[derive(Debug, Clone)]
pub struct FsScriptStore {
    root: PathBuf,
}

impl FsScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assignment_dir(&self, origin: &str, assignment_id: u64) -> PathBuf {
        self.root
            .join(escape_origin(origin))
            .join(assignment_id.to_string())
    }

    /// Replace an assignment's scripts and specification.
    ///
    /// When `files` is given it becomes the new script directory (moved, not
    /// copied), otherwise existing scripts are kept. On failure the previous
    /// scripts stay in place.
    pub fn install_specs(
        &self,
        origin: &str,
        assignment_id: u64,
        specs: &Value,
        files: Option<&Path>,
    ) -> Result<PathBuf> {
        let dir = self.assignment_dir(origin, assignment_id);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }

        match files {
            Some(files) => {
                let staged = sibling(&dir, "incoming");
                remove_dir_idempotent(&staged)?;
                fs::rename(files, &staged)?;
                let installed = write_specs(&staged, specs).and_then(|()| swap_in(&staged, &dir));
                if installed.is_err() {
                    if let Err(e) = remove_dir_idempotent(&staged) {
                        warn!(path = %staged.display(), error = %e, "Failed to remove staged scripts");
                    }
                }
                installed?;
            }
            None => {
                fs::create_dir_all(&dir)?;
                write_specs(&dir, specs)?;
            }
        }

        info!(origin, assignment_id, dir = %dir.display(), "Installed test specifications");
        Ok(dir)
    }
}

/// Hidden directory next to `dir`; assignment directories are numeric.
fn sibling(dir: &Path, tag: &str) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.with_file_name(format!(".{}.{}", name, tag))
}

fn write_specs(dir: &Path, specs: &Value) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", SPECS_FILE_NAME));
    fs::write(&tmp, serde_json::to_vec_pretty(specs)?)?;
    fs::rename(&tmp, dir.join(SPECS_FILE_NAME))?;
    Ok(())
}

/// Move `staged` to `dir`, putting the old `dir` back if that fails.
fn swap_in(staged: &Path, dir: &Path) -> Result<()> {
    let previous = sibling(dir, "previous");
    remove_dir_idempotent(&previous)?;
    let had_previous = match fs::rename(dir, &previous) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = fs::rename(staged, dir) {
        if had_previous {
            if let Err(restore) = fs::rename(&previous, dir) {
                warn!(path = %dir.display(), error = %restore, "Failed to restore previous scripts");
            }
        }
        return Err(e.into());
    }

    if had_previous {
        if let Err(e) = remove_dir_idempotent(&previous) {
            warn!(path = %previous.display(), error = %e, "Failed to remove previous scripts");
        }
    }
    Ok(())
}

impl TestScriptStore for FsScriptStore {
    fn find_test_scripts(&self, origin: &str, assignment_id: u64) -> Result<Option<PathBuf>> {
        let dir = self.assignment_dir(origin, assignment_id);
        Ok(dir.is_dir().then_some(dir))
    }

    fn load_specs(&self, origin: &str, assignment_id: u64) -> Result<TestSpecs> {
        let path = self
            .assignment_dir(origin, assignment_id)
            .join(SPECS_FILE_NAME);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(AutotestError::TestScriptFiles)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_assignment() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        assert!(store.find_test_scripts("o", 1).unwrap().is_none());
        assert!(matches!(
            store.load_specs("o", 1),
            Err(AutotestError::TestScriptFiles)
        ));
    }

    #[test]
    fn test_install_then_load() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        let specs = json!({"testers": [{"test_data": [{"category": ["a"], "timeout": 5}]}]});

        let dir = store.install_specs("http://m/x", 4, &specs, None).unwrap();
        assert_eq!(store.find_test_scripts("http://m/x", 4).unwrap(), Some(dir.clone()));
        assert!(dir.starts_with(root.path()));
        assert!(!dir.join(format!(".{}.tmp", SPECS_FILE_NAME)).exists());

        let loaded = store.load_specs("http://m/x", 4).unwrap();
        assert_eq!(loaded.testers[0].test_data[0].timeout, Some(5));
    }

    #[test]
    fn test_install_moves_new_files_into_place() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path().join("scripts"));
        store
            .install_specs("o", 1, &json!({"testers": []}), None)
            .unwrap();
        fs::write(store.assignment_dir("o", 1).join("old.py"), "").unwrap();

        let upload = root.path().join("upload");
        fs::create_dir_all(&upload).unwrap();
        fs::write(upload.join("test.py"), "assert True").unwrap();

        let dir = store
            .install_specs("o", 1, &json!({"testers": []}), Some(&upload))
            .unwrap();
        assert!(!upload.exists());
        assert!(dir.join("test.py").exists());
        assert!(!dir.join("old.py").exists());
        assert!(dir.join(SPECS_FILE_NAME).exists());

        let leftovers: Vec<_> = fs::read_dir(dir.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("1")]);
    }

    #[test]
    fn test_failed_install_keeps_previous_scripts() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path().join("scripts"));
        let old = json!({"testers": [{"test_data": [{"category": ["a"], "timeout": 7}]}]});
        let dir = store.install_specs("o", 1, &old, None).unwrap();
        fs::write(dir.join("old.py"), "").unwrap();

        let missing = root.path().join("no-such-upload");
        let err = store
            .install_specs("o", 1, &json!({"testers": []}), Some(&missing))
            .unwrap_err();
        assert!(matches!(err, AutotestError::Io(_)));

        assert_eq!(store.find_test_scripts("o", 1).unwrap(), Some(dir.clone()));
        assert!(dir.join("old.py").exists());
        assert_eq!(store.load_specs("o", 1).unwrap().testers[0].test_data[0].timeout, Some(7));
    }

    #[test]
    fn test_swap_in_first_install() {
        let root = tempfile::tempdir().unwrap();
        let staged = root.path().join(".3.incoming");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("t.py"), "").unwrap();

        let dir = root.path().join("3");
        swap_in(&staged, &dir).unwrap();
        assert!(dir.join("t.py").exists());
        assert!(!staged.exists());
        assert!(!root.path().join(".3.previous").exists());
    }

    #[test]
    fn test_corrupt_specs_file() {
        let root = tempfile::tempdir().unwrap();
        let store = FsScriptStore::new(root.path());
        let dir = store.assignment_dir("o", 2);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SPECS_FILE_NAME), "{not json").unwrap();
        assert!(matches!(store.load_specs("o", 2), Err(AutotestError::Json(_))));
    }
}
