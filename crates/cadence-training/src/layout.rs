use crate::error::{TrainingError, TrainingResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Filesystem layout of one training run:
///
/// ```text
/// <root>/models/   checkpoints keyed by step
/// <root>/summary/  append-only diagnostic events
/// <root>/source/   configuration and source snapshot
/// ```
#[derive(Debug, Clone)]
pub struct ResultsLayout {
    root: PathBuf,
}

impl ResultsLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    #[must_use]
    pub fn summary_dir(&self) -> PathBuf {
        self.root.join("summary")
    }

    #[must_use]
    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    /// Creates the run directories.
    ///
    /// An existing root is an error unless `overwrite` is set, in which case it is removed
    /// with all of its contents first. Nothing is created when the check fails.
    pub fn prepare(&self, overwrite: bool) -> TrainingResult<()> {
        if overwrite {
            match fs::remove_dir_all(&self.root) {
                Ok(()) => info!(root = %self.root.display(), "Removed existing results folder"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else if self.root.exists() {
            return Err(TrainingError::Config(format!(
                "the folder \"{}\" already exists",
                self.root.display()
            )));
        }

        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.models_dir())?;
        fs::create_dir_all(self.summary_dir())?;
        fs::create_dir_all(self.source_dir())?;
        Ok(())
    }

    pub fn write_source_file(&self, name: &str, contents: &str) -> TrainingResult<PathBuf> {
        let path = self.source_dir().join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Copies the top-level files of `from` whose extension is in `extensions` into `source/`.
    pub fn snapshot_sources(&self, from: &Path, extensions: &[String]) -> TrainingResult<usize> {
        let mut copied = 0;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)) {
                continue;
            }
            fs::copy(&path, self.source_dir().join(entry.file_name()))?;
            debug!(file = %path.display(), "Snapshotted source file");
            copied += 1;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_subtrees() {
        let temp = TempDir::new().unwrap();
        let layout = ResultsLayout::new(temp.path().join("run"));
        layout.prepare(false).unwrap();

        assert!(layout.models_dir().is_dir());
        assert!(layout.summary_dir().is_dir());
        assert!(layout.source_dir().is_dir());
    }

    #[test]
    fn test_existing_root_without_overwrite_fails_before_creating_anything() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("run");
        fs::create_dir_all(&root).unwrap();

        let err = ResultsLayout::new(&root).prepare(false).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_overwrite_removes_previous_contents() {
        let temp = TempDir::new().unwrap();
        let layout = ResultsLayout::new(temp.path().join("run"));
        layout.prepare(false).unwrap();
        fs::write(layout.models_dir().join("stale.ckpt"), b"old").unwrap();

        layout.prepare(true).unwrap();
        assert!(layout.models_dir().is_dir());
        assert!(!layout.models_dir().join("stale.ckpt").exists());
    }

    #[test]
    fn test_snapshot_sources_filters_by_extension() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("main.rs"), "fn main() {}").unwrap();
        fs::write(src.join("Cargo.TOML"), "[package]").unwrap();
        fs::write(src.join("notes.txt"), "skip").unwrap();
        fs::write(src.join("nested").join("deep.rs"), "skip").unwrap();

        let layout = ResultsLayout::new(temp.path().join("run"));
        layout.prepare(false).unwrap();
        let copied = layout.snapshot_sources(&src, &["rs".to_string(), "toml".to_string()]).unwrap();

        assert_eq!(copied, 2);
        assert!(layout.source_dir().join("main.rs").exists());
        assert!(!layout.source_dir().join("notes.txt").exists());
        assert!(!layout.source_dir().join("deep.rs").exists());
    }
}
