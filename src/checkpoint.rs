use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Keeps at most one checkpoint per run on disk. Files are named
/// `<base_name>_<best_mae>` (the recorder appends its own extension); every
/// file matching the run's `<base_name>_` prefix is deleted before the
/// replacement is written. The delete-then-write order is not atomic — an
/// interruption in between loses the checkpoint.
pub struct CheckpointKeeper {
    models_dir: PathBuf,
    base_name: String,
}

impl CheckpointKeeper {
    pub fn new(models_dir: PathBuf, base_name: String) -> Result<Self> {
        fs::create_dir_all(&models_dir)
            .with_context(|| format!("cannot create '{}'", models_dir.display()))?;
        Ok(Self {
            models_dir,
            base_name,
        })
    }

    /// Deletes this run's previous checkpoints, then hands the new
    /// checkpoint path to `save`. Returns the path (extension-less).
    pub fn replace(
        &self,
        best_mae: f64,
        save: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<PathBuf> {
        // The trailing underscore keeps e.g. a size-2240 run's files out of
        // a size-224 run's prefix.
        let prefix = format!("{}_", self.base_name);

        for entry in fs::read_dir(&self.models_dir)
            .with_context(|| format!("cannot read '{}'", self.models_dir.display()))?
        {
            let path = entry?.path();
            let matches_run = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(&prefix));
            if matches_run {
                tracing::debug!("deleting checkpoint '{}'", path.display());
                fs::remove_file(&path)
                    .with_context(|| format!("cannot delete '{}'", path.display()))?;
            }
        }

        let path = self.models_dir.join(format!("{prefix}{best_mae}"));
        save(&path)?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_save(path: &Path) -> Result<()> {
        // Mimics the recorder, which appends its own extension.
        fs::write(format!("{}.mpk", path.display()), b"weights")?;
        Ok(())
    }

    #[test]
    fn only_the_latest_best_checkpoint_survives() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = CheckpointKeeper::new(
            dir.path().to_path_buf(),
            "embednet_224".to_string(),
        )
        .unwrap();

        keeper.replace(5.5, fake_save).unwrap();
        keeper.replace(3.25, fake_save).unwrap();

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();

        assert_eq!(files, vec!["embednet_224_3.25.mpk".to_string()]);
    }

    #[test]
    fn checkpoint_name_embeds_the_raw_mae() {
        let dir = tempfile::tempdir().unwrap();
        let keeper =
            CheckpointKeeper::new(dir.path().to_path_buf(), "embednet_224".to_string()).unwrap();

        let path = keeper.replace(2.125, fake_save).unwrap();
        assert_eq!(path, dir.path().join("embednet_224_2.125"));
    }

    #[test]
    fn other_runs_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("embednet_1024_2.5.mpk"), b"other size").unwrap();
        fs::write(dir.path().join("embednet_2240_1.5.mpk"), b"other size").unwrap();

        let keeper = CheckpointKeeper::new(
            dir.path().to_path_buf(),
            "embednet_224".to_string(),
        )
        .unwrap();
        keeper.replace(4.5, fake_save).unwrap();

        let mut files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();

        assert_eq!(
            files,
            vec![
                "embednet_1024_2.5.mpk".to_string(),
                "embednet_224_4.5.mpk".to_string(),
                "embednet_2240_1.5.mpk".to_string(),
            ]
        );
    }

    #[test]
    fn save_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let keeper =
            CheckpointKeeper::new(dir.path().to_path_buf(), "embednet_224".to_string()).unwrap();

        let result = keeper.replace(1.0, |_| anyhow::bail!("disk full"));
        assert!(result.is_err());
    }
}
