use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use tracing::{debug, instrument};

use crate::EngineError;

/// Model configuration file of an engine directory
pub const CONFIG_FILE: &str = "config.json";
/// Index of sharded safetensors weights
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

const SAFETENSORS_EXTENSION: &str = "safetensors";

/// Fails with [`EngineError::EngineDirNotFound`] unless `engine_dir` is an existing directory.
pub fn ensure_engine_dir<P: AsRef<Path>>(engine_dir: P) -> Result<(), EngineError> {
    let engine_dir = engine_dir.as_ref();
    if engine_dir.is_dir() {
        Ok(())
    } else {
        Err(EngineError::EngineDirNotFound(engine_dir.to_path_buf()))
    }
}

/// The files an engine directory is made of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineFiles {
    /// Path to the model's `config.json`
    pub config: PathBuf,
    /// Safetensors weight files, in load order
    pub weights: Vec<PathBuf>,
}

impl EngineFiles {
    /// Locates the model config and weights inside `engine_dir`.
    ///
    /// Weights listed in `model.safetensors.index.json` take precedence, otherwise
    /// every `*.safetensors` file of the directory is used, sorted by name.
    #[instrument(level = "debug", skip_all, fields(engine_dir = %engine_dir.as_ref().display()))]
    pub fn discover<P: AsRef<Path>>(engine_dir: P) -> Result<Self, EngineError> {
        let engine_dir = engine_dir.as_ref();
        ensure_engine_dir(engine_dir)?;

        let config = engine_dir.join(CONFIG_FILE);
        if !config.is_file() {
            return Err(EngineError::MissingFile(config));
        }

        let index = engine_dir.join(WEIGHTS_INDEX_FILE);
        let weights = if index.is_file() {
            weights_from_index(engine_dir, &index)?
        } else {
            let mut weights = Vec::new();
            for entry in std::fs::read_dir(engine_dir)? {
                let path = entry?.path();
                if path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(SAFETENSORS_EXTENSION)
                {
                    weights.push(path);
                }
            }
            weights.sort();
            weights
        };

        if weights.is_empty() {
            return Err(EngineError::MissingWeights(engine_dir.to_path_buf()));
        }
        debug!(num_weight_files = weights.len(), "Discovered engine files");

        Ok(Self { config, weights })
    }
}

fn weights_from_index(engine_dir: &Path, index: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let json: serde_json::Value = serde_json::from_reader(std::fs::File::open(index)?)?;
    let weight_map = match json.get("weight_map") {
        None => {
            return Err(EngineError::InvalidWeightMap {
                path: index.to_path_buf(),
                reason: "no weight map".to_string(),
            })
        }
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            return Err(EngineError::InvalidWeightMap {
                path: index.to_path_buf(),
                reason: "weight map is not a map".to_string(),
            })
        }
    };
    let files = weight_map
        .values()
        .filter_map(|value| value.as_str())
        .collect::<BTreeSet<_>>();

    files
        .into_iter()
        .map(|file| {
            let path = engine_dir.join(file);
            if path.is_file() {
                Ok(path)
            } else {
                Err(EngineError::MissingFile(path))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_missing_engine_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("engine_output");
        assert!(matches!(
            ensure_engine_dir(&missing),
            Err(EngineError::EngineDirNotFound(path)) if path == missing
        ));
        assert!(matches!(
            EngineFiles::discover(&missing),
            Err(EngineError::EngineDirNotFound(_))
        ));
    }

    #[test]
    fn test_discover_sorted_safetensors() {
        let dir = tempdir().unwrap();
        let config = touch(dir.path(), CONFIG_FILE);
        let second = touch(dir.path(), "model-00002-of-00002.safetensors");
        let first = touch(dir.path(), "model-00001-of-00002.safetensors");
        touch(dir.path(), "tokenizer.json");

        let files = EngineFiles::discover(dir.path()).unwrap();
        assert_eq!(files.config, config);
        assert_eq!(files.weights, vec![first, second]);
    }

    #[test]
    fn test_discover_from_weight_map() {
        let dir = tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        let a = touch(dir.path(), "a.safetensors");
        let b = touch(dir.path(), "b.safetensors");
        touch(dir.path(), "unused.safetensors");
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"metadata": {}, "weight_map": {"x.weight": "b.safetensors", "y.weight": "a.safetensors", "z.weight": "b.safetensors"}}"#,
        )
        .unwrap();

        let files = EngineFiles::discover(dir.path()).unwrap();
        assert_eq!(files.weights, vec![a, b]);
    }

    #[test]
    fn test_weight_map_pointing_to_missing_file() {
        let dir = tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"x.weight": "gone.safetensors"}}"#,
        )
        .unwrap();

        assert!(matches!(
            EngineFiles::discover(dir.path()),
            Err(EngineError::MissingFile(path)) if path.ends_with("gone.safetensors")
        ));
    }

    #[test]
    fn test_invalid_weight_map() {
        let dir = tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        std::fs::write(dir.path().join(WEIGHTS_INDEX_FILE), r#"{"weight_map": []}"#).unwrap();

        assert!(matches!(
            EngineFiles::discover(dir.path()),
            Err(EngineError::InvalidWeightMap { .. })
        ));
    }

    #[test]
    fn test_missing_config_and_weights() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "model.safetensors");
        assert!(matches!(
            EngineFiles::discover(dir.path()),
            Err(EngineError::MissingFile(path)) if path.ends_with(CONFIG_FILE)
        ));

        let dir = tempdir().unwrap();
        touch(dir.path(), CONFIG_FILE);
        assert!(matches!(
            EngineFiles::discover(dir.path()),
            Err(EngineError::MissingWeights(_))
        ));
    }
}
