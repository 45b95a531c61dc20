use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use tracing::{info, warn};

use crate::inference::phi::index_shard_names;

const OPTIONAL_FILES: &[&str] = &["tokenizer_config.json", "generation_config.json"];

/// Directory holding the base model: `name` itself when it is a local
/// directory, otherwise the Hugging Face Hub snapshot of repo `name`.
pub fn resolve_base_model(name: &str) -> Result<PathBuf> {
    let local = Path::new(name);
    if local.is_dir() {
        info!(path = %local.display(), "using local base model");
        return Ok(local.to_path_buf());
    }

    info!(repo = name, "fetching base model from the Hugging Face Hub");
    let api = Api::new().context("failed to initialise the Hugging Face Hub client")?;
    let repo = api.model(name.to_string());

    let config = repo
        .get("config.json")
        .with_context(|| format!("{name}: config.json not available"))?;
    repo.get("tokenizer.json")
        .with_context(|| format!("{name}: tokenizer.json not available"))?;

    for file in OPTIONAL_FILES {
        if let Err(err) = repo.get(file) {
            warn!(repo = name, file, %err, "optional file not fetched");
        }
    }

    match repo.get("model.safetensors.index.json") {
        Ok(index) => {
            let shards = index_shard_names(&index)?;
            info!(repo = name, shards = shards.len(), "downloading sharded weights");
            for shard in shards {
                repo.get(&shard)
                    .with_context(|| format!("{name}: shard {shard} not available"))?;
            }
        }
        Err(_) => {
            repo.get("model.safetensors")
                .with_context(|| format!("{name}: no safetensors weights found"))?;
        }
    }

    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("snapshot path has no parent: {}", config.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_root;
    use std::fs;

    #[test]
    fn local_directory_wins() {
        let dir = temp_root("base-local");
        let resolved = resolve_base_model(dir.to_str().unwrap()).unwrap();
        assert_eq!(resolved, dir);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn shard_names_are_deduplicated() {
        let dir = temp_root("base-index");
        let index = dir.join("model.safetensors.index.json");
        fs::write(
            &index,
            r#"{"weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "b": "model-00002-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let names = index_shard_names(&index).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("model-00002-of-00002.safetensors"));

        let files = crate::inference::phi::find_weight_files(&dir).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], dir.join("model-00001-of-00002.safetensors"));
        fs::remove_dir_all(dir).ok();
    }
}
