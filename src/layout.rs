//! Shared-storage path conventions.
//!
//! Output locations are deterministic so downstream stages never need to be
//! told paths explicitly: a stage writes under
//! `{shared_storage_path}/nodes/{node_name}/data/` with
//! `{artifact}_{workflow_id}[{variant}].{ext}` file names, and downstream
//! stages pick the absolute paths out of the producing stage's output map.

use std::path::{Path, PathBuf};

/// Path builder rooted at one workflow's `shared_storage_path`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    #[must_use]
    pub fn new(shared_storage_path: impl Into<PathBuf>) -> Self {
        Self {
            root: shared_storage_path.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The data directory a stage of `node_name` may write into.
    #[must_use]
    pub fn node_data_dir(&self, node_name: &str) -> PathBuf {
        self.root.join("nodes").join(node_name).join("data")
    }

    /// Default artifact path for a node output.
    #[must_use]
    pub fn artifact_path(
        &self,
        node_name: &str,
        artifact_kind: &str,
        workflow_id: &str,
        variant: Option<&str>,
        extension: &str,
    ) -> PathBuf {
        let file_name = match variant {
            Some(variant) => format!("{artifact_kind}_{workflow_id}{variant}.{extension}"),
            None => format!("{artifact_kind}_{workflow_id}.{extension}"),
        };
        self.node_data_dir(node_name).join(file_name)
    }

    /// Scratch directory for a stage's inference child.
    #[must_use]
    pub fn node_work_dir(&self, node_name: &str, stage_name: &str) -> PathBuf {
        self.root.join("nodes").join(node_name).join("work").join(stage_name)
    }

    /// Location of the optional context debugging dump.
    #[must_use]
    pub fn context_dump_path(&self) -> PathBuf {
        self.root.join("context.json")
    }

    /// Create a node's data directory if it does not exist yet.
    pub fn ensure_node_data_dir(&self, node_name: &str) -> std::io::Result<PathBuf> {
        let dir = self.node_data_dir(node_name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_follows_convention() {
        let layout = StorageLayout::new("/share/workflows/wf-A");

        let path = layout.artifact_path("asr.transcribe", "transcribe_data", "wf-A", None, "json");
        assert_eq!(
            path,
            PathBuf::from("/share/workflows/wf-A/nodes/asr.transcribe/data/transcribe_data_wf-A.json")
        );
    }

    #[test]
    fn variant_lands_between_id_and_extension() {
        let layout = StorageLayout::new("/share/workflows/wf-A");

        let path = layout.artifact_path("subtitle.rebuild", "subtitle", "wf-A", Some(".zh"), "srt");
        assert_eq!(
            path,
            PathBuf::from("/share/workflows/wf-A/nodes/subtitle.rebuild/data/subtitle_wf-A.zh.srt")
        );
    }

    #[test]
    fn context_dump_sits_at_workflow_root() {
        let layout = StorageLayout::new("/share/workflows/wf-A");
        assert_eq!(
            layout.context_dump_path(),
            PathBuf::from("/share/workflows/wf-A/context.json")
        );
    }
}
