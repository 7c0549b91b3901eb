//! Per-node artifact bundles: the durable outputs of every completed
//! mutation node, written under `<state>/work/<workId>/nodes/<nodeId>/`.

use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;

const RESULT_FILE: &str = "result.json";
const LOG_FILE: &str = "op.log";
const TRACE_REFS_FILE: &str = "trace.refs.json";
const DIFF_SUMMARY_FILE: &str = "diff.summary.json";
const VALIDATION_FILE: &str = "validation.json";

pub struct ArtifactBundle {
    dir: PathBuf,
}

impl ArtifactBundle {
    pub fn create(nodes_dir: &Path, node_id: &str) -> Result<Self> {
        let dir = nodes_dir.join(node_id);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json(&self, file: &str, value: &impl Serialize) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(self.dir.join(file), json)?;
        Ok(())
    }

    pub fn write_result(&self, value: &impl Serialize) -> Result<()> {
        self.write_json(RESULT_FILE, value)
    }

    pub fn write_log(&self, contents: &str) -> Result<()> {
        std::fs::write(self.dir.join(LOG_FILE), contents)?;
        Ok(())
    }

    pub fn write_trace_refs(&self, value: &impl Serialize) -> Result<()> {
        self.write_json(TRACE_REFS_FILE, value)
    }

    pub fn write_diff_summary(&self, value: &impl Serialize) -> Result<()> {
        self.write_json(DIFF_SUMMARY_FILE, value)
    }

    pub fn write_validation(&self, value: &impl Serialize) -> Result<()> {
        self.write_json(VALIDATION_FILE, value)
    }
}
