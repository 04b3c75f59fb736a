//! Loading pipeline definitions from disk and delivering file outputs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tracing::info;

use pipewright_core::node::NodeConfig;
use pipewright_core::pipeline::Pipeline;
use pipewright_core::run::{PipelineRun, ResultStatus};
use pipewright_engine::template::stringify;

/// Load a pipeline definition. `.toml` files are read as TOML, everything
/// else as JSON.
pub fn load(path: &Path) -> anyhow::Result<Pipeline> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
    let pipeline: Pipeline = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("Invalid pipeline TOML in {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Invalid pipeline JSON in {}", path.display()))?,
    };
    if pipeline.nodes.is_empty() {
        bail!("Pipeline '{}' has no nodes", pipeline.id);
    }
    Ok(pipeline)
}

/// Write the output of every successful `output` node whose destination is
/// `file`. Relative paths resolve against `base`. Returns the written files.
pub fn write_file_outputs(
    pipeline: &Pipeline,
    run: &PipelineRun,
    base: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for node in &pipeline.nodes {
        let NodeConfig::Output(action) = &node.config else {
            continue;
        };
        if action.destination.as_deref() != Some("file") {
            continue;
        }
        let Some(path) = &action.path else {
            bail!("Output node '{}' writes to a file but has no path", node.id);
        };
        let Some(result) = run
            .results_for(&node.id)
            .filter(|r| r.status == ResultStatus::Success)
            .last()
        else {
            continue;
        };

        let target = base.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let body = result.output.as_ref().map(stringify).unwrap_or_default();
        std::fs::write(&target, body)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        info!(node_id = %node.id, path = %target.display(), "Output written");
        written.push(target);
    }
    Ok(written)
}
