//! `load_dataset`: reads JSON datasets from a local directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use finsight_core::{
    Capability, CapabilityError, InvocationContext, ParamSpec, ParamType, ToolOutput,
};
use serde_json::{Map, Value};

pub const LOAD_DATASET: &str = "load_dataset";

/// Offline data source for collectors: every `*.json` file under `root` is
/// a dataset, named by its relative path.
pub struct LocalDatasets {
    root: PathBuf,
}

impl LocalDatasets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file: &str) -> Result<PathBuf, CapabilityError> {
        let relative = Path::new(file);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if file.is_empty() || escapes {
            return Err(CapabilityError::InvalidInput(format!(
                "'{file}' must be a relative path inside the dataset directory"
            )));
        }
        if relative.extension().and_then(|ext| ext.to_str()) != Some("json") {
            return Err(CapabilityError::InvalidInput(format!("'{file}' is not a .json dataset")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Capability for LocalDatasets {
    fn name(&self) -> &str {
        LOAD_DATASET
    }

    fn description(&self) -> &str {
        "Load a JSON dataset from the local dataset directory"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("file", ParamType::String)
            .describe("relative path of the .json file, e.g. acme/income_statement.json")]
    }

    fn category(&self) -> &str {
        "data"
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError> {
        let file = args.get("file").and_then(Value::as_str).unwrap_or_default().trim();
        let path = self.resolve(file)?;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| CapabilityError::Failed(format!("cannot read {file}: {err}")))?;
        let payload: Value = serde_json::from_str(&raw)
            .map_err(|err| CapabilityError::Failed(format!("{file} is not valid JSON: {err}")))?;
        let rows = payload.as_array().map(Vec::len);
        let description = match rows {
            Some(rows) => format!("Dataset {file} ({rows} rows)"),
            None => format!("Dataset {file}"),
        };
        let name = file.trim_end_matches(".json").replace(['/', '_'], " ");
        Ok(vec![ToolOutput::new(name, description, payload, format!("local:{file}"))])
    }
}
