//! Role strategies and built-in capabilities for the FinSight pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use finsight_core::{Capability, CapabilityRegistry, RegistryError, RoleSet, SharedMemory};

mod analyzer;
mod chart;
mod collector;
mod datasets;
mod generator;
mod prompt;
mod search;

pub use analyzer::AnalyzerAgent;
pub use chart::{ChartCapability, DRAW_CHART};
pub use collector::CollectorAgent;
pub use datasets::{LOAD_DATASET, LocalDatasets};
pub use generator::ReportGenerator;
pub use prompt::{ACTION_PROTOCOL, TOOL_ONLY_PROTOCOL};
pub use search::{MEMORY_SEARCH, MemorySearch};

/// Collector, analyzer and report generator.
pub fn default_roles() -> RoleSet {
    RoleSet {
        collector: Arc::new(CollectorAgent::new()),
        analyzer: Arc::new(AnalyzerAgent::new()),
        generator: Arc::new(ReportGenerator::new()),
    }
}

/// Inputs for the built-in capability set.
pub struct BuiltinCapabilities {
    pub memory: Arc<SharedMemory>,
    pub chart: Option<ChartCapability>,
    pub dataset_dir: Option<PathBuf>,
}

impl BuiltinCapabilities {
    pub fn into_capabilities(self) -> Vec<Arc<dyn Capability>> {
        let mut capabilities: Vec<Arc<dyn Capability>> = vec![Arc::new(MemorySearch::new(self.memory))];
        if let Some(chart) = self.chart {
            capabilities.push(Arc::new(chart));
        }
        if let Some(dir) = self.dataset_dir {
            capabilities.push(Arc::new(LocalDatasets::new(dir)));
        }
        capabilities
    }
}

/// Register the built-in set. Plugin sets go through
/// [`CapabilityRegistry::register_plugins`] afterwards.
pub fn register_builtin(
    registry: &mut CapabilityRegistry,
    builtin: BuiltinCapabilities,
) -> Result<(), RegistryError> {
    for capability in builtin.into_capabilities() {
        registry.register(capability)?;
    }
    Ok(())
}
