//! CLI command implementations

pub mod assemble;
pub mod batch;
pub mod dispatch;
pub mod generate;
pub mod session;

use anyhow::Result;
use clap::Args;
use stagecraft_gen::{BackendOrchestrator, StagecraftConfig};

/// Backend selection shared by the generation commands
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Backend priority: auto, a backend name, or a comma list (hunyuan,sf3d)
    #[arg(long, default_value = "auto")]
    pub backend: String,
}

pub(crate) fn load_orchestrator() -> Result<(StagecraftConfig, BackendOrchestrator)> {
    let config = StagecraftConfig::load()?;
    let orchestrator = BackendOrchestrator::from_config(&config);
    Ok((config, orchestrator))
}
