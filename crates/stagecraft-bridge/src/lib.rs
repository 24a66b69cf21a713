//! Stagecraft Bridge - scene assembly from session artifacts
//!
//! Reads the asset manifest, layout solution and object map of a session,
//! produces a deterministic assembly script, and optionally runs it in a
//! headless authoring tool.

pub mod dispatch;
pub mod script;

pub use dispatch::{dispatch, run_script, ExecutionReport, ExecutorEndpoint};
pub use script::{
    assemble_session, build_assembly_script, AssemblyOptions, AssemblyScript, ImportFormat,
    Instruction, SCENE_FILE, SCRIPT_FILE,
};
