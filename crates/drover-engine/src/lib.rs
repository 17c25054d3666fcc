// drover-engine: drives one pipeline's lifecycle on a leased VM.
//
// Setup leases an instance, waits for the container runtime, and
// stages global files; Run uploads per-step scripts (with a generated
// environment prelude) and executes them; Destroy hands the instance
// back to the pool manager.

pub mod engine;
pub mod script;
pub mod spec;
pub mod state;

pub use engine::Engine;
pub use spec::{PipelineSpec, Step, StepState};
pub use state::StepPhase;
