// Stage Pipeline Module
// The five-stage orchestration pipeline and its per-stage records

pub mod handlers;
pub mod models;
pub mod pipeline;
pub mod presentation;

pub use handlers::{RunState, StageHandler};
pub use models::{StageDiagnostics, StageInput, StageName, StageOutput, StagePayload, StageStatus};
pub use pipeline::{PipelineRun, StagePipeline};
pub use presentation::PresentationBlock;
