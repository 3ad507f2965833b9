pub mod error;
pub mod moderation;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod transform;
pub mod truncate;

pub use error::EngineError;
pub use moderation::{ModerationConfig, ModerationDecision, ModerationError, ModerationGate};
pub use registry::ToolRegistry;
pub use runner::{EventStream, GenerationLoop, LoopConfig, ModelConfig, DEFAULT_STEP_BUDGET};
pub use sink::{BracketChecker, EventReceiver, EventSender, SinkClosed, DEFAULT_SINK_CAPACITY};
pub use transform::transform;
