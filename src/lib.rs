pub mod agent;
pub mod browser;
pub mod detect;
pub mod gate;
pub mod llm;
pub mod logging;
pub mod recorder;
pub mod snapshot;
pub mod store;
pub mod task;
pub mod workflow;

pub use agent::{Action, ActionKind, Agent, AgentConfig, AgentError, Locator, Observation, Proposal};
pub use browser::{BrowserConfig, ChromiumComputer};
pub use detect::{ChangeDetector, Classification, LoginRule};
pub use gate::{LoginGate, LoginPauseEvent};
pub use llm::{LlmClient, LlmConfig, LlmReasoner};
pub use store::DiskStore;
pub use task::{AppProfile, ConstraintSet, Task};
pub use workflow::{TaskOutcome, WorkflowDataset};
