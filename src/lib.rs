pub mod agent;
pub mod browser;
pub mod driver;
pub mod executor;
pub mod inventory;
pub mod llm;
pub mod runner;
pub mod testing;
pub mod tools;

pub use agent::{Agent, AgentConfig, AgentError, ChatModel, RunReport, RunStatus};
pub use browser::{Browser, BrowserConfig};
pub use driver::{DriverError, PageDriver};
pub use executor::{ActionOutcome, ExecutorConfig, FieldAction, SelectorExecutor};
pub use inventory::{DomInventoryItem, TargetArea};
pub use llm::{LlmClient, LlmConfig};
pub use runner::{run_session, run_task, RunnerConfig, SessionConfig};
pub use tools::{ToolConfig, ToolError, Toolbox};
