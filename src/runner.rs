use tracing::{info, warn};

use crate::agent::{Agent, AgentConfig, AgentError, ChatModel, RunReport};
use crate::browser::{Browser, BrowserConfig};
use crate::driver::PageDriver;
use crate::executor::{ExecutorConfig, SelectorExecutor};
use crate::llm::{LlmClient, LlmConfig};
use crate::tools::{ToolConfig, Toolbox};

/// Everything one run needs besides the browser and the model.
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    pub executor: ExecutorConfig,
    pub tools: ToolConfig,
    pub agent: AgentConfig,
}

#[derive(Clone, Debug, Default)]
pub struct RunnerConfig {
    pub browser: BrowserConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
}

/// Run one task against an open session and release the session afterwards,
/// whether the run succeeded or not.
pub async fn run_session<D, M>(
    driver: &D,
    model: M,
    cfg: SessionConfig,
    task: &str,
) -> Result<RunReport, AgentError>
where
    D: PageDriver + ?Sized,
    M: ChatModel,
{
    let result = {
        let tools = Toolbox::new(driver, SelectorExecutor::new(cfg.executor), cfg.tools);
        Agent::new(model, cfg.agent).run(&tools, task).await
    };
    if let Err(e) = driver.close().await {
        warn!("failed to release browser session: {}", e);
    }
    match &result {
        Ok(report) => info!(run_id = %report.run_id, status = ?report.status, turns = report.turns, "run finished"),
        Err(e) => warn!("run failed: {}", e),
    }
    result
}

/// Launch Chromium, talk to the configured model, and run `task`.
pub async fn run_task(cfg: RunnerConfig, task: &str) -> anyhow::Result<RunReport> {
    // Validate the model config before a browser exists to leak.
    let model = LlmClient::new(cfg.llm)?;
    info!(model = model.model(), "starting run");
    let browser = Browser::launch(cfg.browser).await?;
    Ok(run_session(&browser, model, cfg.session, task).await?)
}
