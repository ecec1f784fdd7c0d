use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::driver::{DriverError, PageDriver};
use crate::llm::{ChatMessage, LlmError, ModelTurn};
use crate::tools::{self, ToolError, Toolbox};

// ========================= Core Types =========================

pub const DEFAULT_INSTRUCTIONS: &str = r#"You are a browser automation agent that works through DOM tools.

Workflow:
1. Open the given URL with open_url.
2. Call analyze_dom_elements to learn the form fields and buttons, then take_screenshot.
3. For each field, call populate_form_field with several selectors taken from the
   inventory, most reliable first: #id, [name="..."], [placeholder="..."],
   tag[type="..."], then class selectors.
4. Click the submit button with trigger_element_action, again passing several selectors.
5. Take a final screenshot and reply with a short summary of what was done.

If a tool reports that every selector failed, inspect the page again before retrying;
the DOM may have changed."#;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RunStatus {
    Success,
    TurnBudgetExceeded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepLog {
    pub turn: usize,
    pub tool: String,
    pub arguments: Value,
    pub output: String,
    pub is_error: bool,
    pub elapsed_ms: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    pub final_output: Option<String>,
    pub turns: usize,
    pub steps: Vec<StepLog>,
    pub time_ms: u128,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model error: {0}")]
    Model(#[from] LlmError),
    #[error("browser session lost: {0}")]
    Session(DriverError),
}

// ========================= Pluggable Subsystems =========================

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], tools: &Value) -> Result<ModelTurn, LlmError>;
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_turns: usize,
    pub instructions: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
        }
    }
}

pub struct Agent<M: ChatModel> {
    model: M,
    cfg: AgentConfig,
}

impl<M: ChatModel> Agent<M> {
    pub fn new(model: M, cfg: AgentConfig) -> Self {
        Self { model, cfg }
    }

    /// Drive the model until it answers without tool calls or the turn budget
    /// runs out. Tool calls run one at a time, in the order the model issued
    /// them.
    pub async fn run<D>(&self, tools: &Toolbox<'_, D>, task: &str) -> Result<RunReport, AgentError>
    where
        D: PageDriver + ?Sized,
    {
        let run_id = nanoid!();
        let start = Instant::now();
        let definitions = tools::definitions();
        let mut steps: Vec<StepLog> = Vec::new();
        let mut messages = vec![
            ChatMessage::system(self.cfg.instructions.clone()),
            ChatMessage::user(task),
        ];
        info!(run_id = %run_id, max_turns = self.cfg.max_turns, "agent run started");

        for turn in 0..self.cfg.max_turns {
            let reply = self.model.complete(&messages, &definitions).await?;
            match reply {
                ModelTurn::Message { text } => {
                    info!(turn, "agent finished: {}", text.trim());
                    return Ok(RunReport {
                        run_id,
                        task: task.to_string(),
                        status: RunStatus::Success,
                        final_output: Some(text),
                        turns: turn + 1,
                        steps,
                        time_ms: start.elapsed().as_millis(),
                    });
                }
                ModelTurn::ToolCalls { text, calls } => {
                    if let Some(t) = &text {
                        info!(turn, "agent message: {}", t.trim());
                    }
                    messages.push(ChatMessage::assistant_tool_calls(text, calls.clone()));
                    for call in &calls {
                        let step_start = Instant::now();
                        let name = call.function.name.as_str();
                        let parsed = parse_arguments(&call.function.arguments);
                        let arguments = parsed.as_ref().ok().cloned().unwrap_or(Value::Null);
                        info!(turn, tool = name, args = %call.function.arguments, "tool call");
                        let result = match parsed {
                            Ok(args) => tools.call(name, args).await,
                            Err(e) => Err(e),
                        };
                        let (output, is_error) = match result {
                            Ok(v) => (v.to_string(), false),
                            Err(ToolError::Fatal(e)) => {
                                warn!(turn, tool = name, "session lost: {}", e);
                                return Err(AgentError::Session(e));
                            }
                            Err(e) => {
                                warn!(turn, tool = name, "tool failed: {}", e);
                                (format!("Error: {e}"), true)
                            }
                        };
                        steps.push(StepLog {
                            turn,
                            tool: name.to_string(),
                            arguments,
                            output: output.clone(),
                            is_error,
                            elapsed_ms: step_start.elapsed().as_millis(),
                        });
                        messages.push(ChatMessage::tool(call.id.clone(), output));
                    }
                }
            }
        }

        warn!(run_id = %run_id, "turn budget exceeded");
        Ok(RunReport {
            run_id,
            task: task.to_string(),
            status: RunStatus::TurnBudgetExceeded,
            final_output: None,
            turns: self.cfg.max_turns,
            steps,
            time_ms: start.elapsed().as_millis(),
        })
    }
}

fn parse_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(format!("arguments are not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorConfig, SelectorExecutor};
    use crate::testing::{FakeElement, FakePage, ScriptedModel};
    use crate::tools::ToolConfig;
    use std::time::Duration;

    fn toolbox<'d>(page: &'d FakePage, dir: &std::path::Path) -> Toolbox<'d, FakePage> {
        Toolbox::new(
            page,
            SelectorExecutor::new(ExecutorConfig {
                candidate_timeout: Duration::from_millis(10),
                poll_interval: Duration::from_millis(1),
                verify_window: Duration::from_millis(5),
            }),
            ToolConfig {
                screenshot_dir: dir.to_path_buf(),
                settle_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn runs_tool_calls_then_returns_final_message() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage::new(vec![
            FakeElement::new("input").id("email").name("email"),
            FakeElement::new("button").class("btn-submit").text("Go"),
        ]);
        let model = ScriptedModel::new(vec![
            ScriptedModel::calls(&[("open_url", r#"{"url":"https://example.com"}"#)]),
            ScriptedModel::calls(&[
                ("populate_form_field", r##"{"targetSelectors":["#missing","#email"],"inputData":"a@b.com"}"##),
                ("trigger_element_action", r##"{"elementSelectors":["#submit",".btn-submit"]}"##),
            ]),
            ScriptedModel::message("Form submitted."),
        ]);
        let agent = Agent::new(model.clone(), AgentConfig::default());
        let report = agent.run(&toolbox(&page, dir.path()), "sign up").await.unwrap();

        assert!(matches!(report.status, RunStatus::Success));
        assert_eq!(report.final_output.as_deref(), Some("Form submitted."));
        assert_eq!(report.turns, 3);
        let tools_run: Vec<_> = report.steps.iter().map(|s| s.tool.as_str()).collect();
        assert_eq!(tools_run, vec!["open_url", "populate_form_field", "trigger_element_action"]);
        assert!(report.steps.iter().all(|s| !s.is_error));
        assert_eq!(page.value_of("#email").as_deref(), Some("a@b.com"));
        assert_eq!(page.clicks_of(".btn-submit"), 1);

        // Each tool result is fed back under its call id, in order.
        let conversations = model.seen();
        let last = conversations.last().unwrap();
        let tool_ids: Vec<_> = last
            .iter()
            .filter(|m| m.role == "tool")
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(tool_ids, vec!["call_0_0", "call_1_0", "call_1_1"]);
    }

    #[tokio::test]
    async fn tool_errors_go_back_to_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage::new(vec![]);
        let model = ScriptedModel::new(vec![
            ScriptedModel::calls(&[
                ("trigger_element_action", r##"{"elementSelectors":["#nope"]}"##),
                ("click_screen", "{}"),
                ("open_url", "{not json"),
            ]),
            ScriptedModel::message("Could not find the button."),
        ]);
        let report = Agent::new(model.clone(), AgentConfig::default())
            .run(&toolbox(&page, dir.path()), "click it")
            .await
            .unwrap();
        assert!(matches!(report.status, RunStatus::Success));
        assert_eq!(report.steps.len(), 3);
        assert!(report.steps.iter().all(|s| s.is_error));
        assert!(report.steps[0].output.contains("#nope: not found/visible"));
        assert!(report.steps[1].output.contains("unknown tool: click_screen"));
        assert!(report.steps[2].output.contains("arguments are not JSON"));
    }

    #[tokio::test]
    async fn lost_session_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage::new(vec![]);
        page.close().await.unwrap();
        let model = ScriptedModel::new(vec![
            ScriptedModel::calls(&[("take_screenshot", "{}")]),
            ScriptedModel::message("unreachable"),
        ]);
        let err = Agent::new(model, AgentConfig::default())
            .run(&toolbox(&page, dir.path()), "look")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Session(DriverError::SessionClosed)));
    }

    #[tokio::test]
    async fn stops_at_turn_budget() {
        let dir = tempfile::tempdir().unwrap();
        let page = FakePage::new(vec![]);
        let model = ScriptedModel::new(vec![
            ScriptedModel::calls(&[("take_screenshot", "")]),
            ScriptedModel::calls(&[("take_screenshot", "")]),
            ScriptedModel::calls(&[("take_screenshot", "")]),
        ]);
        let cfg = AgentConfig {
            max_turns: 2,
            ..AgentConfig::default()
        };
        let report = Agent::new(model, cfg).run(&toolbox(&page, dir.path()), "loop").await.unwrap();
        assert!(matches!(report.status, RunStatus::TurnBudgetExceeded));
        assert_eq!(report.steps.len(), 2);
        assert_eq!(page.screenshots(), 2);
    }
}
