use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use formhands::{run_task, RunStatus, RunnerConfig};

#[derive(Parser)]
#[command(name = "formhands", version, about = "Fill and submit web forms with an LLM driving Chromium")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single natural-language task
    Run {
        #[arg(short, long)]
        task: String,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
        #[arg(long)]
        max_turns: Option<usize>,
        #[arg(long)]
        screenshot_dir: Option<PathBuf>,
        /// Overrides OPENAI_MODEL
        #[arg(long)]
        model: Option<String>,
        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task,
            headed,
            max_turns,
            screenshot_dir,
            model,
            json,
        } => {
            let mut cfg = RunnerConfig::default();
            cfg.browser.headless = !headed;
            if let Some(n) = max_turns {
                cfg.session.agent.max_turns = n;
            }
            if let Some(dir) = screenshot_dir {
                cfg.session.tools.screenshot_dir = dir;
            }
            if let Some(m) = model {
                cfg.llm.model = m;
            }

            let report = run_task(cfg, &task).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                match (&report.status, &report.final_output) {
                    (RunStatus::Success, Some(out)) => println!("{out}"),
                    _ => println!("stopped after {} turns without a final answer", report.turns),
                }
            }
            if matches!(report.status, RunStatus::TurnBudgetExceeded) {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}
