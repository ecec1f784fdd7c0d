use anyhow::Result;
use formhands::{run_task, RunnerConfig};
use tracing_subscriber::EnvFilter;

const TASK: &str = "Go to https://ui.chaicode.com/auth/signup and create an account: \
first name Bruce, last name Wayne, email test@example.com, password Qwerty@123, \
confirm password Qwerty@123. Then click the Create Account button.";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut cfg = RunnerConfig::default();
    cfg.browser.headless = false;
    let report = run_task(cfg, TASK).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
