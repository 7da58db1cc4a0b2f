use anyhow::Result;
use flowcap::gate::resume_on_enter;
use flowcap::{logging, Agent, AgentConfig, BrowserConfig, ChromiumComputer, DiskStore, LlmClient, LlmConfig, LlmReasoner, Task};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let browser_cfg = BrowserConfig { headless: false, ..Default::default() };
    let computer = match std::env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => ChromiumComputer::connect(&ws, browser_cfg).await?,
        _ => ChromiumComputer::launch(browser_cfg).await?,
    };
    let reasoner = LlmReasoner::new(LlmClient::new(LlmConfig::default())?);
    let cfg = AgentConfig::from_env();
    let store = Arc::new(DiskStore::new(&cfg.output_dir));
    let mut agent = Agent::new(computer, reasoner, cfg).with_store(store);

    let _console = resume_on_enter(agent.login_gate());
    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let tasks: Vec<Task> = [
        "How do I create a project in Linear?",
        "How do I filter issues by status in Linear?",
        "How do I create a table database named Sprint Tracker in Notion?",
    ]
    .into_iter()
    .map(Task::from_query)
    .collect();

    for ds in agent.run_all(&tasks).await {
        println!(
            "{} -> success={} steps={} pauses={}",
            ds.task_id,
            ds.success,
            ds.steps.len(),
            ds.login_pauses.len()
        );
    }
    Ok(())
}
