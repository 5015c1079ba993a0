#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fuel_daemon::{
    AgentConfig, AppState, Collaborators, ConsumeRunner, EventBus, FuelConfig, MemoryEpicService,
    MemoryRunStore, MemoryTaskStore, TemplatePromptBuilder, YamlConfig,
};

/// An agent named `claude` that runs `sh -c <script>`.
pub fn sh_agent(script: &str) -> AgentConfig {
    AgentConfig::new("sh").with_args(["-c", script, "{prompt}"])
}

pub fn config_with(agent: AgentConfig) -> FuelConfig {
    let mut config = FuelConfig::default();
    config.agents.insert("claude".into(), agent);
    config
}

pub fn app_state(dir: &Path, config: FuelConfig) -> Arc<AppState> {
    let collaborators = Collaborators {
        tasks: Arc::new(MemoryTaskStore::new()),
        runs: Arc::new(MemoryRunStore::new()),
        config: Arc::new(YamlConfig::from_config(config)),
        prompts: Arc::new(TemplatePromptBuilder::new()),
        epics: Arc::new(MemoryEpicService::new(dir.join("mirrors"))),
    };
    AppState::new(dir, collaborators, EventBus::new("it"))
}

/// Tick `runner` every 50ms until `done` holds, for at most five seconds.
pub async fn tick_until<F, Fut>(runner: &mut ConsumeRunner, mut done: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        runner.tick().await;
        if done().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}
