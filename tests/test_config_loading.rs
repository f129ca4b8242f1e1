//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading a TOML file and building
//! pipelines from it, not on TOML parsing details.

use agent_pipeline::completion::{CompletionProvider, ProviderFactory};
use agent_pipeline::config::{ConfigError, EngineConfig};
use agent_pipeline::orchestrator::WorkflowOrchestrator;
use agent_pipeline::services::InMemoryProposalSurface;
use agent_pipeline::testing::MockWorkItemService;
use agent_pipeline::PipelineError;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
[polling]
interval_secs = 15
max_consecutive_failures = 3
worker_pool_size = 2

[retry]
max_retries = 2
initial_backoff_ms = 100
backoff_multiplier = 3.0
max_backoff_ms = 1000
request_timeout_secs = 60

[proposals]
ttl_secs = 3600

[work_items]
base_url = "https://tracker.example.com/api"
token_env = "TRACKER_TOKEN"

[providers.chat]
api_key_env = "CONFIG_TEST_CHAT_KEY"
model = "claude-3-5-sonnet-20241022"

[providers.delegated_agent]
base_url = "https://agents.example.com/v1"

[[pipelines]]
project = "web"
complete_status = "Done"

[[pipelines.agents]]
name = "planner"
provider = "chat"
retries = 1
status_on_complete = "In Progress"
params = { instructions = "Write a plan" }

[[pipelines.agents]]
name = "coder"
provider = "delegated_agent"
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_full_config_loads() {
    let file = write_config(FULL_CONFIG);
    let config = EngineConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.polling.interval(), Duration::from_secs(15));
    assert_eq!(config.polling.max_consecutive_failures, 3);
    assert_eq!(config.retry.backoff_multiplier, 3.0);
    assert_eq!(config.proposals.ttl_secs, 3600);
    assert_eq!(config.work_items.as_ref().unwrap().timeout_secs, 30);

    let chat = config.providers.chat.as_ref().unwrap();
    assert_eq!(chat.base_url, "https://api.anthropic.com/v1");
    assert_eq!(chat.max_tokens, 4096);

    let pipeline = config.pipeline("web").unwrap();
    assert_eq!(pipeline.complete_status.as_deref(), Some("Done"));
    assert_eq!(pipeline.agents.len(), 2);
    assert_eq!(pipeline.agents[0].retries, 1);
    assert_eq!(pipeline.agents[0].instructions(), Some("Write a plan"));
    assert_eq!(pipeline.agents[1].retries, 0);
    assert!(config.pipeline("mobile").is_none());
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = EngineConfig::from_toml_str("").unwrap();

    assert_eq!(config.polling.interval_secs, 30);
    assert_eq!(config.polling.max_consecutive_failures, 5);
    assert_eq!(config.polling.worker_pool_size, 8);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.proposals.ttl_secs, 604_800);
    assert!(config.work_items.is_none());
    assert!(config.pipelines.is_empty());
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        "[polling]\ninterval_secs = 0",
        "[polling]\nworker_pool_size = 0",
        "[retry]\nbackoff_multiplier = 0.5",
        "[work_items]\nbase_url = \"not a url\"",
        "[[pipelines]]\nproject = \"web\"\nagents = []",
    ];

    for content in cases {
        let result = EngineConfig::from_toml_str(content);
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "expected rejection for:\n{content}"
        );
    }
}

#[test]
fn test_bad_agent_definitions_are_rejected() {
    let bad_name = r#"
[[pipelines]]
project = "web"
[[pipelines.agents]]
name = "plan ner"
provider = "chat"
"#;
    assert!(matches!(
        EngineConfig::from_toml_str(bad_name),
        Err(ConfigError::InvalidAgentId(_))
    ));

    let duplicate = r#"
[[pipelines]]
project = "web"
[[pipelines.agents]]
name = "planner"
provider = "chat"
[[pipelines.agents]]
name = "planner"
provider = "chat"
"#;
    assert!(matches!(
        EngineConfig::from_toml_str(duplicate),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_missing_file_and_bad_toml() {
    let missing = EngineConfig::load_from_file(std::path::Path::new("/nonexistent/pipeline.toml"));
    assert!(matches!(missing, Err(ConfigError::FileRead(_))));

    let file = write_config("[polling\ninterval_secs = ");
    assert!(matches!(
        EngineConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_factory_resolves_builtin_kinds() {
    std::env::set_var("CONFIG_TEST_CHAT_KEY", "sk-test");
    let config = EngineConfig::from_toml_str(FULL_CONFIG).unwrap();
    let factory = ProviderFactory::from_config(&config);

    assert_eq!(factory.kinds(), vec!["chat", "delegated_agent"]);

    let pipeline = factory
        .resolve_pipeline(config.pipeline("web").unwrap().clone())
        .unwrap();
    assert!(matches!(pipeline.stage(1), Some((_, CompletionProvider::Sync(_)))));
    assert!(matches!(pipeline.stage(2), Some((_, CompletionProvider::Async(_)))));
    assert!(pipeline.stage(3).is_none());
}

#[test]
fn test_missing_secret_fails_resolution() {
    let content = FULL_CONFIG.replace("CONFIG_TEST_CHAT_KEY", "CONFIG_TEST_UNSET_KEY");
    std::env::remove_var("CONFIG_TEST_UNSET_KEY");
    let config = EngineConfig::from_toml_str(&content).unwrap();
    let factory = ProviderFactory::from_config(&config);

    let result = factory.resolve_pipeline(config.pipeline("web").unwrap().clone());
    assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "CONFIG_TEST_UNSET_KEY"));
}

fn build(content: &str) -> Result<WorkflowOrchestrator, PipelineError> {
    let config = EngineConfig::from_toml_str(content).unwrap();
    WorkflowOrchestrator::from_config(
        &config,
        Arc::new(MockWorkItemService::new()),
        Arc::new(InMemoryProposalSurface::new()),
    )
}

#[test]
fn test_unknown_provider_kind_fails_construction() {
    let content = r#"
[[pipelines]]
project = "web"
[[pipelines.agents]]
name = "planner"
provider = "telepathy"
"#;

    let error = build(content).err().expect("construction must fail");
    assert!(matches!(
        error,
        PipelineError::Configuration(ConfigError::UnknownProviderKind { ref kind, ref agent })
            if kind == "telepathy" && agent == "planner"
    ));
    assert!(error.is_fatal());
}

#[test]
fn test_missing_provider_section_fails_construction() {
    let content = r#"
[[pipelines]]
project = "docs"
[[pipelines.agents]]
name = "writer"
provider = "chat"
"#;

    let error = build(content).err().expect("construction must fail");
    assert!(matches!(
        error,
        PipelineError::Configuration(ConfigError::MissingProviderSection(_))
    ));
}

#[tokio::test]
async fn test_configured_pipelines_resolve_at_construction() {
    std::env::set_var("CONFIG_TEST_CHAT_KEY", "test-key");
    let orchestrator = build(FULL_CONFIG).unwrap();

    let pipeline = orchestrator.load_pipeline("web").await.unwrap();
    assert_eq!(pipeline.len(), 2);
    assert!(matches!(pipeline.stage(2), Some((_, CompletionProvider::Async(_)))));

    let no_project = orchestrator.load_pipeline("mobile").await.unwrap_err();
    assert!(matches!(
        no_project,
        PipelineError::Configuration(ConfigError::UnknownProject(_))
    ));
}
