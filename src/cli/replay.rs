//! CLI command handlers.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use super::ReplayArgs;
use crate::config::EngineConfig;
use crate::error::{ErrorCategory, OutflowError};
use crate::processor::{MessageRedactor, ProcessorPipeline, RegexRedactor};
use crate::provider::ReplayProvider;
use crate::run::{ApprovalPolicy, Engine, RunRequest, RunStatus};
use crate::sink::FileSink;
use crate::types::{ChunkPayload, ModelMessage};

const REDACTED: &str = "[redacted]";

/// Load config from `path`, or the layered default.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, OutflowError> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
        None => EngineConfig::load(),
    }
}

/// Handle `outflow config`.
pub fn handle_config(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Handle `outflow replay <events>`.
pub async fn handle_replay(
    args: ReplayArgs,
    mut config: EngineConfig,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    // Nobody is around to answer approval prompts.
    config.approval_policy = ApprovalPolicy::Never;
    config.validate()?;

    let mut pipeline = ProcessorPipeline::new();
    for pattern in &args.redact {
        pipeline = pipeline
            .with_stream_processor(Arc::new(
                RegexRedactor::new(pattern, REDACTED)?.include_tool_payloads(true),
            ))
            .with_result_processor(Arc::new(MessageRedactor::new(pattern, REDACTED)?));
    }

    let raw = tokio::fs::read_to_string(&args.events).await?;
    let mut provider = ReplayProvider::from_jsonl(&raw)?;
    if args.delay_ms > 0 {
        provider = provider.with_delay(Duration::from_millis(args.delay_ms));
    }

    let mut engine = Engine::new(Arc::new(provider))
        .with_config(config)
        .with_pipeline(pipeline);
    if let Some(dir) = &args.save {
        engine = engine.with_sink(Arc::new(FileSink::new(dir)));
    }

    let mut messages = Vec::new();
    if !args.prompt.is_empty() {
        messages.push(ModelMessage::user(args.prompt.clone()));
    }
    let output = engine.start(RunRequest::new(messages))?;
    let mut chunks = output.subscribe();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = chunks.next().await {
        if args.json {
            writeln!(stdout, "{}", serde_json::to_string(&chunk)?)?;
            continue;
        }
        match &chunk.payload {
            ChunkPayload::TextDelta { text, .. } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            ChunkPayload::ToolCall {
                tool_name,
                tool_call_id,
                ..
            } => eprintln!("\n-> {tool_name} ({tool_call_id})"),
            ChunkPayload::ToolResult { result, .. } => {
                eprintln!("   ok: {}", truncate(&result.to_string(), 200));
            }
            ChunkPayload::ToolError { error, .. } => eprintln!("   error: {error}"),
            ChunkPayload::Tripwire { processor, reason } => {
                eprintln!("\n[tripwire] {processor}: {reason}");
            }
            ChunkPayload::Error { message, category } => {
                eprintln!("\n[{category}] {message}");
            }
            _ => {}
        }
    }

    let outcome = output.outcome().await;
    if !args.json {
        println!();
        eprintln!(
            "{} ({}), {} step(s), {} tokens",
            outcome.status,
            outcome.finish_reason,
            outcome.steps.len(),
            outcome.usage.total_tokens
        );
    }
    Ok(outcome.status)
}

/// Process exit code for a handler result: 0 on success, 2 for
/// configuration errors, 1 otherwise.
pub fn exit_code(result: &Result<RunStatus, Box<dyn std::error::Error>>) -> i32 {
    match result {
        Ok(RunStatus::Success) => 0,
        Ok(_) => 1,
        Err(err) => match err.downcast_ref::<OutflowError>() {
            Some(err) if err.category() == ErrorCategory::Configuration => 2,
            _ => 1,
        },
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h...");
    }

    #[tokio::test]
    async fn replays_a_recording_with_redaction() {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join("run.jsonl");
        std::fs::write(
            &events,
            r#"{"type":"text-start","payload":{"id":"t"}}
{"type":"text-delta","payload":{"id":"t","text":"key sk-abc"}}
{"type":"text-end","payload":{"id":"t"}}
{"type":"step-finish","payload":{"finishReason":"stop"}}
"#,
        )
        .unwrap();
        let args = ReplayArgs {
            events,
            prompt: "hi".into(),
            redact: vec!["sk-[a-z]+".into()],
            max_steps: None,
            delay_ms: 0,
            json: true,
            save: Some(dir.path().join("out")),
        };
        let status = handle_replay(args, EngineConfig::default()).await.unwrap();
        assert_eq!(status, RunStatus::Success);

        let saved = std::fs::read_dir(dir.path().join("out")).unwrap().count();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn zero_step_budget_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = ReplayArgs {
            events: dir.path().join("never-read.jsonl"),
            prompt: String::new(),
            redact: Vec::new(),
            max_steps: Some(0),
            delay_ms: 0,
            json: true,
            save: None,
        };
        let result = handle_replay(args, EngineConfig::default()).await;
        let err = result.as_ref().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OutflowError>(),
            Some(OutflowError::Configuration(_))
        ));
        assert_eq!(exit_code(&result), 2);
    }

    #[test]
    fn exit_codes_follow_status_and_error_category() {
        assert_eq!(exit_code(&Ok(RunStatus::Success)), 0);
        assert_eq!(exit_code(&Ok(RunStatus::Aborted)), 1);
        let bad_pattern: Box<dyn std::error::Error> =
            Box::new(OutflowError::Configuration("bad pattern".into()));
        assert_eq!(exit_code(&Err(bad_pattern)), 2);
        let missing: Box<dyn std::error::Error> =
            Box::new(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(exit_code(&Err(missing)), 1);
    }
}
