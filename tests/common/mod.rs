//! Shared test helpers: scripted provider steps, tools, and stream collection.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use outflow::error::OutflowError;
use outflow::provider::{ModelProvider, ProviderRequest, ProviderStream};
use outflow::run::{ModelOutput, RunRequest};
use outflow::tools::{AgentTool, ToolParameters};
use outflow::types::*;

pub fn usage(input: u32, output: u32) -> Usage {
    Usage::new(input, output)
}

pub fn step_finish(reason: FinishReason, usage: Usage) -> ChunkPayload {
    ChunkPayload::StepFinish {
        finish_reason: reason,
        usage,
        response: ResponseMetadata::default(),
        warnings: Vec::new(),
    }
}

/// One text span split into `deltas`.
pub fn text_span(id: &str, deltas: &[&str]) -> Vec<ChunkPayload> {
    let mut payloads = vec![ChunkPayload::TextStart { id: id.into() }];
    payloads.extend(deltas.iter().map(|text| ChunkPayload::TextDelta {
        id: id.into(),
        text: (*text).into(),
    }));
    payloads.push(ChunkPayload::TextEnd { id: id.into() });
    payloads
}

/// A step that streams `deltas` and stops.
pub fn text_step(deltas: &[&str], usage: Usage) -> Vec<ChunkPayload> {
    let mut payloads = text_span("t", deltas);
    payloads.push(step_finish(FinishReason::Stop, usage));
    payloads
}

/// A step that requests one tool call.
pub fn tool_step(id: &str, name: &str, args: serde_json::Value) -> Vec<ChunkPayload> {
    vec![
        ChunkPayload::ToolCall {
            tool_call_id: id.into(),
            tool_name: name.into(),
            args,
            dynamic: false,
        },
        step_finish(FinishReason::ToolCalls, usage(5, 5)),
    ]
}

pub fn request(prompt: &str) -> RunRequest {
    RunRequest::new(vec![ModelMessage::user(prompt)])
}

/// Tool that echoes its `text` argument back.
pub fn echo_tool() -> AgentTool {
    AgentTool::new(
        "echo",
        "Echo the input",
        ToolParameters::object()
            .string("text", "Text to echo", true)
            .build(),
        |args, _ctx| async move {
            let text = args.get_str("text")?.to_string();
            Ok(serde_json::json!({ "echo": text }))
        },
    )
}

/// Subscribe and collect every chunk until the stream ends.
pub async fn collect(output: &ModelOutput) -> Vec<Chunk> {
    output.subscribe().collect().await
}

pub fn types(chunks: &[Chunk]) -> Vec<&'static str> {
    chunks.iter().map(Chunk::type_name).collect()
}

pub fn joined_text(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .filter_map(|chunk| match &chunk.payload {
            ChunkPayload::TextDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Provider that yields `head` for its first step and then never produces
/// another payload.
pub struct StallingProvider {
    head: Vec<ChunkPayload>,
    requests: Mutex<usize>,
}

impl StallingProvider {
    pub fn new(head: Vec<ChunkPayload>) -> Arc<Self> {
        Arc::new(Self {
            head,
            requests: Mutex::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

#[async_trait]
impl ModelProvider for StallingProvider {
    fn provider_name(&self) -> &str {
        "stalling"
    }

    async fn stream_step(&self, _request: &ProviderRequest) -> Result<ProviderStream, OutflowError> {
        *self.requests.lock().unwrap() += 1;
        let head = futures::stream::iter(self.head.clone().into_iter().map(Ok));
        Ok(head.chain(futures::stream::pending()).boxed())
    }
}

/// Provider whose stream fails after `head`.
pub struct FailingProvider {
    head: Vec<ChunkPayload>,
    message: String,
}

impl FailingProvider {
    pub fn new(head: Vec<ChunkPayload>, message: &str) -> Arc<Self> {
        Arc::new(Self {
            head,
            message: message.into(),
        })
    }
}

#[async_trait]
impl ModelProvider for FailingProvider {
    fn provider_name(&self) -> &str {
        "failing"
    }

    async fn stream_step(&self, _request: &ProviderRequest) -> Result<ProviderStream, OutflowError> {
        let failure = OutflowError::provider("failing", self.message.clone());
        let items: Vec<Result<ChunkPayload, OutflowError>> = self
            .head
            .iter()
            .cloned()
            .map(Ok)
            .chain(std::iter::once(Err(failure)))
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}
