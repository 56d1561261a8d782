//! Built-in stream and result processors.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use super::{
    ProcessorOutcome, ProcessorState, ResultContext, ResultProcessor, StreamProcessor,
};
use crate::error::OutflowError;
use crate::stop::{estimate_tokens, StopCondition, StopContext};
use crate::types::{Chunk, ChunkPayload, ContentPart, ModelMessage};

/// Drop chunks that do not satisfy a predicate.
pub struct ChunkFilter {
    predicate: Arc<dyn Fn(&Chunk) -> bool + Send + Sync>,
}

impl ChunkFilter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Chunk) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

#[async_trait]
impl StreamProcessor for ChunkFilter {
    fn name(&self) -> &str {
        "chunk-filter"
    }

    async fn process(
        &self,
        chunk: Chunk,
        _state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError> {
        if (self.predicate)(&chunk) {
            Ok(ProcessorOutcome::Emit(chunk))
        } else {
            Ok(ProcessorOutcome::Drop)
        }
    }
}

/// Rewrite the text of text deltas, and optionally reasoning deltas.
pub struct TextMapper {
    mapper: Arc<dyn Fn(String) -> String + Send + Sync>,
    include_reasoning: bool,
}

impl TextMapper {
    pub fn new<F>(mapper: F) -> Self
    where
        F: Fn(String) -> String + Send + Sync + 'static,
    {
        Self {
            mapper: Arc::new(mapper),
            include_reasoning: false,
        }
    }

    pub fn with_reasoning(mut self) -> Self {
        self.include_reasoning = true;
        self
    }
}

#[async_trait]
impl StreamProcessor for TextMapper {
    fn name(&self) -> &str {
        "text-mapper"
    }

    async fn process(
        &self,
        mut chunk: Chunk,
        _state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError> {
        match &mut chunk.payload {
            ChunkPayload::TextDelta { text, .. } if !text.is_empty() => {
                *text = (self.mapper)(std::mem::take(text));
            }
            ChunkPayload::ReasoningDelta { text, .. }
                if self.include_reasoning && !text.is_empty() =>
            {
                *text = (self.mapper)(std::mem::take(text));
            }
            _ => {}
        }
        Ok(ProcessorOutcome::Emit(chunk))
    }
}

/// Replace every match of a pattern, e.g. to redact PII.
///
/// Applies to text and reasoning deltas; with
/// [`include_tool_payloads`](Self::include_tool_payloads) also to string
/// values inside tool results and tool errors.
pub struct RegexRedactor {
    regex: Regex,
    replacement: String,
    tool_payloads: bool,
}

impl RegexRedactor {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, OutflowError> {
        let regex = Regex::new(pattern)
            .map_err(|e| OutflowError::Configuration(format!("invalid redaction pattern: {e}")))?;
        Ok(Self {
            regex,
            replacement: replacement.into(),
            tool_payloads: false,
        })
    }

    pub fn include_tool_payloads(mut self, enabled: bool) -> Self {
        self.tool_payloads = enabled;
        self
    }

    fn redact(&self, text: &str) -> String {
        self.regex
            .replace_all(text, self.replacement.as_str())
            .into_owned()
    }
}

#[async_trait]
impl StreamProcessor for RegexRedactor {
    fn name(&self) -> &str {
        "regex-redactor"
    }

    async fn process(
        &self,
        mut chunk: Chunk,
        _state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError> {
        match &mut chunk.payload {
            ChunkPayload::TextDelta { text, .. } | ChunkPayload::ReasoningDelta { text, .. } => {
                *text = self.redact(text);
            }
            ChunkPayload::ToolResult { result, .. } if self.tool_payloads => {
                redact_json(result, &|s| self.redact(s));
            }
            ChunkPayload::ToolError { error, .. } if self.tool_payloads => {
                *error = self.redact(error);
            }
            _ => {}
        }
        Ok(ProcessorOutcome::Emit(chunk))
    }
}

fn redact_json(value: &mut serde_json::Value, redact: &dyn Fn(&str) -> String) {
    match value {
        serde_json::Value::String(s) => *s = redact(s),
        serde_json::Value::Array(items) => {
            for item in items {
                redact_json(item, redact);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                redact_json(item, redact);
            }
        }
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {}
    }
}

/// What [`TokenLimiter`] does once the budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStrategy {
    /// Trip the run.
    Tripwire,
    /// Cut the text at the budget and drop later text deltas.
    Truncate,
}

const EMITTED_CHARS_KEY: &str = "token_limiter.emitted_chars";

/// Cap the estimated number of output tokens in a run.
pub struct TokenLimiter {
    max_tokens: usize,
    strategy: LimitStrategy,
}

impl TokenLimiter {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            strategy: LimitStrategy::Tripwire,
        }
    }

    pub fn with_strategy(mut self, strategy: LimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[async_trait]
impl StreamProcessor for TokenLimiter {
    fn name(&self) -> &str {
        "token-limiter"
    }

    async fn process(
        &self,
        mut chunk: Chunk,
        state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError> {
        match self.strategy {
            LimitStrategy::Tripwire => {
                if estimate_tokens(state.accumulated_text()) > self.max_tokens {
                    return Ok(ProcessorOutcome::Tripwire {
                        reason: format!("output exceeded ~{} tokens", self.max_tokens),
                    });
                }
                Ok(ProcessorOutcome::Emit(chunk))
            }
            LimitStrategy::Truncate => {
                let ChunkPayload::TextDelta { text, .. } = &mut chunk.payload else {
                    return Ok(ProcessorOutcome::Emit(chunk));
                };
                let budget = self.max_tokens.saturating_mul(4);
                let emitted = state
                    .get(EMITTED_CHARS_KEY)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as usize;
                if emitted >= budget {
                    return Ok(ProcessorOutcome::Drop);
                }
                let remaining = budget - emitted;
                if text.len() > remaining {
                    let mut cut = remaining;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                state.set(EMITTED_CHARS_KEY, serde_json::json!(emitted + text.len()));
                Ok(ProcessorOutcome::Emit(chunk))
            }
        }
    }
}

/// Trip the run when any stop condition fires.
pub struct StopConditionProcessor {
    conditions: Vec<Arc<dyn StopCondition>>,
}

impl StopConditionProcessor {
    pub fn new(conditions: Vec<Arc<dyn StopCondition>>) -> Self {
        Self { conditions }
    }
}

#[async_trait]
impl StreamProcessor for StopConditionProcessor {
    fn name(&self) -> &str {
        "stop-condition"
    }

    async fn process(
        &self,
        chunk: Chunk,
        state: &mut ProcessorState,
    ) -> Result<ProcessorOutcome, OutflowError> {
        let ctx = StopContext {
            text: state.accumulated_text(),
            delta: match &chunk.payload {
                ChunkPayload::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            },
            elapsed: state.elapsed(),
        };
        for condition in &self.conditions {
            if condition.should_stop(&ctx).await {
                return Ok(ProcessorOutcome::Tripwire {
                    reason: condition.describe(),
                });
            }
        }
        Ok(ProcessorOutcome::Emit(chunk))
    }
}

/// Regex replacement over the final transcript's text, reasoning and tool
/// result strings.
pub struct MessageRedactor {
    regex: Regex,
    replacement: String,
}

impl MessageRedactor {
    pub fn new(pattern: &str, replacement: impl Into<String>) -> Result<Self, OutflowError> {
        let regex = Regex::new(pattern)
            .map_err(|e| OutflowError::Configuration(format!("invalid redaction pattern: {e}")))?;
        Ok(Self {
            regex,
            replacement: replacement.into(),
        })
    }
}

#[async_trait]
impl ResultProcessor for MessageRedactor {
    fn name(&self) -> &str {
        "message-redactor"
    }

    async fn process(
        &self,
        mut messages: Vec<ModelMessage>,
        _ctx: &ResultContext,
    ) -> Result<Vec<ModelMessage>, OutflowError> {
        let redact = |s: &str| {
            self.regex
                .replace_all(s, self.replacement.as_str())
                .into_owned()
        };
        for message in &mut messages {
            message.map_text(redact);
            for part in &mut message.content {
                if let ContentPart::ToolResult(result) = part {
                    redact_json(&mut result.result, &redact);
                }
            }
        }
        Ok(messages)
    }
}

/// Closure-based result processor.
pub struct MessageMapper {
    name: String,
    #[allow(clippy::type_complexity)]
    mapper: Arc<dyn Fn(Vec<ModelMessage>) -> Vec<ModelMessage> + Send + Sync>,
}

impl MessageMapper {
    pub fn new<F>(name: impl Into<String>, mapper: F) -> Self
    where
        F: Fn(Vec<ModelMessage>) -> Vec<ModelMessage> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mapper: Arc::new(mapper),
        }
    }
}

#[async_trait]
impl ResultProcessor for MessageMapper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        messages: Vec<ModelMessage>,
        _ctx: &ResultContext,
    ) -> Result<Vec<ModelMessage>, OutflowError> {
        Ok((self.mapper)(messages))
    }
}
