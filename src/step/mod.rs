//! Step accumulation: turns one step's chunk sequence into a [`StepResult`].
//!
//! A step moves `Pending -> Open -> Sealed`. It opens on `step-start`, seals
//! exactly once on `step-finish`, and any chunk delivered for it afterwards
//! is a protocol violation.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::OutflowError;
use crate::types::{
    AgentToolCall, AgentToolResult, Chunk, ChunkPayload, ContentPart, FinishReason, ModelMessage,
    RequestMetadata, ResponseMetadata, StepId, Usage,
};

/// Lifecycle phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    Open,
    Sealed,
}

/// A file emitted during a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepFile {
    pub media_type: String,
    pub data: String,
}

/// A source reference emitted during a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// The aggregate of one model request/response cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: StepId,
    pub step_number: usize,
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<AgentToolCall>,
    /// Tool results and tool errors, in emission order. Errors have `is_error` set.
    pub tool_results: Vec<AgentToolResult>,
    pub files: Vec<StepFile>,
    pub sources: Vec<StepSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
    pub usage: Usage,
    pub warnings: Vec<String>,
    pub finish_reason: FinishReason,
    pub request: RequestMetadata,
    pub response: ResponseMetadata,
}

impl StepResult {
    /// Tool calls that have neither a result nor an error yet.
    pub fn unresolved_tool_calls(&self) -> Vec<&AgentToolCall> {
        self.tool_calls
            .iter()
            .filter(|call| {
                !self
                    .tool_results
                    .iter()
                    .any(|result| result.tool_call_id == call.id)
            })
            .collect()
    }

    /// Render this step as transcript messages: one assistant message, then
    /// one tool message if any results were produced.
    pub fn to_messages(&self) -> Vec<ModelMessage> {
        let mut parts = Vec::new();
        if !self.reasoning.is_empty() {
            parts.push(ContentPart::Reasoning {
                text: self.reasoning.clone(),
            });
        }
        if !self.text.is_empty() {
            parts.push(ContentPart::Text {
                text: self.text.clone(),
            });
        }
        for file in &self.files {
            parts.push(ContentPart::File {
                media_type: file.media_type.clone(),
                data: file.data.clone(),
            });
        }
        for call in &self.tool_calls {
            parts.push(ContentPart::ToolCall(call.clone()));
        }

        let mut messages = Vec::new();
        if !parts.is_empty() {
            messages.push(ModelMessage::assistant_parts(parts));
        }
        if !self.tool_results.is_empty() {
            messages.push(ModelMessage::tool_results(self.tool_results.clone()));
        }
        messages
    }
}

#[derive(Debug)]
struct PendingToolInput {
    tool_name: String,
    dynamic: bool,
    input: String,
    ended: bool,
}

/// Builds a [`StepResult`] from the chunks of a single step.
///
/// In strict mode every ordering rule is enforced and violations are
/// returned as [`OutflowError::ProtocolViolation`]. Lenient mode tolerates
/// spans whose start was suppressed upstream, which happens when a stream
/// processor drops chunks; delivering chunks after the seal is an error in
/// both modes.
#[derive(Debug)]
pub struct StepAccumulator {
    step_id: StepId,
    step_number: usize,
    strict: bool,
    phase: StepPhase,
    open_text: HashSet<String>,
    open_reasoning: HashSet<String>,
    tool_inputs: HashMap<String, PendingToolInput>,
    tool_input_order: Vec<String>,
    text: String,
    reasoning: String,
    tool_calls: Vec<AgentToolCall>,
    tool_results: Vec<AgentToolResult>,
    files: Vec<StepFile>,
    sources: Vec<StepSource>,
    object: Option<serde_json::Value>,
    usage: Usage,
    warnings: Vec<String>,
    finish_reason: Option<FinishReason>,
    request: RequestMetadata,
    response: ResponseMetadata,
}

impl StepAccumulator {
    /// Accumulator that enforces every ordering rule.
    pub fn strict(step_id: StepId, step_number: usize) -> Self {
        Self::with_mode(step_id, step_number, true)
    }

    /// Accumulator that tolerates missing span starts.
    pub fn lenient(step_id: StepId, step_number: usize) -> Self {
        Self::with_mode(step_id, step_number, false)
    }

    fn with_mode(step_id: StepId, step_number: usize, strict: bool) -> Self {
        Self {
            step_id,
            step_number,
            strict,
            phase: StepPhase::Pending,
            open_text: HashSet::new(),
            open_reasoning: HashSet::new(),
            tool_inputs: HashMap::new(),
            tool_input_order: Vec::new(),
            text: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            files: Vec::new(),
            sources: Vec::new(),
            object: None,
            usage: Usage::default(),
            warnings: Vec::new(),
            finish_reason: None,
            request: RequestMetadata {
                step_number,
                ..Default::default()
            },
            response: ResponseMetadata::default(),
        }
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn is_sealed(&self) -> bool {
        self.phase == StepPhase::Sealed
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tool calls accumulated so far.
    pub fn tool_calls(&self) -> &[AgentToolCall] {
        &self.tool_calls
    }

    /// Tool results and errors accumulated so far.
    pub fn tool_results(&self) -> &[AgentToolResult] {
        &self.tool_results
    }

    /// Apply one chunk. Run-scoped lifecycle chunks are ignored.
    pub fn apply(&mut self, chunk: &Chunk) -> Result<(), OutflowError> {
        if matches!(
            chunk.payload,
            ChunkPayload::Start { .. }
                | ChunkPayload::Finish { .. }
                | ChunkPayload::Abort { .. }
                | ChunkPayload::Error { .. }
                | ChunkPayload::Tripwire { .. }
        ) {
            return Ok(());
        }

        if let Some(step_id) = chunk.step_id {
            if step_id != self.step_id {
                return Err(self.violation(format!(
                    "{} chunk for step {step_id} delivered to step {}",
                    chunk.type_name(),
                    self.step_id
                )));
            }
        } else if self.strict {
            return Err(self.violation(format!(
                "{} chunk without a step id",
                chunk.type_name()
            )));
        }

        match self.phase {
            StepPhase::Sealed => {
                return Err(self.violation(format!(
                    "{} chunk delivered after step-finish",
                    chunk.type_name()
                )));
            }
            StepPhase::Pending => {
                if !matches!(chunk.payload, ChunkPayload::StepStart { .. }) {
                    if self.strict {
                        return Err(self.violation(format!(
                            "{} chunk delivered before step-start",
                            chunk.type_name()
                        )));
                    }
                    self.phase = StepPhase::Open;
                }
            }
            StepPhase::Open => {}
        }

        self.apply_payload(&chunk.payload)
    }

    fn apply_payload(&mut self, payload: &ChunkPayload) -> Result<(), OutflowError> {
        match payload {
            ChunkPayload::StepStart { request } => {
                if self.phase != StepPhase::Pending {
                    return Err(self.violation("duplicate step-start".to_string()));
                }
                self.request = request.clone();
                self.phase = StepPhase::Open;
            }
            ChunkPayload::StepFinish {
                finish_reason,
                usage,
                response,
                warnings,
            } => {
                self.usage = usage.clone();
                self.response = response.clone();
                self.warnings.extend(warnings.iter().cloned());
                self.finish_reason = Some(*finish_reason);
                self.seal();
            }
            ChunkPayload::TextStart { id } => self.open_span(SpanKind::Text, id)?,
            ChunkPayload::TextDelta { id, text } => {
                self.require_span(SpanKind::Text, id)?;
                self.text.push_str(text);
            }
            ChunkPayload::TextEnd { id } => self.close_span(SpanKind::Text, id)?,
            ChunkPayload::ReasoningStart { id } => self.open_span(SpanKind::Reasoning, id)?,
            ChunkPayload::ReasoningDelta { id, text } => {
                self.require_span(SpanKind::Reasoning, id)?;
                self.reasoning.push_str(text);
            }
            ChunkPayload::ReasoningEnd { id } => self.close_span(SpanKind::Reasoning, id)?,
            ChunkPayload::ToolCallInputStart {
                tool_call_id,
                tool_name,
                dynamic,
            } => {
                if self.tool_inputs.contains_key(tool_call_id) {
                    return Err(self.violation(format!(
                        "tool-call-input-start for already open input {tool_call_id}"
                    )));
                }
                self.tool_input_order.push(tool_call_id.clone());
                self.tool_inputs.insert(
                    tool_call_id.clone(),
                    PendingToolInput {
                        tool_name: tool_name.clone(),
                        dynamic: *dynamic,
                        input: String::new(),
                        ended: false,
                    },
                );
            }
            ChunkPayload::ToolCallInputDelta {
                tool_call_id,
                delta,
            } => {
                if self.tool_input_open(tool_call_id) {
                    if let Some(input) = self.tool_inputs.get_mut(tool_call_id) {
                        input.input.push_str(delta);
                    }
                } else if self.strict {
                    return Err(self.violation(format!(
                        "tool-call-input-delta for unknown input {tool_call_id}"
                    )));
                }
            }
            ChunkPayload::ToolCallInputEnd { tool_call_id } => {
                if self.tool_input_open(tool_call_id) {
                    if let Some(input) = self.tool_inputs.get_mut(tool_call_id) {
                        input.ended = true;
                    }
                } else if self.strict {
                    return Err(self.violation(format!(
                        "tool-call-input-end for unknown input {tool_call_id}"
                    )));
                }
            }
            ChunkPayload::ToolCall {
                tool_call_id,
                tool_name,
                args,
                dynamic,
            } => {
                if self.tool_calls.iter().any(|call| &call.id == tool_call_id) {
                    return Err(
                        self.violation(format!("duplicate tool-call for id {tool_call_id}"))
                    );
                }
                self.tool_inputs.remove(tool_call_id);
                self.tool_input_order.retain(|id| id != tool_call_id);
                self.tool_calls.push(AgentToolCall {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    arguments: args.clone(),
                    dynamic: *dynamic,
                });
            }
            ChunkPayload::ToolCallApproval { tool_call_id, .. }
            | ChunkPayload::ToolCallSuspended { tool_call_id, .. } => {
                self.require_tool_call(tool_call_id)?;
            }
            ChunkPayload::ToolResult {
                tool_call_id,
                tool_name,
                result,
                dynamic,
            } => {
                self.require_tool_call(tool_call_id)?;
                self.tool_results.push(AgentToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    result: result.clone(),
                    is_error: false,
                    dynamic: *dynamic,
                });
            }
            ChunkPayload::ToolError {
                tool_call_id,
                tool_name,
                error,
            } => {
                self.require_tool_call(tool_call_id)?;
                let dynamic = self
                    .tool_calls
                    .iter()
                    .find(|call| &call.id == tool_call_id)
                    .map(|call| call.dynamic)
                    .unwrap_or(false);
                self.tool_results.push(AgentToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    result: serde_json::json!({ "error": error }),
                    is_error: true,
                    dynamic,
                });
            }
            ChunkPayload::Source { id, url, title } => self.sources.push(StepSource {
                id: id.clone(),
                url: url.clone(),
                title: title.clone(),
            }),
            ChunkPayload::File { media_type, data } => self.files.push(StepFile {
                media_type: media_type.clone(),
                data: data.clone(),
            }),
            ChunkPayload::Object { value } => self.object = Some(value.clone()),
            ChunkPayload::Raw { .. } => {}
            ChunkPayload::Start { .. }
            | ChunkPayload::Finish { .. }
            | ChunkPayload::Abort { .. }
            | ChunkPayload::Error { .. }
            | ChunkPayload::Tripwire { .. } => {}
        }
        Ok(())
    }

    fn spans(&mut self, kind: SpanKind) -> &mut HashSet<String> {
        match kind {
            SpanKind::Text => &mut self.open_text,
            SpanKind::Reasoning => &mut self.open_reasoning,
        }
    }

    fn open_span(&mut self, kind: SpanKind, id: &str) -> Result<(), OutflowError> {
        if !self.spans(kind).insert(id.to_string()) {
            return Err(self.violation(format!(
                "{}-start for already open id {id}",
                kind.name()
            )));
        }
        Ok(())
    }

    fn require_span(&mut self, kind: SpanKind, id: &str) -> Result<(), OutflowError> {
        if self.spans(kind).contains(id) {
            return Ok(());
        }
        if self.strict {
            return Err(self.violation(format!(
                "{}-delta before {}-start for id {id}",
                kind.name(),
                kind.name()
            )));
        }
        self.spans(kind).insert(id.to_string());
        Ok(())
    }

    fn tool_input_open(&self, tool_call_id: &str) -> bool {
        self.tool_inputs
            .get(tool_call_id)
            .is_some_and(|input| !input.ended)
    }

    fn close_span(&mut self, kind: SpanKind, id: &str) -> Result<(), OutflowError> {
        if !self.spans(kind).remove(id) && self.strict {
            return Err(self.violation(format!(
                "{}-end without matching start for id {id}",
                kind.name()
            )));
        }
        Ok(())
    }

    fn require_tool_call(&self, tool_call_id: &str) -> Result<(), OutflowError> {
        if self.strict && !self.tool_calls.iter().any(|call| call.id == tool_call_id) {
            return Err(self.violation(format!(
                "no tool-call with id {tool_call_id} in this step"
            )));
        }
        Ok(())
    }

    fn violation(&self, message: String) -> OutflowError {
        tracing::error!(step_id = %self.step_id, %message, "protocol violation");
        OutflowError::ProtocolViolation(message)
    }

    /// Tool inputs that finished streaming but have no `tool-call` chunk yet,
    /// as calls with their input parsed as JSON (or kept as a string).
    pub fn finished_tool_inputs(&self) -> Vec<AgentToolCall> {
        self.tool_input_order
            .iter()
            .filter_map(|id| {
                let input = self.tool_inputs.get(id).filter(|input| input.ended)?;
                let arguments = serde_json::from_str(&input.input)
                    .unwrap_or_else(|_| serde_json::Value::String(input.input.clone()));
                Some(AgentToolCall {
                    id: id.clone(),
                    name: input.tool_name.clone(),
                    arguments,
                    dynamic: input.dynamic,
                })
            })
            .collect()
    }

    /// Seal the step. Tool inputs that finished streaming without a
    /// `tool-call` chunk become calls.
    fn seal(&mut self) {
        let pending = self.finished_tool_inputs();
        self.tool_calls.extend(pending);
        self.tool_input_order.clear();
        self.tool_inputs.clear();
        self.open_text.clear();
        self.open_reasoning.clear();
        self.phase = StepPhase::Sealed;
    }

    /// Snapshot of everything accumulated so far, with `finish_reason` used
    /// when the step has not sealed.
    pub fn snapshot(&self, finish_reason: FinishReason) -> StepResult {
        StepResult {
            step_id: self.step_id,
            step_number: self.step_number,
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_results: self.tool_results.clone(),
            files: self.files.clone(),
            sources: self.sources.clone(),
            object: self.object.clone(),
            usage: self.usage.clone(),
            warnings: self.warnings.clone(),
            finish_reason: self.finish_reason.unwrap_or(finish_reason),
            request: self.request.clone(),
            response: self.response.clone(),
        }
    }

    /// Consume a sealed accumulator into its result.
    pub fn into_result(self) -> Result<StepResult, OutflowError> {
        let Some(finish_reason) = self.finish_reason.filter(|_| self.is_sealed()) else {
            return Err(OutflowError::InvalidState(format!(
                "step {} is not sealed",
                self.step_id
            )));
        };
        Ok(StepResult {
            step_id: self.step_id,
            step_number: self.step_number,
            text: self.text,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            tool_results: self.tool_results,
            files: self.files,
            sources: self.sources,
            object: self.object,
            usage: self.usage,
            warnings: self.warnings,
            finish_reason,
            request: self.request,
            response: self.response,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum SpanKind {
    Text,
    Reasoning,
}

impl SpanKind {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Reasoning => "reasoning",
        }
    }
}
