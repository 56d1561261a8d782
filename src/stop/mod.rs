//! Stop conditions that halt a run's output stream early.
//!
//! Conditions are evaluated by
//! [`StopConditionProcessor`](crate::processor::builtin::StopConditionProcessor)
//! against the per-run [`StopContext`]; a condition that fires trips the run.

use std::time::Duration;

use async_trait::async_trait;

/// What a stop condition gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct StopContext<'a> {
    /// Text seen so far in this run, including `delta`.
    pub text: &'a str,
    /// The delta that was just received, if the chunk carried text.
    pub delta: Option<&'a str>,
    /// Time since the processor saw the run's first chunk.
    pub elapsed: Duration,
}

/// Trait for conditions that can stop a run's output early.
#[async_trait]
pub trait StopCondition: Send + Sync {
    /// Check if generation should stop.
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool;

    /// Human-readable reason reported on the tripwire chunk.
    fn describe(&self) -> String;
}

/// Stop when a specific string is found in the output.
pub struct StringStop {
    pattern: String,
}

impl StringStop {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

#[async_trait]
impl StopCondition for StringStop {
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool {
        ctx.text.contains(&self.pattern)
    }

    fn describe(&self) -> String {
        format!("output contained {:?}", self.pattern)
    }
}

/// Stop when a regex pattern matches.
pub struct RegexStop {
    regex: regex::Regex,
}

impl RegexStop {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: regex::Regex::new(pattern)?,
        })
    }
}

#[async_trait]
impl StopCondition for RegexStop {
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool {
        self.regex.is_match(ctx.text)
    }

    fn describe(&self) -> String {
        format!("output matched /{}/", self.regex.as_str())
    }
}

/// Stop after a certain number of tokens (estimated by character count / 4).
pub struct TokenCountStop {
    max_tokens: usize,
}

impl TokenCountStop {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

/// Rough estimate: 1 token ≈ 4 chars.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

#[async_trait]
impl StopCondition for TokenCountStop {
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool {
        estimate_tokens(ctx.text) >= self.max_tokens
    }

    fn describe(&self) -> String {
        format!("output exceeded ~{} tokens", self.max_tokens)
    }
}

/// Stop once the run has been streaming longer than a duration.
pub struct TimeoutStop {
    duration: Duration,
}

impl TimeoutStop {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl StopCondition for TimeoutStop {
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool {
        ctx.elapsed >= self.duration
    }

    fn describe(&self) -> String {
        format!("output streamed longer than {}ms", self.duration.as_millis())
    }
}

/// Stop when a custom predicate returns true.
pub struct PredicateStop<F: Fn(&str) -> bool + Send + Sync> {
    predicate: F,
    description: String,
}

impl<F: Fn(&str) -> bool + Send + Sync> PredicateStop<F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            description: "stop predicate matched".to_string(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl<F: Fn(&str) -> bool + Send + Sync> StopCondition for PredicateStop<F> {
    async fn should_stop(&self, ctx: &StopContext<'_>) -> bool {
        (self.predicate)(ctx.text)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(text: &str) -> StopContext<'_> {
        StopContext {
            text,
            delta: None,
            elapsed: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn string_stop_matches() {
        let stop = StringStop::new("END");
        assert!(!stop.should_stop(&ctx("Hello")).await);
        assert!(stop.should_stop(&ctx("Hello END world")).await);
    }

    #[tokio::test]
    async fn regex_stop_matches() {
        let stop = RegexStop::new(r"\d{3}").unwrap();
        assert!(!stop.should_stop(&ctx("abc")).await);
        assert!(stop.should_stop(&ctx("abc123")).await);
        assert_eq!(stop.describe(), r"output matched /\d{3}/");
    }

    #[tokio::test]
    async fn token_count_stop() {
        let stop = TokenCountStop::new(5);
        assert!(!stop.should_stop(&ctx("hi")).await);
        assert!(stop.should_stop(&ctx(&"ab".repeat(10))).await);
    }

    #[tokio::test]
    async fn timeout_stop_uses_elapsed() {
        let stop = TimeoutStop::new(Duration::from_millis(10));
        assert!(!stop.should_stop(&ctx("")).await);
        let late = StopContext {
            text: "",
            delta: None,
            elapsed: Duration::from_millis(15),
        };
        assert!(stop.should_stop(&late).await);
    }

    #[tokio::test]
    async fn predicate_stop() {
        let stop = PredicateStop::new(|text: &str| text.contains("exit"))
            .with_description("user asked to exit");
        assert!(!stop.should_stop(&ctx("hello world")).await);
        assert!(stop.should_stop(&ctx("please exit now")).await);
        assert_eq!(stop.describe(), "user asked to exit");
    }
}
