//! Pre-call intent classifier.
//!
//! One cheap one-shot request labels the incoming user turn as `social`
//! (greeting, chit-chat) or `task` (actual work). The run engine uses the
//! label to tag the run; misclassification is harmless, so every failure
//! path defaults to `task`.

use futures_util::StreamExt;

use strand_domain::chat::ChatMessage;
use strand_domain::error::Result;
use strand_domain::stream::StreamEvent;
use strand_domain::text::truncate_runes;

use crate::traits::{Provider, TurnRequest};

/// The classifier's answer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Social,
    Task,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Social => "social",
            Self::Task => "task",
        }
    }
}

/// Maximum runes of user text included in the probe.
const PROBE_INPUT_MAX_RUNES: usize = 600;

/// Build the dedicated one-shot classification request shape. Adapters
/// recognize `intent_probe` and keep the reply to a few tokens.
pub fn build_intent_request(user_text: &str, model: Option<String>) -> TurnRequest {
    let snippet = truncate_runes(user_text, PROBE_INPUT_MAX_RUNES);
    let prompt = format!(
        "Classify the user message below as exactly one word.\n\
         Reply `social` when it is a greeting, thanks, or small talk with no work to do.\n\
         Reply `task` when it asks for any work, information, or tool use.\n\n\
         User message:\n{snippet}\n\nAnswer with one word: social or task."
    );
    TurnRequest {
        messages: vec![ChatMessage::user(prompt)],
        tools: Vec::new(),
        temperature: Some(0.0),
        max_tokens: Some(8),
        model,
        intent_probe: true,
    }
}

/// Parse a classifier reply into an intent. Anything that is not clearly
/// `social` counts as `task`.
pub fn parse_intent(reply: &str) -> Intent {
    let token = reply
        .trim()
        .trim_matches(|c: char| !c.is_ascii_alphabetic())
        .to_ascii_lowercase();
    if token == "social" {
        Intent::Social
    } else {
        Intent::Task
    }
}

/// Run the probe against a provider. Failures default to `task`.
pub async fn classify_intent(
    provider: &dyn Provider,
    user_text: &str,
    model: Option<String>,
) -> Result<Intent> {
    let req = build_intent_request(user_text, model);
    let mut stream = provider.stream_turn(req).await?;
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        match event {
            Ok(StreamEvent::TextDelta { text }) => reply.push_str(&text),
            Ok(StreamEvent::Completed { .. }) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "intent probe failed, defaulting to task");
                return Ok(Intent::Task);
            }
        }
    }
    Ok(parse_intent(&reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_decorated_tokens() {
        assert_eq!(parse_intent("social"), Intent::Social);
        assert_eq!(parse_intent("  Social.\n"), Intent::Social);
        assert_eq!(parse_intent("`social`"), Intent::Social);
    }

    #[test]
    fn parse_defaults_to_task() {
        assert_eq!(parse_intent("task"), Intent::Task);
        assert_eq!(parse_intent("I think this is a task"), Intent::Task);
        assert_eq!(parse_intent(""), Intent::Task);
        assert_eq!(parse_intent("unsure"), Intent::Task);
    }

    #[test]
    fn probe_request_shape() {
        let req = build_intent_request("hey there!", None);
        assert!(req.intent_probe);
        assert!(req.tools.is_empty());
        assert_eq!(req.max_tokens, Some(8));
        assert_eq!(req.temperature, Some(0.0));
        let prompt = req.messages[0].content.extract_all_text();
        assert!(prompt.contains("hey there!"));
        assert!(prompt.contains("social or task"));
    }

    #[test]
    fn probe_truncates_long_input() {
        let long = "x".repeat(5_000);
        let req = build_intent_request(&long, None);
        let prompt = req.messages[0].content.extract_all_text();
        assert!(prompt.chars().count() < 1_000);
    }

    #[tokio::test]
    async fn classify_with_scripted_provider() {
        use crate::testing::ScriptedProvider;
        let provider = ScriptedProvider::text_replies(&["social"]);
        let intent = classify_intent(&provider, "hello!", None).await.unwrap();
        assert_eq!(intent, Intent::Social);
    }
}
