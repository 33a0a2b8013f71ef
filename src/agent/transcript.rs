//! Conversation transcript for a single agent turn.

use serde::Serialize;
use serde_json::{Map, Value};

use super::prompt::FORMAT_REMINDER;
use crate::llm::ChatMessage;

/// One entry of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Reasoning with no action attached.
    Thought { text: String },
    /// A validated tool call, with the thought that preceded it.
    Action {
        thought: String,
        tool: String,
        input: Map<String, Value>,
    },
    /// Tool output.
    Observation { text: String },
    /// Final answer, with the thought that preceded it.
    Answer { thought: String, text: String },
    /// Feedback to the model about a malformed or rejected step.
    ProtocolError { text: String },
}

impl Step {
    /// Render the step the way it goes back to the model.
    fn render(&self) -> Vec<ChatMessage> {
        match self {
            Step::Thought { text } => vec![
                ChatMessage::assistant(format!("Thought: {}", text)),
                ChatMessage::user("Continue with an Action or an Answer."),
            ],
            Step::Action {
                thought,
                tool,
                input,
            } => vec![ChatMessage::assistant(format!(
                "Thought: {}\nAction: {}\nAction Input: {}",
                thought,
                tool,
                Value::Object(input.clone())
            ))],
            Step::Observation { text } => vec![ChatMessage::user(format!("Observation: {}", text))],
            Step::Answer { thought, text } => vec![ChatMessage::assistant(format!(
                "Thought: {}\nAnswer: {}",
                thought, text
            ))],
            Step::ProtocolError { text } => vec![ChatMessage::user(format!(
                "Observation: Format error: {}\n{}",
                text, FORMAT_REMINDER
            ))],
        }
    }
}

/// Append-only record of one turn: the user query plus every step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    query: String,
    steps: Vec<Step>,
}

impl Transcript {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            steps: Vec::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Whether the latest step other than protocol feedback is a bare thought.
    pub fn ends_with_thought(&self) -> bool {
        self.steps
            .iter()
            .rev()
            .find(|s| !matches!(s, Step::ProtocolError { .. }))
            .map(|s| matches!(s, Step::Thought { .. }))
            .unwrap_or(false)
    }

    /// Tool names of all Action steps, in order.
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|s| match s {
            Step::Action { tool, .. } => Some(tool.as_str()),
            _ => None,
        })
    }

    /// Messages for the next model call.
    pub fn to_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.steps.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.push(ChatMessage::user(self.query.clone()));
        for step in &self.steps {
            messages.extend(step.render());
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use serde_json::json;

    #[test]
    fn messages_start_with_system_and_query() {
        let transcript = Transcript::new("What are total sales by region?");
        let messages = transcript.to_messages("rules");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ChatMessage::system("rules"));
        assert_eq!(messages[1].content, "What are total sales by region?");
    }

    #[test]
    fn steps_render_in_grammar() {
        let mut transcript = Transcript::new("q");
        transcript.push(Step::Action {
            thought: "look up the schema".to_string(),
            tool: "retrieve_schema_context".to_string(),
            input: json!({"natural_language_query": "sales"})
                .as_object()
                .cloned()
                .expect("object"),
        });
        transcript.push(Step::Observation {
            text: "Table Name: sales".to_string(),
        });
        transcript.push(Step::ProtocolError {
            text: "missing Thought".to_string(),
        });

        let messages = transcript.to_messages("rules");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(
            messages[2].content,
            "Thought: look up the schema\nAction: retrieve_schema_context\n\
             Action Input: {\"natural_language_query\":\"sales\"}"
        );
        assert_eq!(messages[3].role, Role::User);
        assert_eq!(messages[3].content, "Observation: Table Name: sales");
        assert!(messages[4]
            .content
            .starts_with("Observation: Format error: missing Thought"));
    }

    #[test]
    fn ends_with_thought_skips_protocol_feedback() {
        let mut transcript = Transcript::new("q");
        assert!(!transcript.ends_with_thought());
        transcript.push(Step::Thought {
            text: "hmm".to_string(),
        });
        transcript.push(Step::ProtocolError {
            text: "bad".to_string(),
        });
        assert!(transcript.ends_with_thought());
        transcript.push(Step::Observation {
            text: "rows".to_string(),
        });
        assert!(!transcript.ends_with_thought());
    }
}
