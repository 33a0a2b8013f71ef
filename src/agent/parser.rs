//! Strict parser for the model's plain-text step grammar.
//!
//! ```text
//! Thought: <reasoning, may continue over several lines>
//! Action: <tool_name>
//! Action Input: <one JSON object>
//! ```
//!
//! or
//!
//! ```text
//! Thought: <reasoning>
//! Answer: <final answer, runs to the end of the reply>
//! ```
//!
//! A reply made of a `Thought:` alone is a thought-only step. Anything else is
//! a [`ParseError`], which the agent feeds back to the model.

use serde_json::{Map, Value};
use thiserror::Error;

const THOUGHT: &str = "Thought:";
const ACTION: &str = "Action:";
const ACTION_INPUT: &str = "Action Input:";
const ANSWER: &str = "Answer:";
const OBSERVATION: &str = "Observation:";

/// The single step extracted from one model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStep {
    Thought(String),
    Action {
        thought: String,
        tool: String,
        input: Map<String, Value>,
    },
    Answer {
        thought: String,
        answer: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("the response was empty")]
    Empty,

    #[error("the response must start with 'Thought:'")]
    MissingThought,

    #[error("'Thought:' must be followed by reasoning text")]
    EmptyThought,

    #[error("'Action Input:' appeared without a preceding 'Action:' line")]
    InputWithoutAction,

    #[error("'Action:' must name a tool")]
    EmptyToolName,

    #[error("'Action:' must be followed by an 'Action Input:' line")]
    MissingActionInput,

    #[error("'Action Input:' is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("'Action Input:' must be a JSON object")]
    NotAnObject,

    #[error("nothing may follow the 'Action Input:' JSON object")]
    TrailingContent,

    #[error("a response must contain either an Action or an Answer, not both")]
    ActionAndAnswer,

    #[error("'Answer:' must be followed by the answer text")]
    EmptyAnswer,

    #[error("'Observation:' lines come from tools; never write them yourself")]
    HallucinatedObservation,
}

/// A line and the byte offset where it starts.
struct Line<'a> {
    start: usize,
    text: &'a str,
}

impl<'a> Line<'a> {
    /// Text after `marker` if the line (ignoring indentation) starts with it.
    fn after(&self, marker: &str) -> Option<&'a str> {
        self.text.trim_start().strip_prefix(marker)
    }

    /// Byte offset just past `marker` in the whole reply.
    fn offset_after(&self, marker: &str) -> usize {
        let indent = self.text.len() - self.text.trim_start().len();
        self.start + indent + marker.len()
    }
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut offset = 0;
    text.split('\n')
        .map(|raw| {
            let line = Line {
                start: offset,
                text: raw.trim_end_matches('\r'),
            };
            offset += raw.len() + 1;
            line
        })
        .collect()
}

/// Parse one model reply.
pub fn parse_step(raw: &str) -> Result<ParsedStep, ParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }
    if !text.starts_with(THOUGHT) {
        return Err(ParseError::MissingThought);
    }

    let lines = split_lines(text);
    let mut thought = Vec::new();
    let mut index = 0;
    while index < lines.len() {
        let line = &lines[index];
        if line.after(ACTION_INPUT).is_some() {
            return Err(ParseError::InputWithoutAction);
        }
        if line.after(OBSERVATION).is_some() {
            return Err(ParseError::HallucinatedObservation);
        }
        if line.after(ACTION).is_some() || line.after(ANSWER).is_some() {
            break;
        }
        let content = if index == 0 {
            line.after(THOUGHT).unwrap_or(line.text)
        } else {
            line.text
        };
        thought.push(content.trim());
        index += 1;
    }
    let thought = thought.join("\n").trim().to_string();
    if thought.is_empty() {
        return Err(ParseError::EmptyThought);
    }

    let Some(marker) = lines.get(index) else {
        return Ok(ParsedStep::Thought(thought));
    };

    if marker.after(ANSWER).is_some() {
        let answer = text[marker.offset_after(ANSWER)..].trim();
        if answer.is_empty() {
            return Err(ParseError::EmptyAnswer);
        }
        if lines[index + 1..].iter().any(|l| l.after(ACTION).is_some()) {
            return Err(ParseError::ActionAndAnswer);
        }
        if lines[index + 1..].iter().any(|l| l.after(OBSERVATION).is_some()) {
            return Err(ParseError::HallucinatedObservation);
        }
        return Ok(ParsedStep::Answer {
            thought,
            answer: answer.to_string(),
        });
    }

    let tool = marker.after(ACTION).unwrap_or_default().trim();
    if tool.is_empty() {
        return Err(ParseError::EmptyToolName);
    }

    let input_line = lines[index + 1..]
        .iter()
        .find(|l| !l.text.trim().is_empty())
        .filter(|l| l.after(ACTION_INPUT).is_some())
        .ok_or(ParseError::MissingActionInput)?;

    let json = &text[input_line.offset_after(ACTION_INPUT)..];
    let mut stream = serde_json::Deserializer::from_str(json).into_iter::<Value>();
    let value = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) => return Err(ParseError::InvalidJson(e.to_string())),
        None => return Err(ParseError::InvalidJson("no JSON value".to_string())),
    };
    let Value::Object(input) = value else {
        return Err(ParseError::NotAnObject);
    };

    let rest = json[stream.byte_offset()..].trim();
    if !rest.is_empty() {
        if split_lines(rest).iter().any(|l| l.after(ANSWER).is_some()) {
            return Err(ParseError::ActionAndAnswer);
        }
        return Err(ParseError::TrailingContent);
    }

    Ok(ParsedStep::Action {
        thought,
        tool: tool.to_string(),
        input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_action_step() {
        let step = parse_step(
            "Thought: I need the schema first.\n\
             Action: retrieve_schema_context\n\
             Action Input: {\"natural_language_query\": \"sales by region\"}",
        )
        .expect("valid");
        assert_eq!(
            step,
            ParsedStep::Action {
                thought: "I need the schema first.".to_string(),
                tool: "retrieve_schema_context".to_string(),
                input: json!({"natural_language_query": "sales by region"})
                    .as_object()
                    .cloned()
                    .expect("object"),
            }
        );
    }

    #[test]
    fn parses_answer_step_spanning_lines() {
        let step = parse_step(
            "\n\nThought: I have the totals.\nAnswer: North leads with 1500.\nSouth follows.\n",
        )
        .expect("valid");
        assert_eq!(
            step,
            ParsedStep::Answer {
                thought: "I have the totals.".to_string(),
                answer: "North leads with 1500.\nSouth follows.".to_string(),
            }
        );
    }

    #[test]
    fn parses_thought_only_step() {
        let step = parse_step("Thought: Let me think about\nwhich tables matter.").expect("valid");
        assert_eq!(
            step,
            ParsedStep::Thought("Let me think about\nwhich tables matter.".to_string())
        );
    }

    #[test]
    fn action_input_may_span_lines() {
        let step = parse_step(
            "Thought: run it\nAction: execute_sql_query\nAction Input: {\n  \"sql_query\": \"SELECT 1\"\n}",
        )
        .expect("valid");
        assert!(matches!(step, ParsedStep::Action { ref tool, .. } if tool == "execute_sql_query"));
    }

    #[test]
    fn rejects_replies_without_markers() {
        assert_eq!(parse_step(""), Err(ParseError::Empty));
        assert_eq!(parse_step("   \n "), Err(ParseError::Empty));
        assert_eq!(
            parse_step("The total is 42."),
            Err(ParseError::MissingThought)
        );
        assert_eq!(
            parse_step("Answer: 42"),
            Err(ParseError::MissingThought)
        );
        assert_eq!(
            parse_step("thought: lowercase markers do not count\nAnswer: 42"),
            Err(ParseError::MissingThought)
        );
        assert_eq!(parse_step("Thought:   "), Err(ParseError::EmptyThought));
    }

    #[test]
    fn rejects_malformed_actions() {
        assert_eq!(
            parse_step("Thought: t\nAction: execute_sql_query"),
            Err(ParseError::MissingActionInput)
        );
        assert_eq!(
            parse_step("Thought: t\nAction:\nAction Input: {}"),
            Err(ParseError::EmptyToolName)
        );
        assert_eq!(
            parse_step("Thought:\nAction: x\nAction Input: {}"),
            Err(ParseError::EmptyThought)
        );
        assert_eq!(
            parse_step("Thought: t\nAction Input: {}"),
            Err(ParseError::InputWithoutAction)
        );
        assert!(matches!(
            parse_step("Thought: t\nAction: x\nAction Input: {not json"),
            Err(ParseError::InvalidJson(_))
        ));
        assert_eq!(
            parse_step("Thought: t\nAction: x\nAction Input: \"SELECT 1\""),
            Err(ParseError::NotAnObject)
        );
        assert_eq!(
            parse_step("Thought: t\nAction: x\nAction Input: {} {}"),
            Err(ParseError::TrailingContent)
        );
        assert_eq!(
            parse_step("Thought: t\nAction: x\nAction Input: {}\nObservation: made up"),
            Err(ParseError::TrailingContent)
        );
    }

    #[test]
    fn rejects_action_and_answer_together() {
        assert_eq!(
            parse_step("Thought: t\nAction: x\nAction Input: {}\nAnswer: done"),
            Err(ParseError::ActionAndAnswer)
        );
        assert_eq!(
            parse_step("Thought: t\nAnswer: done\nAction: x"),
            Err(ParseError::ActionAndAnswer)
        );
        assert_eq!(
            parse_step("Thought: t\nAnswer:   "),
            Err(ParseError::EmptyAnswer)
        );
    }

    #[test]
    fn rejects_invented_observations() {
        assert_eq!(
            parse_step("Thought: run it\nObservation: North,999\nAnswer: North sold 999."),
            Err(ParseError::HallucinatedObservation)
        );
        assert_eq!(
            parse_step("Thought: done\nAnswer: North sold 999.\nObservation: North,999"),
            Err(ParseError::HallucinatedObservation)
        );
        assert_eq!(
            parse_step("Thought: hmm\nObservation: made up"),
            Err(ParseError::HallucinatedObservation)
        );
    }

    #[test]
    fn blank_lines_may_separate_action_and_input() {
        let step = parse_step(
            "Thought: run it\nAction: execute_sql_query\n\n  \nAction Input: {\"sql_query\": \"SELECT 1\"}",
        )
        .expect("valid");
        assert!(matches!(
            step,
            ParsedStep::Action { ref tool, ref input, .. }
                if tool == "execute_sql_query" && input["sql_query"] == "SELECT 1"
        ));
        assert_eq!(
            parse_step("Thought: t\nAction: x\nsomething else\nAction Input: {}"),
            Err(ParseError::MissingActionInput)
        );
    }

    #[test]
    fn parsing_is_deterministic() {
        let raw = "Thought: t\nAction: x\nAction Input: {\"a\": 1}";
        assert_eq!(parse_step(raw), parse_step(raw));
    }
}
