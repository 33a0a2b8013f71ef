//! Agent module - the ReAct loop that turns a question into an answer.
//!
//! The agent follows a Thought / Action / Observation pattern:
//! 1. Seed the transcript with the system prompt and the user's question
//! 2. Ask the model for the next step and parse it against the step grammar
//! 3. On an Action, run the tool and append its output as an Observation
//! 4. Repeat until the model gives an Answer or a budget runs out
//!
//! Malformed or rejected steps are fed back to the model as format errors
//! rather than ending the turn.

mod agent_loop;
mod parser;
mod prompt;
mod transcript;

pub use agent_loop::{Agent, AgentError, AgentReply, AgentState, TurnOutcome};
pub use parser::{parse_step, ParseError, ParsedStep};
pub use prompt::{build_system_prompt, FORMAT_REMINDER};
pub use transcript::{Step, Transcript};
