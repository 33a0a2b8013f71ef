//! System instruction for the SQL analyst agent.

use crate::tools::ToolRegistry;

/// Appended to every format-error observation.
pub const FORMAT_REMINDER: &str = "Respond with 'Thought:' followed by either \
'Action:' and 'Action Input:' (a single JSON object on the following line), \
or by 'Answer:' with the final answer in plain language.";

/// Build the system prompt with tool definitions.
pub fn build_system_prompt(tools: &ToolRegistry) -> String {
    let tool_names = tools.names().join(", ");
    let tool_descriptions = tools
        .specs()
        .map(|t| {
            format!(
                "- **{}**: {}\n  Action Input: {}",
                t.name,
                t.description,
                t.input_example()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<instructions>
Your task is to act as an expert SQL data analyst. You answer user questions by generating and executing SQL queries against a SQLite sales database.

**CRITICAL RULE:** You MUST respond in the following format, without any preamble, conversational text, or explanation. Your entire response MUST start with 'Thought:'.
```
Thought: [Your step-by-step reasoning about the user's query and your plan.]
Action: [The name of the tool to use. Must be one of: {tool_names}]
Action Input: [A valid JSON object with the parameters for the tool.]
```
After each action you will receive an 'Observation:' with the tool result. Never write an Observation yourself.

When you have enough information, respond instead with:
```
Thought: [Why you can now answer.]
Answer: [The final answer in plain language.]
```

**TOOL REFERENCE:**
{tool_descriptions}

**PROCESS:**
1. Analyze the user's question.
2. If you are not certain of the table structure, use `retrieve_schema_context` first.
3. Generate and execute a single SELECT query using `execute_sql_query`. Use SQLite date functions (e.g., `DATE('now', ...)`, `STRFTIME(...)`).
4. If a query fails, read the error, fix the SQL, and try again.
5. Once you have the result, give the answer starting with 'Answer:'. Describe the figures in words; never put SQL in the answer.
</instructions>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{SchemaRetriever, SqlExecutor};
    use crate::vector_index::InMemoryVectorIndex;
    use std::sync::Arc;

    #[test]
    fn prompt_lists_both_tools_and_the_grammar() {
        let registry = ToolRegistry::with_default_tools(
            SchemaRetriever::new(Arc::new(InMemoryVectorIndex::default()), 2),
            SqlExecutor::new("unused.db", 10),
        );
        let prompt = build_system_prompt(&registry);
        assert!(prompt.contains("retrieve_schema_context, execute_sql_query"));
        assert!(prompt.contains("{\"natural_language_query\": <string>}"));
        assert!(prompt.contains("{\"sql_query\": <string>}"));
        assert!(prompt.contains("Action Input:"));
        assert!(prompt.contains("Answer:"));
    }
}
