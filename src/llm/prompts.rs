//! Prompt templates for SQL generation and result judgment.
//!
//! The schema context block comes from
//! [`DatabaseSchema::to_prompt_context`](crate::models::DatabaseSchema::to_prompt_context);
//! this module only assembles the surrounding instructions.

use serde_json::{Map, Value};

/// System prompt for the SQL generation call.
pub const SQL_GENERATION_SYSTEM: &str = "\
You are a PostgreSQL SQL expert.

Your task is to convert natural language questions into valid PostgreSQL SQL queries.

## Rules:
1. ONLY generate SELECT queries or CTE (WITH ... SELECT) queries
2. NEVER generate INSERT, UPDATE, DELETE, DROP, CREATE, ALTER, or any DDL/DML statements
3. Use proper PostgreSQL syntax and functions
4. Always use explicit table aliases for clarity
5. Include appropriate LIMIT clauses for potentially large result sets
6. Use proper date/time functions (CURRENT_DATE, CURRENT_TIMESTAMP, INTERVAL, etc.)
7. Handle NULL values appropriately
8. Use appropriate aggregation functions (COUNT, SUM, AVG, etc.) when needed

## Output Format:
Return ONLY the SQL query wrapped in ```sql ... ``` code block.
Do not include any explanation before or after the SQL.";

/// Builds the user prompt for SQL generation.
///
/// On retries, `previous_sql` and `error_feedback` are both present and the
/// prompt asks the model to correct the rejected statement.
pub fn sql_generation_user(
    question: &str,
    schema_context: &str,
    context: Option<&str>,
    previous_sql: Option<&str>,
    error_feedback: Option<&str>,
) -> String {
    let mut parts = vec![
        "## Database Schema:".to_string(),
        schema_context.to_string(),
        String::new(),
    ];

    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        parts.push("## Additional Context:".to_string());
        parts.push(context.to_string());
        parts.push(String::new());
    }

    if let (Some(sql), Some(feedback)) = (previous_sql, error_feedback) {
        parts.push("## Previous Attempt (Failed):".to_string());
        parts.push(format!("```sql\n{sql}\n```"));
        parts.push(format!("Error: {feedback}"));
        parts.push("Please fix the issue and generate a correct query.".to_string());
        parts.push(String::new());
    }

    parts.push("## Question:".to_string());
    parts.push(question.to_string());

    parts.join("\n")
}

/// System prompt for the result judgment call.
pub const RESULT_JUDGMENT_SYSTEM: &str = "\
You are a SQL query result validator. Your task is to evaluate whether the \
query results match the user's original question.

Analyze:
1. Does the SQL query correctly interpret the user's intent?
2. Do the results make sense given the question?
3. Are there any obvious errors or mismatches?
4. Are the column names and data types appropriate for the question?
5. Does the result set size seem reasonable for the question?

Return a JSON object with:
{
  \"confidence\": <0-100 integer>,
  \"is_acceptable\": <true or false>,
  \"explanation\": \"<brief explanation of why the results match or don't match>\"
}

Confidence levels:
- 90-100: Results clearly match the question, SQL is well-formed and accurate
- 70-89: Results likely match, minor uncertainties or potential improvements exist
- 50-69: Results may not fully match, significant concerns or ambiguities present
- 0-49: Results likely don't match the question, major issues detected

Be concise but specific in your explanation. Focus on semantic correctness \
rather than minor formatting issues.";

/// Builds the user prompt for result judgment from a bounded row sample.
pub fn result_judgment_user(
    question: &str,
    sql: &str,
    sample_rows: &[Map<String, Value>],
    total_count: usize,
) -> String {
    let sample = serde_json::to_string_pretty(sample_rows).unwrap_or_else(|_| "[]".to_string());
    [
        "## Original Question:".to_string(),
        question.to_string(),
        String::new(),
        "## Executed SQL:".to_string(),
        "```sql".to_string(),
        sql.to_string(),
        "```".to_string(),
        String::new(),
        format!(
            "## Results (showing {} of {} rows):",
            sample_rows.len(),
            total_count
        ),
        "```json".to_string(),
        sample,
        "```".to_string(),
        String::new(),
        "Please evaluate if the results match the user's question and return \
         your assessment as a JSON object."
            .to_string(),
    ]
    .join("\n")
}
