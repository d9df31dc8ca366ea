//! Interactive tools exposed via Model Context Protocol
//!
//! Provides `greet`, `multi-greet`, `summarize` and `search`. `summarize` and
//! `search` reach back into the client through `sampling/createMessage` or
//! delegate to the search collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_sdk::{
    macros,
    schema::{CallToolResult, ContentBlock, TextContent},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::mcp::dispatcher::{ToolDispatcher, ToolError, ToolHandler};
use crate::search::{CollaboratorError, Neighbor, SearchBackend};
use crate::session::{LogLevel, SessionContext};
use crate::transport::TransportMode;

pub const SUMMARY_MAX_TOKENS: u32 = 500;
pub const SUMMARY_FALLBACK: &str = "Unable to generate summary";

#[macros::mcp_tool(name = "greet", description = "A simple greeting tool")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GreetTool {
    /// Name to greet
    pub name: String,
}

#[macros::mcp_tool(
    name = "multi-greet",
    description = "A tool that sends different greetings with delays between them"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct MultiGreetTool {
    /// Name to greet
    pub name: String,
}

#[macros::mcp_tool(
    name = "summarize",
    description = "Summarize any text using an LLM provided by the client"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SummarizeTool {
    /// Text to summarize
    pub text: String,
}

#[macros::mcp_tool(
    name = "search",
    description = "Search the document collection and summarize the closest matches"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchTool {
    /// Natural language query
    pub query: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSettings {
    pub notification_delay: Duration,
    pub search_limit: usize,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            notification_delay: Duration::from_millis(1000),
            search_limit: 3,
        }
    }
}

pub fn register_tools(
    dispatcher: &mut ToolDispatcher,
    backend: SearchBackend,
    settings: ToolSettings,
) {
    dispatcher.register(GreetTool::tool(), Arc::new(GreetHandler));
    dispatcher.register(
        MultiGreetTool::tool(),
        Arc::new(MultiGreetHandler {
            delay: settings.notification_delay,
        }),
    );
    dispatcher.register(SummarizeTool::tool(), Arc::new(SummarizeHandler));
    dispatcher.register(
        SearchTool::tool(),
        Arc::new(SearchHandler {
            backend,
            limit: settings.search_limit,
        }),
    );
}

pub struct GreetHandler;

#[async_trait]
impl ToolHandler for GreetHandler {
    async fn call(
        &self,
        arguments: Map<String, Value>,
        _context: SessionContext,
    ) -> Result<CallToolResult, ToolError> {
        let GreetTool { name } = parse_arguments(arguments)?;
        Ok(text_result(vec![format!("Hello, {name}!")]))
    }
}

pub struct MultiGreetHandler {
    delay: Duration,
}

#[async_trait]
impl ToolHandler for MultiGreetHandler {
    async fn call(
        &self,
        arguments: Map<String, Value>,
        context: SessionContext,
    ) -> Result<CallToolResult, ToolError> {
        let MultiGreetTool { name } = parse_arguments(arguments)?;

        context
            .log(LogLevel::Debug, format!("Starting multi-greet for {name}"))
            .await?;

        tokio::time::sleep(self.delay).await;
        context
            .log(LogLevel::Info, format!("Sending first greeting to {name}"))
            .await?;

        tokio::time::sleep(self.delay).await;
        context
            .log(LogLevel::Info, format!("Sending second greeting to {name}"))
            .await?;

        Ok(text_result(vec![format!("Good morning, {name}!")]))
    }
}

pub struct SummarizeHandler;

#[async_trait]
impl ToolHandler for SummarizeHandler {
    async fn call(
        &self,
        arguments: Map<String, Value>,
        context: SessionContext,
    ) -> Result<CallToolResult, ToolError> {
        let SummarizeTool { text } = parse_arguments(arguments)?;

        if !context.supports_sampling().await {
            return Err(ToolError::Precondition(
                "Client does not support sampling".to_string(),
            ));
        }
        if context.mode() != TransportMode::Streaming {
            return Err(ToolError::Precondition(
                "Client does not support nested calls".to_string(),
            ));
        }

        let reply = context
            .create_message(json!({
                "messages": [{
                    "role": "user",
                    "content": {
                        "type": "text",
                        "text": format!("Please summarize the following text concisely:\n\n{text}"),
                    },
                }],
                "maxTokens": SUMMARY_MAX_TOKENS,
            }))
            .await?;

        Ok(text_result(sampled_texts(&reply)))
    }
}

/// Text blocks of a `sampling/createMessage` result; anything else becomes the fallback.
fn sampled_texts(reply: &Value) -> Vec<String> {
    let blocks = match reply.get("content") {
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(item) => vec![item],
        None => vec![],
    };

    if blocks.is_empty() {
        return vec![SUMMARY_FALLBACK.to_string()];
    }

    blocks
        .into_iter()
        .map(|block| match (block.get("type").and_then(Value::as_str), block.get("text")) {
            (Some("text"), Some(Value::String(text))) => text.clone(),
            _ => SUMMARY_FALLBACK.to_string(),
        })
        .collect()
}

pub struct SearchHandler {
    backend: SearchBackend,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct SearchHit {
    #[serde(flatten)]
    neighbor: Neighbor,
    summary: String,
}

#[async_trait]
impl ToolHandler for SearchHandler {
    async fn call(
        &self,
        arguments: Map<String, Value>,
        context: SessionContext,
    ) -> Result<CallToolResult, ToolError> {
        let SearchTool { query } = parse_arguments(arguments)?;
        context
            .log(LogLevel::Info, format!("Querying: \"{query}\""))
            .await?;

        let backend = self.backend.clone();
        let limit = self.limit;
        let search_query = query.clone();
        let hits = tokio::task::spawn_blocking(move || -> Result<Vec<SearchHit>, CollaboratorError> {
            let vector = backend.embedder.embed(&search_query)?;
            backend
                .index
                .nearest(&vector, limit)?
                .into_iter()
                .map(|neighbor| {
                    let summary = backend.summarizer.transform(&neighbor.record.content)?;
                    Ok(SearchHit { neighbor, summary })
                })
                .collect()
        })
        .await
        .map_err(|err| ToolError::Internal(format!("search task failed: {err}")))??;

        debug!(query = %query, hits = hits.len(), "search completed");

        let texts = if hits.is_empty() {
            vec![format!("No documents matched \"{query}\".")]
        } else {
            hits.iter()
                .map(|hit| {
                    format!(
                        "File: {} (distance {:.4})\nQuestion: {}\nSummary: {}\nContent: {}",
                        hit.neighbor.record.file_name,
                        hit.neighbor.distance,
                        query,
                        hit.summary,
                        hit.neighbor.record.content
                    )
                })
                .collect()
        };

        let mut result = text_result(texts);
        result.structured_content = Some(Map::from_iter([
            ("query".to_string(), Value::String(query)),
            (
                "results".to_string(),
                serde_json::to_value(&hits).map_err(|err| ToolError::Internal(err.to_string()))?,
            ),
        ]));
        Ok(result)
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|err| ToolError::InvalidArguments(err.to_string()))
}

fn text_result(texts: Vec<String>) -> CallToolResult {
    CallToolResult {
        content: texts
            .into_iter()
            .map(|text| ContentBlock::from(TextContent::new(text, None, None)))
            .collect(),
        is_error: None,
        meta: None,
        structured_content: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_descriptors_carry_protocol_names() {
        let names = [
            GreetTool::tool().name,
            MultiGreetTool::tool().name,
            SummarizeTool::tool().name,
            SearchTool::tool().name,
        ];
        assert_eq!(names, ["greet", "multi-greet", "summarize", "search"]);
    }

    #[test]
    fn sampled_texts_keep_text_blocks_and_replace_others() {
        assert_eq!(
            sampled_texts(&json!({"content": {"type": "text", "text": "short"}})),
            vec!["short".to_string()]
        );
        assert_eq!(
            sampled_texts(&json!({"content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "..."}
            ]})),
            vec!["one".to_string(), SUMMARY_FALLBACK.to_string()]
        );
        assert_eq!(
            sampled_texts(&json!({"role": "assistant"})),
            vec![SUMMARY_FALLBACK.to_string()]
        );
    }

    #[test]
    fn arguments_are_validated_against_the_tool_shape() {
        let ok: GreetTool = parse_arguments(Map::from_iter([(
            "name".to_string(),
            json!("Ada"),
        )]))
        .expect("valid");
        assert_eq!(ok.name, "Ada");

        assert!(matches!(
            parse_arguments::<GreetTool>(Map::new()),
            Err(ToolError::InvalidArguments(_))
        ));
    }
}
