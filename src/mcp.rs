use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    error,
    index::SearchHit,
    retriever::{PolicySearch, Retrieval},
};

#[derive(Clone)]
pub struct PolicyMcpServer {
    search: PolicySearch,
    tool_router: ToolRouter<Self>,
}

impl PolicyMcpServer {
    pub fn new(search: PolicySearch) -> Self {
        Self {
            search,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl PolicyMcpServer {
    /// Semantic search over the travel policy document.
    #[tool(
        name = "search_policies",
        description = "Search the travel policy document for passages relevant to a question, such as budget limits, accommodation standards, or booking rules. Returns the most relevant passages separated by blank lines."
    )]
    pub async fn search_policies(
        &self,
        params: Parameters<SearchPoliciesParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let search = self.search.clone();
        let query = params.query.clone();
        let limit = params.limit;

        // Embedding is CPU bound; keep it off the transport's worker.
        let outcome =
            tokio::task::spawn_blocking(move || search.search(&query, limit))
                .await
                .map_err(|e| mcp_error("search task failed", e))?;

        let retrieval = match outcome {
            Ok(retrieval) => retrieval,
            Err(e) => {
                warn!(error = %e, "policy search failed");
                return Ok(CallToolResult::error(vec![Content::text(
                    format!("Policy search unavailable: {e}"),
                )]));
            }
        };

        let response = SearchPoliciesResponse::new(
            params.query,
            &self.search.document_path().display().to_string(),
            &retrieval,
        );
        let structured = serde_json::to_value(&response)
            .map_err(|e| mcp_error("failed to serialize search results", e))?;

        let mut result =
            CallToolResult::success(vec![Content::text(retrieval.into_text())]);
        result.structured_content = Some(structured);
        Ok(result)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for PolicyMcpServer {
    fn get_info(&self) -> ServerInfo {
        let mut server_info =
            Implementation::new("policyseek", env!("CARGO_PKG_VERSION"));
        server_info.title = Some("policyseek MCP".to_string());
        let mut info = ServerInfo::default();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info.server_info = server_info;
        info.instructions = Some(
            "Use search_policies to check travel plans against company policy before recommending destinations, accommodation, or budgets."
                .to_string(),
        );
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchPoliciesParams {
    /// What to look up in the policy document.
    pub query: String,
    /// Maximum number of passages (default: 3).
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchPoliciesResponse {
    query: String,
    document: String,
    found: bool,
    result_count: usize,
    results: Vec<PassageItem>,
}

impl SearchPoliciesResponse {
    fn new(query: String, document: &str, retrieval: &Retrieval) -> Self {
        let (found, results) = match retrieval {
            Retrieval::Missing(_) => (false, Vec::new()),
            Retrieval::Found(hits) => {
                (true, hits.iter().map(PassageItem::from).collect())
            }
        };
        Self {
            query,
            document: document.to_string(),
            found,
            result_count: results.len(),
            results,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PassageItem {
    index: usize,
    score: f32,
    start_offset: usize,
    end_offset: usize,
    text: String,
}

impl From<&SearchHit> for PassageItem {
    fn from(hit: &SearchHit) -> Self {
        Self {
            index: hit.chunk.index,
            score: hit.score,
            start_offset: hit.chunk.start_offset,
            end_offset: hit.chunk.end_offset,
            text: hit.chunk.content.trim().to_string(),
        }
    }
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

/// Serve `search_policies` over stdio until the client disconnects.
pub fn run_mcp(search: PolicySearch) -> error::Result<()> {
    info!(
        document = %search.document_path().display(),
        model = search.retriever().embedder().model_id(),
        "starting MCP server"
    );
    let server = PolicyMcpServer::new(search);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        running.waiting().await.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::*;
    use crate::{
        embedding::{Embedder, HashEmbedder},
        error::{Error, Result},
        retriever::Retriever,
    };

    const POLICY: &str = "\
Budget limit is $5000 per person.

Accommodations must be rated 4-star or higher.

Travel insurance is mandatory for international trips.";

    fn server_for(path: &Path, embedder: Arc<dyn Embedder>) -> PolicyMcpServer {
        let retriever = Retriever::new(embedder)
            .with_chunking(crate::chunking::ChunkingConfig::new(60, 0))
            .unwrap();
        PolicyMcpServer::new(PolicySearch::new(
            Arc::new(retriever),
            path.to_path_buf(),
        ))
    }

    fn text_of(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn search_tool_returns_text_and_structured_hits() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("policies.txt");
        std::fs::write(&path, POLICY).unwrap();

        let server = server_for(&path, Arc::new(HashEmbedder::new(512)));
        let result = server
            .search_policies(Parameters(SearchPoliciesParams {
                query: "travel insurance".to_string(),
                limit: Some(2),
            }))
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(false));
        let text = text_of(&result);
        assert!(text.starts_with("Travel insurance is mandatory"));

        let structured = result.structured_content.expect("structured");
        assert_eq!(structured.get("found"), Some(&json!(true)));
        assert_eq!(structured.get("resultCount"), Some(&json!(2)));
        let results = structured
            .get("results")
            .and_then(|v| v.as_array())
            .expect("results array");
        assert_eq!(
            results[0].get("text").and_then(|v| v.as_str()),
            Some("Travel insurance is mandatory for international trips.")
        );
    }

    #[tokio::test]
    async fn missing_document_is_reported_as_text() {
        let tmp = tempfile::tempdir().unwrap();
        let server = server_for(
            &tmp.path().join("absent.txt"),
            Arc::new(HashEmbedder::default()),
        );

        let result = server
            .search_policies(Parameters(SearchPoliciesParams {
                query: "budget".to_string(),
                limit: None,
            }))
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(false));
        assert_eq!(text_of(&result), "Policies file not found.");
        let structured = result.structured_content.expect("structured");
        assert_eq!(structured.get("found"), Some(&json!(false)));
    }

    struct Offline;

    impl Embedder for Offline {
        fn model_id(&self) -> &str {
            "offline"
        }

        fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(Error::EmbeddingUnavailable("no model".to_string()))
        }
    }

    #[tokio::test]
    async fn embedding_failure_is_tool_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("policies.txt");
        std::fs::write(&path, POLICY).unwrap();

        let server = server_for(&path, Arc::new(Offline));
        let result = server
            .search_policies(Parameters(SearchPoliciesParams {
                query: "budget".to_string(),
                limit: None,
            }))
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert!(text_of(&result).starts_with("Policy search unavailable:"));
    }
}
