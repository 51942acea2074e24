//! Oracle backed by an OpenAI-compatible chat-completions endpoint

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{EdgeType, MemoryNode};
use crate::oracle::{ClusterItem, ConceptDraft, RelationKind, SemanticOracle, SubCluster};

const SYSTEM_PROMPT: &str = "You organise a personal knowledge graph. \
Answer with a single JSON object and nothing else.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct RelationReply {
    relation: RelationKind,
}

#[derive(Debug, Deserialize)]
struct InferenceReply {
    statement: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregateReply {
    concept: Option<ConceptDraft>,
}

#[derive(Debug, Deserialize)]
struct SplitReply {
    clusters: Vec<RawSubCluster>,
}

#[derive(Debug, Deserialize)]
struct RawSubCluster {
    ids: Vec<String>,
    #[serde(default)]
    theme: String,
}

/// Semantic oracle talking to a chat-completions HTTP API
pub struct HttpOracle {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpOracle {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.oracle_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.oracle_base_url.trim_end_matches('/').to_string(),
            model: config.oracle_model.clone(),
            api_key: std::env::var(&config.oracle_api_key_env).ok(),
            timeout_ms: config.oracle_timeout.as_millis() as u64,
        })
    }

    async fn ask<T: DeserializeOwned>(&self, prompt: String) -> Result<T> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        let mut builder = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout("oracle request", self.timeout_ms)
            } else {
                Error::oracle(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::oracle(format!("Failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::oracle(format!("Oracle API error ({}): {}", status, body)));
        }

        let reply: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::oracle(format!("Failed to parse response: {}", e)))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::oracle("Response had no choices"))?;

        parse_json_object(&content)
    }
}

/// Parse the first `{ ... }` span of a model reply
fn parse_json_object<T: DeserializeOwned>(content: &str) -> Result<T> {
    let start = content.find('{');
    let end = content.rfind('}');
    let slice = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(Error::oracle(format!("No JSON object in reply: {}", content))),
    };
    serde_json::from_str(slice).map_err(|e| Error::oracle(format!("Malformed reply: {}", e)))
}

fn describe(node: &MemoryNode) -> serde_json::Value {
    json!({
        "key": node.title(),
        "value": node.content,
        "tags": node.tags,
        "background": node.background,
    })
}

#[async_trait]
impl SemanticOracle for HttpOracle {
    async fn classify_relation(&self, a: &MemoryNode, b: &MemoryNode) -> Result<RelationKind> {
        let prompt = format!(
            "Statement A: {}\nStatement B: {}\n\
             How does A relate to B? Reply {{\"relation\": X}} where X is one of \
             CAUSE (A causes B), CONDITION (A is a condition for B), RELATE_TO, CONFLICT, NONE.",
            describe(a),
            describe(b)
        );
        let reply: RelationReply = self.ask(prompt).await?;
        Ok(reply.relation)
    }

    async fn derive_inference(
        &self,
        source: &MemoryNode,
        target: &MemoryNode,
        relation: EdgeType,
    ) -> Result<Option<String>> {
        let prompt = format!(
            "Source: {}\nTarget: {}\nRelation: source {} target.\n\
             State one new fact that follows, as {{\"statement\": \"...\"}}, \
             or {{\"statement\": null}} if nothing follows.",
            describe(source),
            describe(target),
            relation
        );
        let reply: InferenceReply = self.ask(prompt).await?;
        Ok(reply.statement.filter(|s| !s.trim().is_empty()))
    }

    async fn propose_aggregate(&self, nodes: &[MemoryNode]) -> Result<Option<ConceptDraft>> {
        let items: Vec<serde_json::Value> = nodes.iter().map(describe).collect();
        let prompt = format!(
            "Statements: {}\n\
             If they share one higher-level concept reply {{\"concept\": {{\"key\": ..., \
             \"value\": ..., \"tags\": [...], \"background\": ...}}}}, \
             otherwise {{\"concept\": null}}.",
            serde_json::Value::Array(items)
        );
        let reply: AggregateReply = self.ask(prompt).await?;
        Ok(reply.concept)
    }

    async fn summarize_cluster(&self, items: &[ClusterItem]) -> Result<ConceptDraft> {
        let prompt = format!(
            "Memories: {}\n\
             Summarize them as {{\"key\": short title, \"value\": summary, \
             \"tags\": [...], \"background\": what they have in common}}.",
            serde_json::to_string(items)?
        );
        self.ask(prompt).await
    }

    async fn split_cluster(&self, items: &[ClusterItem]) -> Result<Vec<SubCluster>> {
        let prompt = format!(
            "Memories: {}\n\
             Group them by theme. Each id may appear in at most one group and each group \
             holds 2 to 10 ids. Reply {{\"clusters\": [{{\"ids\": [...], \"theme\": ...}}]}}.",
            serde_json::to_string(items)?
        );
        let reply: SplitReply = self.ask(prompt).await?;

        Ok(reply
            .clusters
            .into_iter()
            .map(|raw| SubCluster {
                ids: raw
                    .ids
                    .iter()
                    .filter_map(|id| Uuid::parse_str(id.trim()).ok())
                    .collect(),
                theme: raw.theme,
            })
            .collect())
    }
}
