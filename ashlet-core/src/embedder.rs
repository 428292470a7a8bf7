//! Embeddings HTTP client (§4.2): `Embed` and `EmbedBatch`, backed by a
//! single POST to `<base>/embeddings`.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AshletError;
use crate::error::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Embedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl Embedder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Embedder {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or(AshletError::EmptyEmbedding)
    }

    /// `EmbedBatch([])` returns empty without a network call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let prefix: String = body.chars().take(200).collect();
            return Err(AshletError::UnexpectedStatus(status, prefix));
        }

        let parsed: EmbeddingResponse = response.json().await?;
        if parsed.data.is_empty() {
            return Err(AshletError::EmptyEmbedding);
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
