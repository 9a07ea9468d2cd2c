use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Tag,
    Score,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Tag => "tag",
            JobKind::Score => "score",
        }
    }
}

/// External scoring/tagging model. Returns the raw prediction payload; the
/// parsers in `appraisal::parse` interpret it.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn predict(&self, image: &Path) -> Result<Value>;
}

/// Stand-in used when no endpoint is configured. Every call fails, which
/// drives the caller onto its fallback values.
pub struct NullOracle;

#[async_trait]
impl Oracle for NullOracle {
    async fn predict(&self, _image: &Path) -> Result<Value> {
        Err(anyhow!("oracle endpoint not configured"))
    }
}

#[derive(Serialize)]
struct PredictRequest {
    data: Vec<Value>,
}

/// Gradio-style HTTP prediction endpoint: `POST {endpoint}` with
/// `{"data": ["data:<mime>;base64,..."]}`, answering `{"data": [...]}`.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpOracle {
    pub fn new(endpoint: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint, token })
    }
}

pub fn data_uri(bytes: &[u8]) -> String {
    let mime = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::Gif) => "image/gif",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Bmp) => "image/bmp",
        _ => "image/png",
    };
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn predict(&self, image: &Path) -> Result<Value> {
        let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
        let body = PredictRequest { data: vec![Value::String(data_uri(&bytes))] };
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("oracle http {}: {}", status.as_u16(), text));
        }
        let mut payload: Value = resp.json().await?;
        payload
            .get_mut("data")
            .map(Value::take)
            .ok_or_else(|| anyhow!("oracle response missing data"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_detects_png() {
        let png = crate::phash::tests::noise_png(3, 0);
        assert!(data_uri(&png).starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_null_oracle_fails() {
        assert!(NullOracle.predict(Path::new("x.png")).await.is_err());
    }
}
