use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use url::Url;

pub const DOWNLOAD_TIMEOUT_SECS: u64 = 10;

/// Only http(s) attachment URLs are fetched.
pub fn validate_image_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| anyhow!("invalid image url {}: {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("unsupported url scheme {}", other),
    }
}

/// Downloads an uploaded attachment. Non-image content types are refused
/// before the body is read.
pub async fn download_image(client: &Client, raw_url: &str) -> Result<Vec<u8>> {
    let url = validate_image_url(raw_url)?;
    let resp = client
        .get(url)
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        bail!("download failed with http {}", status.as_u16());
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if !content_type.is_empty() && !content_type.starts_with("image/") {
        bail!("not an image: {}", content_type);
    }
    Ok(resp.bytes().await?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_url() {
        assert!(validate_image_url("https://cdn.example.com/a.png").is_ok());
        assert!(validate_image_url("http://cdn.example.com/a.png").is_ok());
        assert!(validate_image_url("ftp://cdn.example.com/a.png").is_err());
        assert!(validate_image_url("file:///etc/passwd").is_err());
        assert!(validate_image_url("not a url").is_err());
    }
}
