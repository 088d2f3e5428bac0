//! Download of inbound media attachments.

use crate::config::MessagingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::status_error;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::{debug, warn};

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> PipelineResult<Vec<u8>>;
}

/// `(scheme, host, port)` of a URL, compared to decide where credentials go.
fn origin(url: &Url) -> Option<(String, String, u16)> {
    Some((
        url.scheme().to_string(),
        url.host_str()?.to_ascii_lowercase(),
        url.port_or_known_default()?,
    ))
}

/// Fetches media from the gateway with its account credentials.
///
/// Credentials are only attached when the media URL has the same origin as
/// the gateway API. Downloads larger than `max_bytes` are refused, both by
/// declared length and while streaming.
///
/// The gateway sometimes announces media before it is downloadable and
/// answers 404 for a moment; that is reported as `Transport` so the
/// download stage's retry policy waits and tries again.
pub struct GatewayMediaFetcher {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    trusted_origin: Option<(String, String, u16)>,
    max_bytes: usize,
}

impl GatewayMediaFetcher {
    pub fn new(client: reqwest::Client, config: &MessagingConfig) -> Self {
        Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            trusted_origin: Url::parse(&config.api_base).ok().as_ref().and_then(origin),
            max_bytes: config.max_media_bytes,
        }
    }

    fn too_large(&self, size: u64) -> PipelineError {
        PipelineError::Rejected(format!(
            "media is {} bytes, limit is {}",
            size, self.max_bytes
        ))
    }
}

#[async_trait]
impl MediaFetcher for GatewayMediaFetcher {
    async fn fetch(&self, url: &str) -> PipelineResult<Vec<u8>> {
        let parsed = Url::parse(url).map_err(|e| PipelineError::Rejected(format!("invalid media URL: {}", e)))?;

        let mut request = self.client.get(parsed.clone());
        if self.trusted_origin.is_some() && origin(&parsed) == self.trusted_origin {
            request = request.basic_auth(&self.account_sid, Some(&self.auth_token));
        } else {
            debug!(host = parsed.host_str().unwrap_or(""), "Media host is not the gateway, fetching without credentials");
        }
        let mut response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!("Media not available yet (404)");
            return Err(PipelineError::Transport("media not ready (404)".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("media", status, &body));
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes as u64 {
                return Err(self.too_large(declared));
            }
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large((bytes.len() + chunk.len()) as u64));
            }
            bytes.extend_from_slice(&chunk);
        }

        if bytes.is_empty() {
            return Err(PipelineError::Backend("media download returned no bytes".to_string()));
        }
        debug!(bytes = bytes.len(), "Downloaded media");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::http::test_server::serve;
    use actix_web::{web, HttpRequest, HttpResponse};
    use futures_util::stream;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<Option<String>>>>;

    /// Server answering `/media` with `body` and recording each Authorization header.
    fn recording_server(body: Vec<u8>) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let recorded = seen.clone();
        let base = serve(move |cfg: &mut web::ServiceConfig| {
            let recorded = recorded.clone();
            let body = body.clone();
            cfg.route(
                "/media",
                web::get().to(move |req: HttpRequest| {
                    let recorded = recorded.clone();
                    let body = body.clone();
                    async move {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        recorded.lock().unwrap().push(auth);
                        HttpResponse::Ok().content_type("audio/ogg").body(body)
                    }
                }),
            );
        });
        (base, seen)
    }

    fn fetcher(api_base: &str, max_media_bytes: usize) -> GatewayMediaFetcher {
        let mut config = AppConfig::default().messaging;
        config.api_base = format!("{}/2010-04-01", api_base);
        config.account_sid = "AC123".to_string();
        config.auth_token = "secret".to_string();
        config.max_media_bytes = max_media_bytes;
        GatewayMediaFetcher::new(reqwest::Client::new(), &config)
    }

    #[actix_web::test]
    async fn test_credentials_only_sent_to_gateway_origin() {
        let (gateway, gateway_seen) = recording_server(b"voice".to_vec());
        let (foreign, foreign_seen) = recording_server(b"voice".to_vec());
        let fetcher = fetcher(&gateway, 1024);

        assert_eq!(fetcher.fetch(&format!("{}/media", gateway)).await.unwrap(), b"voice");
        assert_eq!(fetcher.fetch(&format!("{}/media", foreign)).await.unwrap(), b"voice");

        let gateway_auth = gateway_seen.lock().unwrap().clone();
        assert_eq!(gateway_auth.len(), 1);
        assert!(gateway_auth[0].as_deref().is_some_and(|v| v.starts_with("Basic ")));
        assert_eq!(*foreign_seen.lock().unwrap(), vec![None]);
    }

    #[actix_web::test]
    async fn test_declared_length_over_cap_is_rejected() {
        let (base, _) = recording_server(vec![0u8; 2048]);
        let result = fetcher(&base, 1024).fetch(&format!("{}/media", base)).await;
        assert!(matches!(result, Err(PipelineError::Rejected(_))));
    }

    #[actix_web::test]
    async fn test_streamed_body_over_cap_is_rejected() {
        let base = serve(|cfg: &mut web::ServiceConfig| {
            cfg.route(
                "/media",
                web::get().to(|| async {
                    let chunks = (0..4).map(|_| Ok::<_, std::io::Error>(web::Bytes::from(vec![0u8; 600])));
                    HttpResponse::Ok().streaming(stream::iter(chunks))
                }),
            );
        });
        let result = fetcher(&base, 1024).fetch(&format!("{}/media", base)).await;
        assert!(matches!(result, Err(PipelineError::Rejected(_))));

        let within = fetcher(&base, 4096).fetch(&format!("{}/media", base)).await.unwrap();
        assert_eq!(within.len(), 2400);
    }

    #[actix_web::test]
    async fn test_missing_media_is_transport_error() {
        let base = serve(|cfg: &mut web::ServiceConfig| {
            cfg.route("/media", web::get().to(|| async { HttpResponse::NotFound().finish() }));
        });
        let result = fetcher(&base, 1024).fetch(&format!("{}/media", base)).await;
        assert!(matches!(result, Err(PipelineError::Transport(_))));
    }

    #[actix_web::test]
    async fn test_invalid_url_is_rejected() {
        let result = fetcher("http://127.0.0.1:9", 1024).fetch("not a url").await;
        assert!(matches!(result, Err(PipelineError::Rejected(_))));
    }
}
