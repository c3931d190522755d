//! Dereferencing remote ids
//!
//! GETs with the protocol `Accept` header. One redirect hop is followed;
//! any other non-2xx response is "not found". Non-http(s) URLs and
//! private or loopback hosts are refused unless explicitly allowed.

use reqwest::redirect;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;

use super::envelope::{ACTIVITY_JSON, LD_JSON_PROFILE};
use super::types::{self, Actor, ApEntity, Object};
use crate::error::AppError;

const USER_AGENT: &str = concat!("topicfed/", env!("CARGO_PKG_VERSION"));

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

/// Hosts that never leave the machine or the local network.
pub fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation("No DNS records for host".to_string()));
    }

    Ok(())
}

/// HTTP client for dereferencing and delivery.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    allow_private_hosts: bool,
}

impl Fetcher {
    pub fn new(timeout: Duration, allow_private_hosts: bool) -> Result<Self, AppError> {
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > 1 {
                return attempt.stop();
            }
            let blocked = attempt
                .url()
                .host_str()
                .is_some_and(|host| !allow_private_hosts && is_disallowed_host(host));
            if blocked { attempt.stop() } else { attempt.follow() }
        });

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(policy)
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            client,
            allow_private_hosts,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn allows_private_hosts(&self) -> bool {
        self.allow_private_hosts
    }

    /// Parse `url` and refuse schemes and hosts that must not be contacted.
    pub async fn check_url(&self, url: &str) -> Result<url::Url, AppError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::Validation(format!(
                    "Unsupported URL scheme: {}",
                    scheme
                )));
            }
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::Validation(format!("Missing host in URL {}", url)))?
            .to_string();

        if self.allow_private_hosts {
            return Ok(parsed);
        }

        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden);
        }

        // Names that look public may still resolve internally.
        if host.parse::<IpAddr>().is_err() {
            let port = parsed
                .port_or_known_default()
                .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
            validate_resolved_host_ips(&host, port).await?;
        }

        Ok(parsed)
    }

    /// GET a document. `Ok(None)` means the remote answered but not with 2xx.
    pub async fn fetch_document(&self, url: &str) -> Result<Option<Value>, AppError> {
        let url = self.check_url(url).await?;

        let response = self
            .client
            .get(url.clone())
            .header(
                reqwest::header::ACCEPT,
                format!("{}, {}", ACTIVITY_JSON, LD_JSON_PROFILE),
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "Remote document not found");
            return Ok(None);
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Invalid JSON from {}: {}", url, e)))?;

        if !document.is_object() {
            return Err(AppError::Federation(format!(
                "Document at {} is not an object",
                url
            )));
        }

        Ok(Some(document))
    }

    /// GET a document and build its typed value.
    pub async fn fetch_entity(&self, url: &str) -> Result<Option<ApEntity>, AppError> {
        match self.fetch_document(url).await? {
            Some(document) => Ok(Some(types::build_entity(&document)?)),
            None => Ok(None),
        }
    }

    pub async fn fetch_actor(&self, url: &str) -> Result<Option<Actor>, AppError> {
        match self.fetch_entity(url).await? {
            Some(ApEntity::Actor(actor)) => Ok(Some(actor)),
            Some(other) => Err(AppError::Federation(format!(
                "{} is a {}, not an actor",
                url,
                other.type_name()
            ))),
            None => Ok(None),
        }
    }

    pub async fn fetch_object(&self, url: &str) -> Result<Option<Object>, AppError> {
        match self.fetch_entity(url).await? {
            Some(ApEntity::Object(object)) => Ok(Some(object)),
            Some(other) => Err(AppError::Federation(format!(
                "{} is a {}, not an object",
                url,
                other.type_name()
            ))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, response::Redirect, routing::get};
    use serde_json::json;

    async fn spawn_remote() -> String {
        let app = Router::new()
            .route(
                "/notes/1",
                get(|| async {
                    Json(json!({
                        "@context": "https://www.w3.org/ns/activitystreams",
                        "id": "http://remote/notes/1",
                        "type": "Note",
                        "content": "hello"
                    }))
                }),
            )
            .route("/moved", get(|| async { Redirect::permanent("/notes/1") }))
            .route("/twice", get(|| async { Redirect::permanent("/moved") }))
            .route("/gone", get(|| async { StatusCode::GONE }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn disallowed_hosts() {
        assert!(is_disallowed_host("localhost"));
        assert!(is_disallowed_host("127.0.0.1"));
        assert!(is_disallowed_host("192.168.1.10"));
        assert!(is_disallowed_host("[::1]"));
        assert!(!is_disallowed_host("example.com"));
        assert!(!is_disallowed_host("93.184.216.34"));
    }

    #[tokio::test]
    async fn refuses_private_hosts_by_default() {
        let fetcher = Fetcher::new(Duration::from_secs(5), false).unwrap();
        assert!(matches!(
            fetcher.check_url("http://127.0.0.1/notes/1").await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            fetcher.check_url("ftp://example.com/notes/1").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn fetches_object_and_follows_one_redirect() {
        let base = spawn_remote().await;
        let fetcher = Fetcher::new(Duration::from_secs(5), true).unwrap();

        let object = fetcher
            .fetch_object(&format!("{}/notes/1", base))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(object.content.as_deref(), Some("hello"));

        let redirected = fetcher.fetch_document(&format!("{}/moved", base)).await.unwrap();
        assert!(redirected.is_some());

        // A second hop stops at the 3xx, which is not a success.
        let twice = fetcher.fetch_document(&format!("{}/twice", base)).await.unwrap();
        assert!(twice.is_none());
    }

    #[tokio::test]
    async fn non_success_is_not_found() {
        let base = spawn_remote().await;
        let fetcher = Fetcher::new(Duration::from_secs(5), true).unwrap();
        assert!(
            fetcher
                .fetch_document(&format!("{}/gone", base))
                .await
                .unwrap()
                .is_none()
        );
    }
}
