//! WebFinger protocol implementation
//!
//! Used to discover actor ids from `user@domain` addresses, and to answer
//! the same question for local actors.

use serde::{Deserialize, Serialize};

use super::envelope::{ACTIVITY_JSON, is_protocol_media_type};
use super::fetch::{Fetcher, is_disallowed_host};
use crate::error::AppError;

pub const JRD_JSON: &str = "application/jrd+json";

/// WebFinger result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebFingerResult {
    /// Subject (acct:user@domain)
    pub subject: String,
    /// Actor id from the `self` link
    pub actor_uri: String,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// `href` of the `rel=self` link with a protocol media type.
    pub fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .filter(|link| link.rel == "self")
            .find(|link| {
                link.link_type
                    .as_deref()
                    .is_none_or(is_protocol_media_type)
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Split `user@domain`, `@user@domain` or `acct:user@domain`.
pub fn parse_address(address: &str) -> Result<(&str, &str), AppError> {
    let trimmed = address.trim();
    let trimmed = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('@').unwrap_or(trimmed);

    match trimmed.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok((user, domain))
        }
        _ => Err(AppError::Validation(format!(
            "Invalid account address: {}",
            address
        ))),
    }
}

/// Resolve an address to its actor id.
///
/// Plain http is only used for private hosts, and only when the fetcher
/// allows them.
pub async fn resolve_webfinger(fetcher: &Fetcher, address: &str) -> Result<WebFingerResult, AppError> {
    let (user, domain) = parse_address(address)?;

    let host = url::Url::parse(&format!("https://{}", domain))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| AppError::Validation(format!("Invalid domain: {}", domain)))?;
    let scheme = if fetcher.allows_private_hosts() && is_disallowed_host(&host) {
        "http"
    } else {
        "https"
    };

    let mut url = url::Url::parse(&format!("{}://{}/.well-known/webfinger", scheme, domain))
        .map_err(|e| AppError::Validation(format!("Invalid domain {}: {}", domain, e)))?;
    url.query_pairs_mut()
        .append_pair("resource", &format!("acct:{}@{}", user, domain));
    let url = fetcher.check_url(url.as_str()).await?;

    let response = fetcher
        .client()
        .get(url)
        .header(reqwest::header::ACCEPT, format!("{}, {}", JRD_JSON, ACTIVITY_JSON))
        .send()
        .await?;
    if !response.status().is_success() {
        tracing::debug!(address = %address, status = %response.status(), "WebFinger lookup failed");
        return Err(AppError::NotFound);
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {}", e)))?;
    let actor_uri = jrd
        .self_link()
        .ok_or_else(|| AppError::Federation(format!("{} has no self link", address)))?
        .to_string();

    Ok(WebFingerResult {
        subject: jrd.subject,
        actor_uri,
    })
}

/// Generate the WebFinger response for a local actor.
pub fn generate_webfinger_response(username: &str, domain: &str, actor_url: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::StatusCode, routing::get};
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_generate_webfinger_response() {
        let response = generate_webfinger_response(
            "general",
            "forum.example",
            "https://forum.example/ap/group/abc",
        );

        assert_eq!(response.subject, "acct:general@forum.example");
        assert_eq!(response.links.len(), 1);
        assert_eq!(response.self_link(), Some("https://forum.example/ap/group/abc"));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("alice@remote.example").unwrap(), ("alice", "remote.example"));
        assert_eq!(parse_address("@alice@remote.example").unwrap(), ("alice", "remote.example"));
        assert_eq!(parse_address("acct:alice@remote.example").unwrap(), ("alice", "remote.example"));
        assert!(parse_address("alice").is_err());
        assert!(parse_address("@remote.example").is_err());
    }

    #[test]
    fn self_link_skips_html_profiles() {
        let jrd: WebFingerResponse = serde_json::from_value(serde_json::json!({
            "subject": "acct:alice@remote.example",
            "links": [
                { "rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://remote.example/@alice" },
                { "rel": "self", "type": "text/html", "href": "https://remote.example/@alice" },
                { "rel": "self", "type": "application/activity+json", "href": "https://remote.example/users/alice" }
            ]
        }))
        .unwrap();
        assert_eq!(jrd.self_link(), Some("https://remote.example/users/alice"));
    }

    #[tokio::test]
    async fn resolves_against_a_remote_server() {
        let app = Router::new().route(
            "/.well-known/webfinger",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let resource = params.get("resource").cloned().unwrap_or_default();
                if !resource.starts_with("acct:alice@") {
                    return Err(StatusCode::NOT_FOUND);
                }
                Ok(Json(generate_webfinger_response(
                    "alice",
                    "remote",
                    "http://remote/users/alice",
                )))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fetcher = Fetcher::new(Duration::from_secs(5), true).unwrap();
        let result = resolve_webfinger(&fetcher, &format!("alice@{}", addr))
            .await
            .unwrap();
        assert_eq!(result.actor_uri, "http://remote/users/alice");

        let missing = resolve_webfinger(&fetcher, &format!("bob@{}", addr)).await;
        assert!(matches!(missing, Err(AppError::NotFound)));

        let strict = Fetcher::new(Duration::from_secs(5), false).unwrap();
        assert!(resolve_webfinger(&strict, &format!("alice@{}", addr)).await.is_err());
    }
}
