//! Inbox rate limiting
//!
//! Fixed windows per sender domain. The number of tracked domains is capped;
//! when full, expired windows are dropped first and then the oldest one.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::AppError;

const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    hits: u32,
}

impl Window {
    fn fresh() -> Self {
        Self {
            started: Instant::now(),
            hits: 0,
        }
    }

    fn expired(&self, length: Duration) -> bool {
        self.started.elapsed() >= length
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
    max_tracked_keys: usize,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self::with_max_tracked_keys(max_requests, window, DEFAULT_MAX_TRACKED_KEYS)
    }

    pub fn with_max_tracked_keys(max_requests: u32, window: Duration, max_tracked_keys: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests: max_requests.max(1),
            window,
            max_tracked_keys: max_tracked_keys.max(1),
        }
    }

    /// Count a request for `key`, or fail with [`AppError::RateLimited`].
    pub async fn check_and_increment(&self, key: &str) -> Result<(), AppError> {
        let mut windows = self.windows.lock().await;

        if !windows.contains_key(key) && windows.len() >= self.max_tracked_keys {
            windows.retain(|_, window| !window.expired(self.window));
            if windows.len() >= self.max_tracked_keys {
                let oldest = windows
                    .iter()
                    .min_by_key(|(_, window)| window.started)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    windows.remove(&oldest);
                }
            }
        }

        let window = windows.entry(key.to_string()).or_insert_with(Window::fresh);
        if window.expired(self.window) {
            *window = Window::fresh();
        }
        if window.hits >= self.max_requests {
            tracing::debug!(key = %key, hits = window.hits, "Rate limit exceeded");
            return Err(AppError::RateLimited);
        }
        window.hits += 1;
        Ok(())
    }

    /// Requests counted for `key` in its current window.
    pub async fn hits(&self, key: &str) -> u32 {
        self.windows
            .lock()
            .await
            .get(key)
            .filter(|window| !window.expired(self.window))
            .map(|window| window.hits)
            .unwrap_or(0)
    }

    /// Drop expired windows.
    pub async fn prune(&self) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| !window.expired(self.window));
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned rate limit windows");
        }
        removed
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}

fn domain_key(host: &str, port: Option<u16>, scheme: &str) -> String {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();

    match port.filter(|port| Some(*port) != default_port(scheme)) {
        Some(port) if host.contains(':') => format!("[{}]:{}", host, port),
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Normalized `host[:port]` of an id or URL; default ports are dropped.
pub fn extract_domain(uri: &str) -> String {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(host) = url::Url::parse(trimmed)
        .ok()
        .and_then(|url| url.host_str().map(|host| domain_key(host, url.port(), url.scheme())))
    {
        return host;
    }

    // Bare authority such as `example.com:443`.
    let authority = trimmed
        .split("://")
        .last()
        .unwrap_or(trimmed)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    if authority.is_empty() {
        return String::new();
    }

    url::Url::parse(&format!("https://{}", authority))
        .ok()
        .and_then(|url| url.host_str().map(|host| domain_key(host, url.port(), "https")))
        .unwrap_or_else(|| authority.trim_end_matches('.').to_ascii_lowercase())
}
