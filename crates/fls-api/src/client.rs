//! Authenticated JSON client for the target API.
//!
//! One bearer token is cached per client; a 401 triggers exactly one forced
//! re-login and retry. Every response is normalized into [`ApiResponse`] so
//! callers never deal with reqwest errors for HTTP-level failures, only for
//! transport ones.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::login;

/// Connection parameters for one client profile.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub login_url: String,
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub timeout_seconds: f64,
}

/// Normalized HTTP result: status plus the body both raw and parsed (when
/// it is JSON at all).
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub json: Option<Value>,
    pub text: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    creds: ApiCredentials,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(creds: ApiCredentials) -> Result<Self> {
        let timeout = Duration::from_secs_f64(creds.timeout_seconds.max(1.0));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        let base_url = resolve_base_url(&creds)?;

        Ok(ApiClient {
            http,
            creds,
            base_url,
            token: Mutex::new(None),
        })
    }

    /// Cached token, or a fresh login when absent/forced. Serialized behind
    /// the mutex so concurrent 401 handling rotates the token once.
    async fn authenticate(&self, force: bool) -> Result<String> {
        let mut guard = self.token.lock().await;
        if !force {
            if let Some(token) = guard.as_ref() {
                return Ok(token.clone());
            }
        }
        let token = login::login(
            &self.http,
            &self.creds.login_url,
            &self.creds.base_url,
            &self.creds.user,
            &self.creds.password,
        )
        .await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// POSTs a JSON payload to `endpoint_path` under the resolved base URL.
    /// Retries once on 401 after re-authenticating.
    pub async fn post_json(&self, endpoint_path: &str, payload: &Value) -> Result<ApiResponse> {
        let url = self.endpoint_url(endpoint_path)?;

        let token = self.authenticate(false).await?;
        let response = self.request(&url, payload, &token).await?;
        if response.status != 401 {
            return Ok(response);
        }

        let token = self.authenticate(true).await?;
        self.request(&url, payload, &token).await
    }

    async fn request(&self, url: &str, payload: &Value, token: &str) -> Result<ApiResponse> {
        let response = self
            .http
            .post(url)
            .header("accept", "application/json")
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default().trim().to_string();
        let json = serde_json::from_str::<Value>(&text).ok();

        Ok(ApiResponse { status, json, text })
    }

    fn endpoint_url(&self, endpoint_path: &str) -> Result<String> {
        let endpoint = endpoint_path.trim();
        if endpoint.is_empty() {
            bail!("endpoint da API nao informado");
        }
        let path = endpoint.trim_start_matches('/');
        Ok(format!("{}{}", self.base_url, path))
    }
}

/// Base URL: configured directly, or derived from the login URL with its
/// `/login` suffix stripped. Always ends with a slash.
fn resolve_base_url(creds: &ApiCredentials) -> Result<String> {
    let base = creds.base_url.trim();
    if !base.is_empty() {
        return Ok(format!("{}/", base.trim_end_matches('/')));
    }

    let login_url = creds.login_url.trim();
    if login_url.is_empty() {
        bail!("API_BASE_URL ou API_LOGIN_URL precisa estar configurada");
    }

    let parsed = reqwest::Url::parse(login_url)
        .with_context(|| format!("API_LOGIN_URL invalida: {login_url:?}"))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("API_LOGIN_URL invalida: {login_url:?}"))?;

    let mut path = parsed.path().trim_end_matches('/').to_string();
    if path.to_lowercase().ends_with("/login") {
        path.truncate(path.len() - "/login".len());
    }

    let port = match parsed.port() {
        Some(p) => format!(":{p}"),
        None => String::new(),
    };
    Ok(format!("{}://{host}{port}{path}/", parsed.scheme()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(login_url: &str, base_url: &str) -> ApiCredentials {
        ApiCredentials {
            login_url: login_url.to_string(),
            base_url: base_url.to_string(),
            user: "u".into(),
            password: "p".into(),
            timeout_seconds: 30.0,
        }
    }

    #[test]
    fn base_url_wins_when_configured() {
        let b = resolve_base_url(&creds("http://x/login", "http://api.example/v2")).unwrap();
        assert_eq!(b, "http://api.example/v2/");
    }

    #[test]
    fn base_url_derives_from_login_url() {
        let b = resolve_base_url(&creds("http://api.example:8087/v1/login", "")).unwrap();
        assert_eq!(b, "http://api.example:8087/v1/");

        let b = resolve_base_url(&creds("https://api.example/login", "")).unwrap();
        assert_eq!(b, "https://api.example/");
    }

    #[test]
    fn missing_urls_are_a_configuration_error() {
        assert!(resolve_base_url(&creds("", "")).is_err());
        assert!(resolve_base_url(&creds("nao-e-url", "")).is_err());
    }

    #[test]
    fn endpoint_joins_under_base() {
        let client = ApiClient::new(creds("", "http://api.example")).unwrap();
        assert_eq!(
            client.endpoint_url("/v1/motorista").unwrap(),
            "http://api.example/v1/motorista"
        );
        assert_eq!(
            client.endpoint_url("v1/afastamento").unwrap(),
            "http://api.example/v1/afastamento"
        );
        assert!(client.endpoint_url("  ").is_err());
    }
}
