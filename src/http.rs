use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{GenError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

fn normalize(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

/// One persistent session against one base URL.
///
/// Holds the cookie jar shared by every request, so a form login sticks for
/// the lifetime of the client. Auth handling: on HTTP 401 the stored
/// credentials (if any) are replayed through `/login` once and the request is
/// retried exactly once; without credentials the 401 surfaces as
/// [`GenError::Auth`]. Transport-level failures are never retried here —
/// backoff belongs to the poll loops that own the request cadence.
#[derive(Clone)]
pub struct WebClient {
    http: Client,
    base_url: String,
    credentials: Arc<Mutex<Option<(String, String)>>>,
    retry_auth: bool,
}

impl WebClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http") {
            return Err(GenError::InvalidUrl(base_url));
        }
        let http = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| GenError::Connection {
                context: "failed to build HTTP client".into(),
                source: e,
            })?;
        Ok(Self {
            http,
            base_url: normalize(base_url),
            credentials: Arc::new(Mutex::new(None)),
            retry_auth: true,
        })
    }

    /// Register credentials replayed on a 401.
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        if let Ok(mut creds) = self.credentials.lock() {
            *creds = Some((username.into(), password.into()));
        }
        self
    }

    /// Disable the single 401 re-login retry.
    pub fn without_auth_retry(mut self) -> Self {
        self.retry_auth = false;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn has_credentials(&self) -> bool {
        self.credentials.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Form-post the stored credentials to `/login`. The resulting session
    /// cookie lives in the shared jar.
    pub async fn login(&self) -> Result<()> {
        let creds = self
            .credentials
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| GenError::Auth("no credentials configured".into()))?;

        let mut form = HashMap::new();
        form.insert("username", creds.0);
        form.insert("password", creds.1);

        let resp = self
            .http
            .post(self.url("login"))
            .form(&form)
            .timeout(DEFAULT_TIMEOUT)
            .send()
            .await
            .map_err(|e| GenError::Connection {
                context: format!("cannot reach {} for login", self.base_url),
                source: e,
            })?;

        if !resp.status().is_success() {
            return Err(GenError::Auth(format!(
                "login rejected with HTTP {}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }

    /// Run a request, applying the 401 re-login policy and (optionally) the
    /// non-2xx status check. The builder closure is invoked again for the
    /// retry because request bodies are not reusable.
    async fn execute<F>(&self, make: F, check_status: bool) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let context = format!("cannot connect to {}", self.base_url);
        let mut resp = make(&self.http)
            .send()
            .await
            .map_err(|e| GenError::Connection {
                context: context.clone(),
                source: e,
            })?;

        if resp.status().as_u16() == 401 {
            if self.retry_auth && self.has_credentials() {
                debug!("got 401 from {}, re-authenticating once", self.base_url);
                self.login().await?;
                resp = make(&self.http)
                    .send()
                    .await
                    .map_err(|e| GenError::Connection {
                        context,
                        source: e,
                    })?;
                if resp.status().as_u16() == 401 {
                    return Err(GenError::Auth("still unauthorized after re-login".into()));
                }
            } else {
                return Err(GenError::Auth(format!(
                    "{} requires authentication",
                    self.base_url
                )));
            }
        }

        if check_status && !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenError::Request { status, body });
        }
        Ok(resp)
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)], timeout: Duration) -> Result<Response> {
        let url = self.url(path);
        self.execute(
            move |http| http.get(&url).query(query).timeout(timeout),
            true,
        )
        .await
    }

    /// Like [`get`](Self::get) but returns non-2xx responses for manual
    /// inspection instead of raising `Request`.
    pub async fn get_unchecked(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Response> {
        let url = self.url(path);
        self.execute(
            move |http| http.get(&url).query(query).timeout(timeout),
            false,
        )
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T> {
        let resp = self.get(path, query, timeout).await?;
        resp.json().await.map_err(|e| GenError::Connection {
            context: format!("failed to parse response from {}", path),
            source: e,
        })
    }

    pub async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> Result<Response> {
        let url = self.url(path);
        self.execute(
            move |http| http.post(&url).json(body).timeout(timeout),
            true,
        )
        .await
    }

    /// POST without the status check (`throw_on_failure=false` escape hatch).
    pub async fn post_json_unchecked(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Response> {
        let url = self.url(path);
        self.execute(
            move |http| http.post(&url).json(body).timeout(timeout),
            false,
        )
        .await
    }

    /// Multipart POST. The form is rebuilt through the closure on an auth
    /// retry because multipart bodies cannot be cloned.
    pub async fn post_multipart<F>(
        &self,
        path: &str,
        make_form: F,
        timeout: Duration,
    ) -> Result<Response>
    where
        F: Fn() -> reqwest::multipart::Form,
    {
        let url = self.url(path);
        self.execute(
            move |http| http.post(&url).multipart(make_form()).timeout(timeout),
            true,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            WebClient::new("ftp://host:21"),
            Err(GenError::InvalidUrl(_))
        ));
        assert!(WebClient::new("http://localhost:8188").is_ok());
        assert!(WebClient::new("https://host/").is_ok());
    }

    #[test]
    fn test_base_url_normalized() {
        let client = WebClient::new("http://localhost:8188///").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8188");
        assert_eq!(client.url("/prompt"), "http://localhost:8188/prompt");
        assert_eq!(client.url("prompt"), "http://localhost:8188/prompt");
    }

    #[test]
    fn test_credentials_registration() {
        let client = WebClient::new("http://localhost:7860").unwrap();
        assert!(!client.has_credentials());
        let client = client.with_credentials("user", "pass");
        assert!(client.has_credentials());
    }
}
