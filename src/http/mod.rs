mod error;

pub use error::{HttpError, Result};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use reqwest::{Body, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Thin JSON/stream client bound to the storage service: a base URL plus
/// the `user-session` cookie on every request.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, session_token: &str) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(HttpError::BaseUrl(base_url.to_string()));
        }

        let cookie = format!("user-session={session_token}");
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&cookie)
                .map_err(|_| HttpError::BaseUrl("session token is not header-safe".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET expecting a JSON body. The body is only decoded on 2xx; the
    /// caller sees the status either way (404 probes are not errors at
    /// this layer).
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<(StatusCode, Option<T>)> {
        let resp = self.http.get(self.url(path)).query(query).send().await?;
        let status = resp.status();
        if status.is_success() {
            let body = resp.json::<T>().await?;
            Ok((status, Some(body)))
        } else {
            Ok((status, None))
        }
    }

    /// POST a JSON body, ignoring any response payload.
    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<StatusCode> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        Ok(resp.status())
    }

    /// POST a raw octet stream with an exact `Content-Length`, decoding a
    /// JSON response on 2xx.
    pub async fn post_stream<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Body,
        content_length: u64,
    ) -> Result<(StatusCode, Option<T>)> {
        let resp = self
            .http
            .post(self.url(path))
            .query(query)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, content_length)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            let body = resp.json::<T>().await?;
            Ok((status, Some(body)))
        } else {
            Ok((status, None))
        }
    }

    pub async fn delete(&self, path: &str) -> Result<StatusCode> {
        let resp = self.http.delete(self.url(path)).send().await?;
        Ok(resp.status())
    }
}
