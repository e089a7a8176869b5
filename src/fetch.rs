use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("malformed body from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Outbound GET transport used by the config and appearance loaders.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get_text(&self, url: &Url) -> Result<String, FetchError>;

    async fn get_json(&self, url: &Url) -> Result<Value, FetchError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

/// reqwest-backed fetcher. No retries: a failed fetch falls through to
/// whatever default the caller applies.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("chat-widget-loader/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        resp.text().await.map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned responses keyed by full URL; unknown URLs answer 404.
    #[derive(Default)]
    pub struct StaticFetcher {
        responses: Mutex<HashMap<String, Result<String, u16>>>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, url: &str, body: impl Into<String>) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), Ok(body.into()));
        }

        pub fn fail(&self, url: &str, status: u16) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), Err(status));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, url: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == url).count()
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
            let key = url.to_string();
            self.calls.lock().unwrap().push(key.clone());
            match self.responses.lock().unwrap().get(&key).cloned() {
                Some(Ok(body)) => Ok(body),
                Some(Err(status)) => Err(FetchError::Status { url: key, status }),
                None => Err(FetchError::Status {
                    url: key,
                    status: 404,
                }),
            }
        }
    }
}
