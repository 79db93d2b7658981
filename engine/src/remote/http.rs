use super::{RemoteCallback, RemoteError, RemoteStore, Subscription};
use crate::{EntityKind, Error, Record, RecordKey};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct RemoveAllResponse {
    removed: usize,
}

/// Client for the Tandem document service.
///
/// Routes:
/// - `GET|PUT|DELETE {base}/documents/{kind}/{id}`
/// - `DELETE {base}/documents/{kind}?ownerId=...`
/// - `GET {base}/health`
///
/// Subscriptions poll the document at a fixed interval.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
    poll_interval: Duration,
}

impl HttpRemote {
    /// Build a client for the service at `base_url`.
    ///
    /// Fails with [`Error::Config`] when the HTTP client cannot be set up
    /// (for example when no TLS backend is available).
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// How often subscriptions poll for changes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn document_url(&self, key: &RecordKey) -> String {
        format!("{}/documents/{}/{}", self.base_url, key.kind, key.id)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(RemoteError::Unreachable(format!("{status}: {message}")))
    } else {
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>, RemoteError> {
        let response = self.send(self.client.get(self.document_url(key))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    async fn upsert(&self, record: &Record) -> Result<Record, RemoteError> {
        let url = self.document_url(&record.key());
        let response = self.send(self.client.put(url).json(record)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Rejected {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: "document route not found".into(),
            });
        }
        decode(response).await
    }

    async fn remove(&self, key: &RecordKey) -> Result<(), RemoteError> {
        self.send(self.client.delete(self.document_url(key))).await?;
        Ok(())
    }

    async fn remove_all(&self, kind: EntityKind, owner_id: &str) -> Result<usize, RemoteError> {
        let url = format!("{}/documents/{}", self.base_url, kind);
        let request = self.client.delete(url).query(&[("ownerId", owner_id)]);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let body: RemoveAllResponse = decode(response).await?;
        Ok(body.removed)
    }

    fn subscribe(&self, key: RecordKey, callback: RemoteCallback) -> Subscription {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%key, "no async runtime, subscription inactive");
            return Subscription::new(|| {});
        };

        let remote = self.clone();
        let task = runtime.spawn(async move {
            let mut last_seen: Option<Option<u64>> = None;
            let mut ticker = tokio::time::interval(remote.poll_interval);
            loop {
                ticker.tick().await;
                match remote.fetch(&key).await {
                    Ok(current) => {
                        let stamp = current.as_ref().map(|r| r.updated_at);
                        if last_seen != Some(stamp) {
                            last_seen = Some(stamp);
                            callback(current);
                        }
                    }
                    Err(err) => debug!(%key, error = %err, "subscription poll failed"),
                }
            }
        });

        Subscription::new(move || task.abort())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let url = format!("{}/health", self.base_url);
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Unreachable("health endpoint missing".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_urls() {
        let remote = HttpRemote::new("https://sync.example.com/", None).unwrap();
        let key = RecordKey::new(EntityKind::SrsItem, "card-7");
        assert_eq!(
            remote.document_url(&key),
            "https://sync.example.com/documents/srs_item/card-7"
        );
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments.
        let remote = HttpRemote::new("http://127.0.0.1:9", None).unwrap();
        let err = remote.ping().await.unwrap_err();
        assert!(err.is_transient());
    }
}
