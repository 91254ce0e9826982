//! Pushing snapshots to the server

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use laudo_core::LocalSnapshot;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::SyncError;

/// Body of `PUT /api/avaliacoes/:id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPayload {
    pub dados: Value,
    pub areas: Value,
    pub comparativos: Value,
}

impl From<&LocalSnapshot> for SyncPayload {
    /// List fields that are not arrays are sent as empty lists
    fn from(snapshot: &LocalSnapshot) -> Self {
        let list = |value: &Value| match value {
            Value::Array(_) => value.clone(),
            _ => Value::Array(Vec::new()),
        };
        Self {
            dados: snapshot.dados.clone(),
            areas: list(&snapshot.areas),
            comparativos: list(&snapshot.comparativos),
        }
    }
}

/// Where snapshots are pushed
#[async_trait]
pub trait Remote: Send + Sync {
    async fn put_report(&self, report_id: i64, payload: &SyncPayload) -> Result<(), SyncError>;
}

#[async_trait]
impl<T: Remote + ?Sized> Remote for Arc<T> {
    async fn put_report(&self, report_id: i64, payload: &SyncPayload) -> Result<(), SyncError> {
        (**self).put_report(report_id, payload).await
    }
}

/// [`Remote`] backed by the laudo API over HTTP
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn report_url(&self, report_id: i64) -> String {
        format!("{}/api/avaliacoes/{}", self.base_url, report_id)
    }
}

#[async_trait]
impl Remote for HttpRemote {
    async fn put_report(&self, report_id: i64, payload: &SyncPayload) -> Result<(), SyncError> {
        let url = self.report_url(report_id);
        debug!("PUT {}", url);
        let response = self.client.put(&url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Rejected {
                report_id,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
