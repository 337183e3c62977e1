use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Snapshot of one provider entity: textual state plus free-form
/// attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub last_updated: Option<DateTime<FixedOffset>>,
}

/// One historical sample of an entity's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub state: String,
    pub last_updated: DateTime<FixedOffset>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Other(String),
}

/// Home-automation data provider consumed by the resolver.
#[async_trait]
pub trait StateProvider: Send + Sync {
    async fn fetch_states(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityState>, ProviderError>;

    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<HistoryPoint>, ProviderError>;
}

/// REST client for a Home Assistant style API.
#[derive(Debug, Clone)]
pub struct RestProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestProvider {
    pub fn new(base_url: &str, token: &str, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        if response.status().is_server_error() {
            return Err(ProviderError::Transient(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(ProviderError::Other(format!("{} returned {}", url, response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))
    }
}

#[async_trait]
impl StateProvider for RestProvider {
    async fn fetch_states(
        &self,
        entity_ids: &[String],
    ) -> Result<HashMap<String, EntityState>, ProviderError> {
        let mut states = HashMap::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            let value = self.get_json(&format!("/api/states/{entity_id}")).await;
            let value = match value {
                Ok(value) => value,
                Err(ProviderError::NotFound(_)) => {
                    return Err(ProviderError::NotFound(entity_id.clone()))
                }
                Err(err) => return Err(err),
            };
            let state: EntityState = serde_json::from_value(value)
                .map_err(|err| ProviderError::Other(format!("{entity_id}: {err}")))?;
            states.insert(entity_id.clone(), state);
        }
        Ok(states)
    }

    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<Vec<HistoryPoint>, ProviderError> {
        let path = format!(
            "/api/history/period/{}?filter_entity_id={}&end_time={}&no_attributes",
            start.to_rfc3339(),
            entity_id,
            end.to_rfc3339(),
        );
        let value = self.get_json(&path).await?;
        // The endpoint answers with one list per requested entity.
        let rows: Vec<Vec<HistoryPoint>> = serde_json::from_value(value)
            .map_err(|err| ProviderError::Other(format!("{entity_id}: {err}")))?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }
}
