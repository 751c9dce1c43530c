//! Ledger-facing adapters: stake lookup and weight export.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use routing::{CollaboratorError, Identity, Stake, StakeSource, Timestamp, WeightSink, WeightSnapshot};

/// Body served by a stake endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeListing {
    pub stakes: HashMap<String, f64>,
}

impl StakeListing {
    /// Converts to domain types. Any invalid entry rejects the whole listing.
    ///
    /// # Errors
    ///
    /// [`CollaboratorError::Decode`] for empty identities and for negative or
    /// non-finite balances.
    pub fn into_stakes(self) -> Result<HashMap<Identity, Stake>, CollaboratorError> {
        self.stakes
            .into_iter()
            .map(|(identity, amount)| {
                let id = Identity::new(identity)
                    .ok_or_else(|| CollaboratorError::Decode("empty identity in stake listing".into()))?;
                let stake = Stake::new(amount).ok_or_else(|| {
                    CollaboratorError::Decode(format!("invalid stake {amount} for '{id}'"))
                })?;
                Ok((id, stake))
            })
            .collect()
    }
}

/// Fetches a complete stake listing with `GET {url}`.
pub struct HttpStakeSource {
    client: reqwest::Client,
    url: String,
}

impl HttpStakeSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl StakeSource for HttpStakeSource {
    async fn fetch_stakes(&self) -> Result<HashMap<Identity, Stake>, CollaboratorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "GET {} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }
        let listing: StakeListing = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        let stakes = listing.into_stakes()?;
        debug!(url = %self.url, identities = stakes.len(), "Fetched stakes");
        Ok(stakes)
    }
}

/// Body pushed to a weight endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightExport {
    pub computed_at: Option<Timestamp>,
    pub weights: BTreeMap<Identity, f64>,
}

impl From<&WeightSnapshot> for WeightExport {
    fn from(snapshot: &WeightSnapshot) -> Self {
        Self {
            computed_at: snapshot.computed_at,
            weights: snapshot.final_weights(),
        }
    }
}

/// Pushes `{identity -> final_weight}` with `POST {url}`.
pub struct HttpWeightSink {
    client: reqwest::Client,
    url: String,
}

impl HttpWeightSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl WeightSink for HttpWeightSink {
    async fn submit(&self, snapshot: &WeightSnapshot) -> Result<(), CollaboratorError> {
        let body = WeightExport::from(snapshot);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollaboratorError::Rejected(format!(
                "POST {} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }
        info!(url = %self.url, workers = body.weights.len(), "Exported weights");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn listing_with_a_negative_stake_is_rejected_whole() {
        let listing = StakeListing {
            stakes: HashMap::from([("a".to_owned(), 10.0), ("b".to_owned(), -1.0)]),
        };
        assert!(matches!(
            listing.into_stakes(),
            Err(CollaboratorError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fetches_stakes_over_http() {
        let app = Router::new().route(
            "/stakes",
            get(|| async { Json(json!({"stakes": {"alice": 100.0, "bob": 400.0}})) }),
        );
        let base = serve(app).await;
        let source = HttpStakeSource::new(reqwest::Client::new(), format!("{base}/stakes"));

        let stakes = source.fetch_stakes().await.unwrap();
        assert_eq!(stakes.len(), 2);
        assert_eq!(stakes[&Identity::new("bob").unwrap()].as_f64(), 400.0);

        let missing = HttpStakeSource::new(reqwest::Client::new(), format!("{base}/nope"));
        assert!(matches!(
            missing.fetch_stakes().await,
            Err(CollaboratorError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn exports_final_weights() {
        let received: Arc<Mutex<Option<Value>>> = Arc::default();
        let sink_state = received.clone();
        let app = Router::new().route(
            "/weights",
            post(move |Json(body): Json<Value>| {
                let sink_state = sink_state.clone();
                async move {
                    *sink_state.lock().unwrap() = Some(body);
                    Json(json!({"ok": true}))
                }
            }),
        );
        let base = serve(app).await;
        let sink = HttpWeightSink::new(reqwest::Client::new(), format!("{base}/weights"));

        let mut snapshot = WeightSnapshot::default();
        snapshot.records.insert(
            Identity::new("w").unwrap(),
            routing::WeightRecord::compute(
                routing::Percentage::new(100.0).unwrap(),
                routing::Percentage::zero(),
                routing::Percentage::zero(),
            ),
        );
        sink.submit(&snapshot).await.unwrap();

        let body = received.lock().unwrap().clone().unwrap();
        assert_eq!(body["weights"]["w"], 40.0);
    }
}
