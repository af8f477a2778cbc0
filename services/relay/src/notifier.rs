//! Best-effort push notifications to the backend.

use crate::config::NotifyConfig;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Notification errors. Never surfaced past the notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Summary of a stored sensor packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDigest {
    pub temperature: Option<f64>,
    pub light: Option<i64>,
    pub image_path: Option<String>,
    pub timestamp_ms: Option<i64>,
}

/// Summary of a stored model output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDigest {
    pub name: String,
    pub output: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Digest {
    Sensor(SensorDigest),
    Model(ModelDigest),
}

/// Fire-and-forget notification channel.
pub trait Notify: Send + Sync {
    /// Queue a digest for delivery. Returns immediately.
    fn notify(&self, digest: Digest);
}

/// Posts digests as JSON to the configured endpoints.
pub struct HttpNotifier {
    client: reqwest::Client,
    sensor_url: String,
    model_url: String,
}

impl HttpNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            sensor_url: config.sensor_url.clone(),
            model_url: config.model_url.clone(),
        })
    }

    async fn post<T: Serialize>(
        client: &reqwest::Client,
        url: &str,
        body: &T,
    ) -> Result<(), NotifyError> {
        client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Notify for HttpNotifier {
    fn notify(&self, digest: Digest) {
        let client = self.client.clone();
        let url = match &digest {
            Digest::Sensor(_) => self.sensor_url.clone(),
            Digest::Model(_) => self.model_url.clone(),
        };

        tokio::spawn(async move {
            let result = match &digest {
                Digest::Sensor(body) => Self::post(&client, &url, body).await,
                Digest::Model(body) => Self::post(&client, &url, body).await,
            };

            if let Err(e) = result {
                debug!(url = %url, error = %e, "Notification dropped");
                metrics::counter!("relay.notify.failures").increment(1);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Notifier that keeps every digest in memory.
    #[derive(Default)]
    pub struct RecordingNotifier {
        digests: Mutex<Vec<Digest>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn digests(&self) -> Vec<Digest> {
            self.digests.lock().clone()
        }
    }

    impl Notify for RecordingNotifier {
        fn notify(&self, digest: Digest) {
            self.digests.lock().push(digest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Received = mpsc::UnboundedSender<(&'static str, Value)>;

    async fn backend() -> (String, mpsc::UnboundedReceiver<(&'static str, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();

        async fn sensor(State(tx): State<Received>, Json(body): Json<Value>) -> StatusCode {
            let _ = tx.send(("sensor", body));
            StatusCode::OK
        }

        async fn model(State(tx): State<Received>, Json(body): Json<Value>) -> StatusCode {
            let _ = tx.send(("model", body));
            StatusCode::OK
        }

        let router = Router::new()
            .route("/api/relay_notify", post(sensor))
            .route("/api/model_output", post(model))
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{addr}"), rx)
    }

    fn notifier_for(base: &str) -> HttpNotifier {
        HttpNotifier::new(&NotifyConfig {
            sensor_url: format!("{base}/api/relay_notify"),
            model_url: format!("{base}/api/model_output"),
            timeout_secs: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_digests_routed_to_endpoints() {
        let (base, mut rx) = backend().await;
        let notifier = notifier_for(&base);

        notifier.notify(Digest::Sensor(SensorDigest {
            temperature: Some(21.5),
            light: None,
            image_path: Some("/static/images/relay_1.png".to_string()),
            timestamp_ms: Some(1_700_000_000_000),
        }));
        let (endpoint, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint, "sensor");
        assert_eq!(
            body,
            json!({
                "temperature": 21.5,
                "light": null,
                "image_path": "/static/images/relay_1.png",
                "timestamp_ms": 1_700_000_000_000i64
            })
        );

        notifier.notify(Digest::Model(ModelDigest {
            name: "m1".to_string(),
            output: json!({"x": 1}),
        }));
        let (endpoint, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(endpoint, "model");
        assert_eq!(body, json!({"name": "m1", "output": {"x": 1}}));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let router = Router::new().route(
            "/api/relay_notify",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = reqwest::Client::new();
        let result = HttpNotifier::post(
            &client,
            &format!("http://{addr}/api/relay_notify"),
            &json!({}),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_ignored() {
        let notifier = notifier_for("http://127.0.0.1:1");
        notifier.notify(Digest::Model(ModelDigest {
            name: "m1".to_string(),
            output: Value::Null,
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
