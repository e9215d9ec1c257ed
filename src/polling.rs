use crate::codec::{Payload, PayloadFormat};
use crate::config::{redact, ConnectionConfig};
use crate::error::Error;
use crate::event::{ChannelEvent, EventSink};
use crate::metrics::{Channel, Metrics};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Build the HTTP client used by the polling channel.
///
/// Configured headers become default headers on every request.
pub(crate) fn http_client(config: &ConnectionConfig) -> Result<Client, Error> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        headers.insert(name.clone(), value.clone());
    }
    Ok(Client::builder().default_headers(headers).build()?)
}

/// Handle to a running polling channel. Dropping it stops polling and
/// cancels requests in flight.
pub(crate) struct PollingChannel {
    id: u64,
    metrics: Arc<Metrics>,
    task: JoinHandle<()>,
}

impl PollingChannel {
    /// Start polling. The first request is issued immediately, then one per
    /// `update_interval`.
    pub(crate) fn spawn(
        id: u64,
        config: Arc<ConnectionConfig>,
        client: Client,
        format: PayloadFormat,
        metrics: Arc<Metrics>,
        sink: EventSink,
    ) -> Self {
        info!("[POLL] Polling every {:?}", config.update_interval);
        metrics.set_active(Channel::Polling, true);
        let task = tokio::spawn(run(config, client, format, metrics.clone(), sink));
        Self { id, metrics, task }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn stop(self) {
        debug!("[POLL] Stopping");
    }
}

impl Drop for PollingChannel {
    fn drop(&mut self) {
        self.task.abort();
        self.metrics.set_active(Channel::Polling, false);
    }
}

async fn run(
    config: Arc<ConnectionConfig>,
    client: Client,
    format: PayloadFormat,
    metrics: Arc<Metrics>,
    sink: EventSink,
) {
    let mut ticker = tokio::time::interval(config.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: JoinSet<Result<Option<Payload>, Error>> = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics.record_poll();
                let config = config.clone();
                let client = client.clone();
                let metrics = metrics.clone();
                in_flight.spawn(async move {
                    fetch_once(&config, &client, format, &metrics).await
                });
            }

            Some(joined) = in_flight.join_next() => {
                let event = match joined {
                    Ok(Ok(Some(payload))) => {
                        metrics.record_poll_success();
                        ChannelEvent::Payload(payload)
                    }
                    // body was undecodable and already counted
                    Ok(Ok(None)) => continue,
                    Ok(Err(e)) => {
                        metrics.record_poll_failure();
                        warn!("[POLL] Request failed: {}", e);
                        ChannelEvent::PollFailed(e)
                    }
                    Err(e) => {
                        if e.is_panic() {
                            warn!("[POLL] Request task panicked");
                        }
                        continue;
                    }
                };
                if !sink.send(event).await {
                    debug!("[POLL] Controller gone, stopping");
                    return;
                }
            }
        }
    }
}

/// Issue one polling request and decode the body.
///
/// Returns `Ok(None)` when the body could not be decoded.
async fn fetch_once(
    config: &ConnectionConfig,
    client: &Client,
    format: PayloadFormat,
    metrics: &Metrics,
) -> Result<Option<Payload>, Error> {
    let url = config.polling_url(SystemTime::now());
    debug!("[POLL] GET {}", redact(&url));

    let response = client
        .get(url)
        .timeout(config.timeout)
        .send()
        .await
        .map_err(|e| fetch_error(e, config))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Fetch {
            status: Some(status.as_u16()),
            message: format!("HTTP {}", status),
        });
    }

    let body = response.bytes().await.map_err(|e| fetch_error(e, config))?;
    match format.decode_bytes(&body) {
        Ok(payload) => Ok(Some(payload)),
        Err(e) => {
            metrics.record_decode_failure();
            warn!("[POLL] Dropping undecodable response: {}", e);
            Ok(None)
        }
    }
}

fn fetch_error(e: reqwest::Error, config: &ConnectionConfig) -> Error {
    if e.is_timeout() {
        Error::Timeout(config.timeout)
    } else {
        Error::Fetch {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Envelope;
    use http::{HeaderName, HeaderValue};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wiremock::matchers::{header, method, path, query_param, query_param_contains};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(uri: &str) -> ConnectionConfig {
        ConnectionConfig::builder(format!("{}/latest", uri))
            .update_interval(Duration::from_millis(50))
            .timeout(Duration::from_millis(200))
            .auth_token("tok")
            .header(
                HeaderName::from_static("x-client"),
                HeaderValue::from_static("feed-tests"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_sends_token_timestamp_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .and(query_param("token", "tok"))
            .and(query_param_contains("timestamp", ""))
            .and(header("x-client", "feed-tests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"price": 3})))
            .mount(&server)
            .await;

        let config = config(&server.uri());
        let client = http_client(&config).unwrap();
        let metrics = Metrics::new();

        let payload = fetch_once(&config, &client, PayloadFormat::Json, &metrics)
            .await
            .unwrap();
        assert_eq!(payload, Some(Payload::Json(json!({"price": 3}))));
    }

    #[tokio::test]
    async fn test_non_success_status_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = config(&server.uri());
        let client = http_client(&config).unwrap();

        let err = fetch_once(&config, &client, PayloadFormat::Json, &Metrics::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(err.is_fetch());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let config = config(&server.uri());
        let client = http_client(&config).unwrap();

        let err = fetch_once(&config, &client, PayloadFormat::Json, &Metrics::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_undecodable_body_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let config = config(&server.uri());
        let client = http_client(&config).unwrap();
        let metrics = Metrics::new();

        let payload = fetch_once(&config, &client, PayloadFormat::Json, &metrics)
            .await
            .unwrap();
        assert!(payload.is_none());
        assert_eq!(metrics.decode_failures(), 1);
    }

    #[tokio::test]
    async fn test_channel_keeps_polling_after_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 1})))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel::<Envelope>(16);
        let metrics = Arc::new(Metrics::new());
        let config = Arc::new(config(&server.uri()));
        let client = http_client(&config).unwrap();
        let channel = PollingChannel::spawn(
            9,
            config,
            client,
            PayloadFormat::Json,
            metrics.clone(),
            EventSink::new(9, tx),
        );
        assert!(metrics.channel(Channel::Polling).is_active);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.channel, 9);
        assert!(matches!(first.event, ChannelEvent::PollFailed(_)));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, ChannelEvent::Payload(_)));
        assert_eq!(metrics.poll_failures(), 1);

        channel.stop();
        assert!(!metrics.channel(Channel::Polling).is_active);
    }
}
