//! Pull-API collector — periodic HTTP fetch of JSON documents
//!
//! Monitoring systems (settlement, displacement, groundwater) expose REST
//! endpoints polled at intervals of seconds to minutes. Each endpoint maps
//! JSON paths to tag names; credentials are resolved from named environment
//! variables once at startup and never stored in configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PullAuth, PullEndpoint, SourceKind, SourceSpec};
use crate::types::Sample;

use super::{Backoff, CollectorContext, CollectorError, SourceHealthState};

/// HTTP timeout per fetch.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client state resolved at `start()` — fail-fast on bad auth config.
pub(super) struct PreparedPull {
    http: reqwest::Client,
    bearer: Option<String>,
    basic: Option<(String, String)>,
}

/// Resolve credentials and build the HTTP client. Configuration errors
/// (missing env var, unusable endpoint URL) surface here.
pub(super) fn prepare(spec: &SourceSpec) -> Result<PreparedPull, CollectorError> {
    let SourceKind::PullApi { auth, endpoints } = &spec.kind else {
        return Err(CollectorError::Configuration(format!(
            "source {} is not a pull-API source",
            spec.source_id
        )));
    };
    for endpoint in endpoints {
        if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
            return Err(CollectorError::Configuration(format!(
                "endpoint {} has a non-HTTP url: {}",
                endpoint.name, endpoint.url
            )));
        }
    }

    let mut bearer = None;
    let mut basic = None;
    match auth {
        PullAuth::None => {}
        PullAuth::Bearer { token_env } => {
            let token = std::env::var(token_env).map_err(|_| {
                CollectorError::Configuration(format!(
                    "credential env var {token_env} is not set"
                ))
            })?;
            bearer = Some(token);
        }
        PullAuth::Basic {
            username,
            password_env,
        } => {
            let password = std::env::var(password_env).map_err(|_| {
                CollectorError::Configuration(format!(
                    "credential env var {password_env} is not set"
                ))
            })?;
            basic = Some((username.clone(), password));
        }
    }

    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CollectorError::Configuration(format!("http client: {e}")))?;

    Ok(PreparedPull {
        http,
        bearer,
        basic,
    })
}

/// Dotted-path lookup into a JSON document. Path segments index objects by
/// key and arrays by number; the leaf must be a number (or a numeric
/// string, which some gateways emit).
pub fn extract_json_path(value: &serde_json::Value, path: &str) -> Option<f64> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match current {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

struct EndpointState {
    next_due: Instant,
    backoff: Backoff,
    degraded: bool,
}

/// Run loop: fetch each endpoint on its own interval; failures back off
/// exponentially up to the configured cap, successes restore the normal
/// cadence.
pub(super) async fn run(
    spec: SourceSpec,
    prepared: PreparedPull,
    mut ctx: CollectorContext,
    health: Arc<SourceHealthState>,
    cancel: CancellationToken,
) {
    let SourceKind::PullApi { endpoints, .. } = &spec.kind else {
        return;
    };
    let mut states: Vec<EndpointState> = endpoints
        .iter()
        .map(|_| EndpointState {
            next_due: Instant::now(),
            backoff: Backoff::new(spec.backoff),
            degraded: false,
        })
        .collect();
    health.mark_connected(true);

    loop {
        let earliest = states
            .iter()
            .map(|s| s.next_due)
            .min()
            .unwrap_or_else(Instant::now);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(earliest) => {}
        }

        let now = Instant::now();
        for (endpoint, state) in endpoints.iter().zip(states.iter_mut()) {
            if state.next_due > now {
                continue;
            }
            match fetch(&prepared, endpoint).await {
                Ok(body) => {
                    let poll_ts = crate::types::now_ms();
                    for field in &endpoint.fields {
                        match extract_json_path(&body, &field.path) {
                            Some(value) => {
                                let mut sample =
                                    Sample::raw(&spec.source_id, &field.tag, poll_ts, value);
                                sample.meta.location = field.location.clone();
                                sample.meta.unit = field.unit.clone();
                                ctx.ingest(sample).await;
                            }
                            None => ctx.note_missing(&field.tag),
                        }
                    }
                    state.backoff.reset();
                    state.degraded = false;
                    state.next_due =
                        now + Duration::from_secs(endpoint.poll_interval_s.max(1));
                }
                Err(e) => {
                    health.mark_error(crate::types::now_ms());
                    let delay = state.backoff.next_delay();
                    if !state.degraded {
                        state.degraded = true;
                        tracing::warn!(
                            source = %spec.source_id,
                            endpoint = %endpoint.name,
                            error = %e,
                            retry_ms = delay.as_millis() as u64,
                            "Endpoint fetch failed, backing off"
                        );
                    }
                    state.next_due = now + delay;
                }
            }
        }
        ctx.housekeeping(crate::types::now_ms()).await;
    }
    health.mark_connected(false);
}

async fn fetch(
    prepared: &PreparedPull,
    endpoint: &PullEndpoint,
) -> Result<serde_json::Value, CollectorError> {
    let mut request = prepared.http.get(&endpoint.url);
    if let Some(token) = &prepared.bearer {
        request = request.bearer_auth(token);
    }
    if let Some((user, password)) = &prepared.basic {
        request = request.basic_auth(user, Some(password));
    }
    let response = request
        .send()
        .await
        .map_err(|e| CollectorError::Transient(e.to_string()))?;
    let response = response
        .error_for_status()
        .map_err(|e| CollectorError::Transient(e.to_string()))?;
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| CollectorError::Transient(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested_object() {
        let body = json!({"data": {"settlement": {"value": -2.7, "unit": "mm"}}});
        assert_eq!(extract_json_path(&body, "data.settlement.value"), Some(-2.7));
        assert_eq!(extract_json_path(&body, "data.settlement.unit"), None);
        assert_eq!(extract_json_path(&body, "data.missing"), None);
    }

    #[test]
    fn test_extract_array_index() {
        let body = json!({"points": [{"v": 1.5}, {"v": 2.5}]});
        assert_eq!(extract_json_path(&body, "points.1.v"), Some(2.5));
        assert_eq!(extract_json_path(&body, "points.9.v"), None);
    }

    #[test]
    fn test_extract_numeric_string() {
        let body = json!({"value": " -3.25 "});
        assert_eq!(extract_json_path(&body, "value"), Some(-3.25));
    }

    #[test]
    fn test_prepare_rejects_missing_env() {
        let spec = SourceSpec {
            source_id: "survey_api".to_string(),
            table: crate::types::TableKind::Monitoring,
            kind: SourceKind::PullApi {
                auth: PullAuth::Bearer {
                    token_env: "DEFINITELY_NOT_SET_TOKEN".to_string(),
                },
                endpoints: vec![PullEndpoint {
                    name: "settlement".to_string(),
                    url: "https://monitoring.example/api/v1/latest".to_string(),
                    poll_interval_s: 60,
                    fields: Vec::new(),
                }],
            },
            endpoint: "https://monitoring.example".to_string(),
            tags: Vec::new(),
            backoff: crate::config::BackoffConfig::default(),
            default_cadence_ms: 60_000,
        };
        assert!(matches!(
            prepare(&spec),
            Err(CollectorError::Configuration(_))
        ));
    }

    #[test]
    fn test_prepare_rejects_non_http_url() {
        let spec = SourceSpec {
            source_id: "survey_api".to_string(),
            table: crate::types::TableKind::Monitoring,
            kind: SourceKind::PullApi {
                auth: PullAuth::None,
                endpoints: vec![PullEndpoint {
                    name: "settlement".to_string(),
                    url: "ftp://monitoring.example/feed".to_string(),
                    poll_interval_s: 60,
                    fields: Vec::new(),
                }],
            },
            endpoint: "monitoring.example".to_string(),
            tags: Vec::new(),
            backoff: crate::config::BackoffConfig::default(),
            default_cadence_ms: 60_000,
        };
        assert!(matches!(
            prepare(&spec),
            Err(CollectorError::Configuration(_))
        ));
    }
}
