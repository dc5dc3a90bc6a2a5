//! Query, call and connection handlers

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sluice_core::{Config, Endpoint, Observer, Query, SyncClient, SyncError, SyncEvent};

use crate::output::Output;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pick the endpoint: `--discover` wins, then `--url`, then the config file
pub fn endpoint(url: Option<String>, discover: Option<String>, config: &Config) -> Result<Endpoint> {
    if let Some(discover) = discover {
        return discovery_endpoint(discover);
    }
    url.or_else(|| config.url.clone())
        .map(Endpoint::from)
        .context(
            "Sync server not configured. Pass --url or set it with:\n  \
             SLUICE_URL=wss://your-server/sync",
        )
}

/// Endpoint that asks an HTTP service for the WebSocket URL on every attempt
fn discovery_endpoint(discover: String) -> Result<Endpoint> {
    let http = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
        .build()?;

    Ok(Endpoint::resolver(move || {
        let http = http.clone();
        let discover = discover.clone();
        async move {
            let response = http
                .get(&discover)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| SyncError::Transport(format!("Discovery failed: {}", e)))?;
            let body = response
                .text()
                .await
                .map_err(|e| SyncError::Transport(format!("Discovery failed: {}", e)))?;
            Ok(body.trim().to_string())
        }
    }))
}

/// Start a client, connect it and authenticate if a token was given
pub async fn connect(config: Config, endpoint: Endpoint, token: Option<String>) -> Result<SyncClient> {
    let timeout = config.request_timeout();
    let mut client = SyncClient::new(config);
    if let Some(mut events) = client.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SyncEvent::Error(message) => warn!("{}", message),
                    SyncEvent::TokenExpiring { expires_at } => {
                        warn!("Auth token expires at {:?}", expires_at)
                    }
                    other => info!("{:?}", other),
                }
            }
        });
    }
    client.connect(endpoint)?;

    if let Some(token) = token {
        let authenticated = tokio::time::timeout(timeout, client.auth(Some(token), None))
            .await
            .context("Timed out waiting for the server")?
            .context("Authentication failed")?;
        if !authenticated {
            bail!("Server did not accept the auth token");
        }
    }
    Ok(client)
}

/// Print every update of a query until `count` updates or Ctrl-C
pub async fn observe(
    client: &SyncClient,
    query: Query,
    count: Option<usize>,
    output: &Output,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let errors = tx.clone();
    let observer = Observer::new()
        .on_data(move |value, checksum| {
            let _ = tx.send(Ok((value.clone(), checksum)));
        })
        .on_error(move |error| {
            let _ = errors.send(Err(error.clone()));
        });

    let _handle = client.observe(query, observer).await?;
    let mut seen = 0;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(Ok((value, checksum))) => {
                    output.print_update(&value, checksum);
                    seen += 1;
                    if count.is_some_and(|count| seen >= count) {
                        break;
                    }
                }
                Some(Err(error)) => return Err(error).context("Subscription failed"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Fetch a query once
pub async fn get(client: &SyncClient, query: Query, timeout: Duration, output: &Output) -> Result<()> {
    let value = tokio::time::timeout(timeout, client.get(query))
        .await
        .context("Timed out waiting for the server")??;
    output.print_value(&value);
    Ok(())
}

/// Call a server function
pub async fn call(client: &SyncClient, name: &str, payload: Value, output: &Output) -> Result<()> {
    let value = client.call(name, payload).await?;
    output.print_value(&value);
    Ok(())
}

/// Build a query from its JSON payload and optional name
pub fn parse_query(query_json: &str, name: Option<String>) -> Result<Query> {
    let payload = parse_json(query_json)?;
    Ok(match name {
        Some(name) => Query::named(name, payload),
        None => Query::new(payload),
    })
}

/// Parse a JSON argument; a missing argument is `null`
pub fn parse_payload(payload_json: Option<&str>) -> Result<Value> {
    payload_json.map_or(Ok(Value::Null), parse_json)
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON: {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_query() {
        let query = parse_query(r#"{"limit": 10}"#, Some("feed".to_string())).unwrap();
        assert_eq!(query, Query::named("feed", json!({ "limit": 10 })));

        let anonymous = parse_query("[1, 2]", None).unwrap();
        assert_eq!(anonymous, Query::new(json!([1, 2])));
        assert_ne!(query.id(), anonymous.id());
    }

    #[test]
    fn test_parse_query_rejects_bad_json() {
        let err = parse_query("{limit: 10}", None).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(None).unwrap(), Value::Null);
        assert_eq!(parse_payload(Some(r#""hi""#)).unwrap(), json!("hi"));
        assert!(parse_payload(Some("nope")).is_err());
    }

    #[test]
    fn test_endpoint_precedence() {
        let config = Config {
            url: Some("ws://from-config".to_string()),
            ..Config::default()
        };

        let endpoint = endpoint(Some("ws://from-flag".to_string()), None, &config).unwrap();
        assert!(matches!(endpoint, Endpoint::Url(url) if url == "ws://from-flag"));

        let endpoint = super::endpoint(None, None, &config).unwrap();
        assert!(matches!(endpoint, Endpoint::Url(url) if url == "ws://from-config"));

        let endpoint = super::endpoint(
            Some("ws://from-flag".to_string()),
            Some("http://localhost:1/discover".to_string()),
            &config,
        )
        .unwrap();
        assert!(matches!(endpoint, Endpoint::Resolver(_)));
    }

    #[test]
    fn test_endpoint_missing() {
        let err = endpoint(None, None, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("--url"));
    }
}
