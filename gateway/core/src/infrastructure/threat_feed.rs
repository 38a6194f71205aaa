// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP Threat Feed
//!
//! Polls a JSON endpoint returning an array of indicators. Incremental pulls
//! pass `?since=<rfc3339>`; the feed id from config overrides whatever the
//! payload claims so indicator keys stay unique per configured feed.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;
use tracing::debug;

use crate::domain::gateway_config::ThreatFeedConfig;
use crate::domain::threat_intel::{FeedError, ThreatFeed, ThreatIndicator};

pub struct HttpThreatFeed {
    id: String,
    url: String,
    api_key: Option<String>,
    enabled: bool,
    client: reqwest::Client,
}

impl HttpThreatFeed {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            api_key: None,
            enabled: true,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(config: &ThreatFeedConfig) -> Self {
        let api_key = config.api_key.as_deref().and_then(|key| match key.strip_prefix("env:") {
            Some(var) => std::env::var(var).ok(),
            None => Some(key.to_string()),
        });
        Self {
            api_key,
            enabled: config.enabled,
            ..Self::new(config.id.clone(), config.url.clone())
        }
    }
}

#[async_trait]
impl ThreatFeed for HttpThreatFeed {
    fn feed_id(&self) -> &str {
        &self.id
    }

    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ThreatIndicator>, FeedError> {
        if !self.enabled {
            return Err(FeedError::Disabled(self.id.clone()));
        }

        let mut url = reqwest::Url::parse(&self.url).map_err(|e| FeedError::Network(e.to_string()))?;
        if let Some(since) = since {
            url.query_pairs_mut()
                .append_pair("since", &since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| FeedError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Http(response.status().as_u16()));
        }

        let mut indicators: Vec<ThreatIndicator> = response
            .json()
            .await
            .map_err(|e| FeedError::Parse(e.to_string()))?;

        for indicator in &mut indicators {
            indicator.feed_id = self.id.clone();
        }
        debug!(feed = %self.id, count = indicators.len(), "Fetched threat indicators");
        Ok(indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::threat_intel::{IndicatorType, Severity};

    const BODY: &str = r#"[{
        "feed_id": "upstream",
        "indicator_id": "ind-1",
        "type": "signature",
        "value": "ignore previous instructions",
        "severity": "high",
        "confidence": 0.9,
        "first_seen": "2026-01-01T00:00:00Z",
        "last_seen": "2026-01-02T00:00:00Z",
        "tags": ["prompt-injection"]
    }]"#;

    #[tokio::test]
    async fn test_fetch_parses_and_rebrands_feed_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/indicators")
            .match_query(mockito::Matcher::UrlEncoded("since".into(), "2026-01-01T00:00:00Z".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(BODY)
            .create_async()
            .await;

        let feed = HttpThreatFeed::new("local", format!("{}/indicators", server.url()));
        let since = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let indicators = feed.fetch_since(Some(since)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].feed_id, "local");
        assert_eq!(indicators[0].indicator_type, IndicatorType::Signature);
        assert_eq!(indicators[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn test_http_error_and_bad_payload() {
        let mut server = mockito::Server::new_async().await;
        let _down = server.mock("GET", "/down").with_status(503).create_async().await;
        let _junk = server
            .mock("GET", "/junk")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let down = HttpThreatFeed::new("down", format!("{}/down", server.url()));
        assert!(matches!(down.fetch_since(None).await, Err(FeedError::Http(503))));

        let junk = HttpThreatFeed::new("junk", format!("{}/junk", server.url()));
        assert!(matches!(junk.fetch_since(None).await, Err(FeedError::Parse(_))));
    }

    #[tokio::test]
    async fn test_disabled_feed() {
        let feed = HttpThreatFeed::from_config(&ThreatFeedConfig {
            id: "off".into(),
            url: "http://localhost:1".into(),
            api_key: None,
            enabled: false,
        });
        assert!(matches!(feed.fetch_since(None).await, Err(FeedError::Disabled(_))));
    }
}
