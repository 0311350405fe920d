use async_trait::async_trait;
use diagnostics::*;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::StoreError;
use crate::influx::flux::{self, rfc3339};
use crate::influx::line_protocol;
use crate::models::{BucketRef, ReplacementPoint, Window};
use crate::store::{SampleStream, TimeSeriesStore};

/// Default per-request timeout for delete, write and lookup calls
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;

/// Result of `GET /health`
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Health {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(rename = "orgID")]
    pub org_id: String,
}

#[derive(Deserialize)]
struct Organizations {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct Buckets {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Async InfluxDB 2.x HTTP API client
#[derive(Clone)]
pub struct InfluxClient {
    http_client: reqwest::Client,
    base_url: Url,
    org: String,
    token: String,
    timeout: Duration,
}

impl InfluxClient {
    /// Create a client for `url`, authenticating with an API token
    pub fn new(url: &str, org: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut base_url = Url::parse(url)
            .map_err(|e| StoreError::Connection(format!("invalid store URL {url:?}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connection(format!("failed to create HTTP client: {e}")))?;

        Ok(InfluxClient {
            http_client,
            base_url,
            org: org.to_string(),
            token: token.to_string(),
            timeout,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    /// Check that the server is up. Does not check the token.
    pub async fn health(&self) -> Result<Health, StoreError> {
        let url = self.endpoint("health", &[])?;
        let response = self
            .send(self.http_client.get(url).timeout(self.timeout))
            .await?;
        response.json().await.map_err(StoreError::from)
    }

    /// Check that the token can see the configured organization
    pub async fn test_authentication(&self) -> Result<Organization, StoreError> {
        self.find_organization(&self.org).await?.ok_or_else(|| StoreError::Unauthorized {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("organization {:?} is not visible to this token", self.org),
        })
    }

    pub async fn find_organization(&self, name: &str) -> Result<Option<Organization>, StoreError> {
        let url = self.endpoint("api/v2/orgs", &[("org", name)])?;
        let response = match self.send(self.authorized(self.http_client.get(url))).await {
            Err(StoreError::Rejected { status: 404, .. }) => return Ok(None),
            other => other?,
        };
        let found: Organizations = response.json().await?;
        Ok(found.orgs.into_iter().find(|o| o.name == name))
    }

    pub async fn find_bucket(&self, name: &str) -> Result<Option<Bucket>, StoreError> {
        let url = self.endpoint("api/v2/buckets", &[("org", self.org.as_str()), ("name", name)])?;
        let response = match self.send(self.authorized(self.http_client.get(url))).await {
            Err(StoreError::Rejected { status: 404, .. }) => return Ok(None),
            other => other?,
        };
        let found: Buckets = response.json().await?;
        Ok(found.buckets.into_iter().find(|b| b.name == name))
    }

    /// Create a bucket with infinite retention
    pub async fn create_bucket(&self, org_id: &str, name: &str) -> Result<Bucket, StoreError> {
        let url = self.endpoint("api/v2/buckets", &[])?;
        let body = serde_json::json!({
            "orgID": org_id,
            "name": name,
            "retentionRules": [],
        });
        let response = self
            .send(self.authorized(self.http_client.post(url)).json(&body))
            .await?;
        Ok(response.json().await?)
    }

    /// Look up `name`, creating it in the client's organization if missing
    pub async fn ensure_bucket(&self, name: &str) -> Result<Bucket, StoreError> {
        if let Some(bucket) = self.find_bucket(name).await? {
            debug!("Bucket {name} already exists", name: name);
            return Ok(bucket);
        }
        let org = self.test_authentication().await?;
        let org_name = org.name.as_str();
        info!(
            "Creating bucket {name} in org {org_name}",
            name: name,
            org_name: org_name
        );
        self.create_bucket(&org.id, name).await
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, StoreError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| StoreError::Connection(format!("invalid endpoint {path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .timeout(self.timeout)
    }

    /// Send a request and turn non-success statuses into errors
    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = match serde_json::from_str::<ApiError>(&body) {
            Ok(ApiError {
                code: Some(code),
                message: Some(message),
            }) => format!("{code}: {message}"),
            Ok(ApiError {
                message: Some(message),
                ..
            }) => message,
            _ => body,
        };

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(StoreError::Unauthorized {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(StoreError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// `_measurement="<name>"` with the name quoted for the delete predicate syntax
pub fn measurement_predicate(measurement: &str) -> String {
    let escaped = measurement.replace('\\', "\\\\").replace('"', "\\\"");
    format!("_measurement=\"{escaped}\"")
}

#[async_trait]
impl TimeSeriesStore for InfluxClient {
    async fn query_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        field: &str,
        window: &Window,
    ) -> Result<Option<SampleStream>, StoreError> {
        let query = flux::window_query(&location.bucket, measurement, field, window);
        debug!("Flux query: {query}", query: query.as_str());

        let url = self.endpoint("api/v2/query", &[("org", location.org.as_str())])?;
        let body = serde_json::json!({
            "query": query,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "annotations": ["datatype", "group", "default"],
            },
        });
        // The body is streamed, so no overall timeout here; only connect is bounded.
        let request = self
            .http_client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&body);
        let response = self.send(request).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(flux::decode_stream(response.bytes_stream())))
    }

    async fn delete_window(
        &self,
        location: &BucketRef,
        measurement: &str,
        window: &Window,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(
            "api/v2/delete",
            &[("org", location.org.as_str()), ("bucket", location.bucket.as_str())],
        )?;
        let body = serde_json::json!({
            "start": rfc3339(window.start()),
            "stop": rfc3339(window.end()),
            "predicate": measurement_predicate(measurement),
        });
        self.send(self.authorized(self.http_client.post(url)).json(&body))
            .await?;
        Ok(())
    }

    async fn write_points(
        &self,
        location: &BucketRef,
        points: &[ReplacementPoint],
    ) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = line_protocol::encode_batch(points)?;
        let url = self.endpoint(
            "api/v2/write",
            &[
                ("org", location.org.as_str()),
                ("bucket", location.bucket.as_str()),
                ("precision", "ns"),
            ],
        )?;
        self.send(
            self.authorized(self.http_client.post(url))
                .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(body),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> InfluxClient {
        InfluxClient::new(url, "my-org", "secret", Duration::from_secs(5)).expect("valid client")
    }

    #[test]
    fn test_endpoint_construction() {
        let c = client("http://localhost:8086");
        assert_eq!(
            c.endpoint("api/v2/query", &[("org", "my org")]).expect("url").as_str(),
            "http://localhost:8086/api/v2/query?org=my+org"
        );

        let prefixed = client("https://example.com/influx");
        assert_eq!(
            prefixed
                .endpoint("api/v2/delete", &[("org", "o"), ("bucket", "b")])
                .expect("url")
                .as_str(),
            "https://example.com/influx/api/v2/delete?org=o&bucket=b"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = InfluxClient::new("not a url", "o", "t", Duration::from_secs(1));
        assert!(matches!(result, Err(StoreError::Connection(_))));
    }

    #[test]
    fn test_measurement_predicate() {
        assert_eq!(measurement_predicate("test"), r#"_measurement="test""#);
        assert_eq!(
            measurement_predicate(r#"say "hi""#),
            r#"_measurement="say \"hi\"""#
        );
    }
}
