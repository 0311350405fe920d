use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use warp::Filter;
use warp::http::{Method, StatusCode};
use warp::reply::Reply;

pub const MOCK_TOKEN: &str = "test-token";
pub const MOCK_ORG: &str = "test-org";
pub const MOCK_ORG_ID: &str = "0000000000000001";

/// One request as seen by the mock server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
    pub body: String,
}

/// What the query endpoint answers
#[derive(Debug, Clone)]
pub enum QueryAnswer {
    Csv(String),
    NoContent,
    Status(u16, String),
}

#[derive(Debug)]
struct MockState {
    requests: Vec<RecordedRequest>,
    query: QueryAnswer,
    delete_status: u16,
    write_status: u16,
    buckets: Vec<String>,
}

/// Mock InfluxDB 2.x server recording every request it receives
pub struct MockInfluxServer {
    state: Arc<Mutex<MockState>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockInfluxServer {
    pub fn new(query: QueryAnswer) -> Self {
        MockInfluxServer {
            state: Arc::new(Mutex::new(MockState {
                requests: Vec::new(),
                query,
                delete_status: 204,
                write_status: 204,
                buckets: vec!["fleet".to_string()],
            })),
            server_handle: None,
        }
    }

    pub async fn set_delete_status(&self, status: u16) {
        self.state.lock().await.delete_status = status;
    }

    pub async fn set_write_status(&self, status: u16) {
        self.state.lock().await.write_status = status;
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().await.requests.clone()
    }

    /// Requests to one API path, e.g. `/api/v2/write`
    pub async fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub async fn buckets(&self) -> Vec<String> {
        self.state.lock().await.buckets.clone()
    }

    /// Start the mock server and return the base URL
    pub async fn start(&mut self) -> String {
        let state = self.state.clone();
        let routes = warp::any()
            .and(warp::method())
            .and(warp::path::full())
            .and(warp::query::<HashMap<String, String>>())
            .and(warp::header::optional::<String>("authorization"))
            .and(warp::body::bytes())
            .and_then(
                move |method: Method,
                      path: warp::path::FullPath,
                      params: HashMap<String, String>,
                      authorization: Option<String>,
                      body: Bytes| {
                    let state = state.clone();
                    async move {
                        let request = RecordedRequest {
                            method: method.to_string(),
                            path: path.as_str().to_string(),
                            params,
                            authorization,
                            body: String::from_utf8_lossy(&body).to_string(),
                        };
                        Ok::<_, warp::Rejection>(handle(state, request).await)
                    }
                },
            );

        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        self.server_handle = Some(tokio::spawn(server));
        format!("http://127.0.0.1:{}", addr.port())
    }
}

impl Drop for MockInfluxServer {
    fn drop(&mut self) {
        if let Some(handle) = &self.server_handle {
            handle.abort();
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn api_error(code: u16, message: &str) -> Box<dyn Reply> {
    let body = serde_json::json!({ "code": "invalid", "message": message });
    Box::new(warp::reply::with_status(warp::reply::json(&body), status(code)))
}

fn empty(code: u16) -> Box<dyn Reply> {
    Box::new(warp::reply::with_status(warp::reply(), status(code)))
}

async fn handle(state: Arc<Mutex<MockState>>, request: RecordedRequest) -> Box<dyn Reply> {
    let mut state = state.lock().await;
    state.requests.push(request.clone());

    if request.path == "/health" {
        return Box::new(warp::reply::json(&serde_json::json!({
            "name": "influxdb",
            "status": "pass",
            "version": "v2.7.0-mock",
        })));
    }

    let expected = format!("Token {MOCK_TOKEN}");
    if request.authorization.as_deref() != Some(expected.as_str()) {
        let body = serde_json::json!({ "code": "unauthorized", "message": "unauthorized access" });
        return Box::new(warp::reply::with_status(
            warp::reply::json(&body),
            StatusCode::UNAUTHORIZED,
        ));
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/v2/query") => match state.query.clone() {
            QueryAnswer::Csv(csv) => Box::new(warp::reply::with_header(
                csv,
                "content-type",
                "text/csv; charset=utf-8",
            )),
            QueryAnswer::NoContent => empty(204),
            QueryAnswer::Status(code, message) => api_error(code, &message),
        },
        ("POST", "/api/v2/delete") => match state.delete_status {
            204 => empty(204),
            code => api_error(code, "delete rejected"),
        },
        ("POST", "/api/v2/write") => match state.write_status {
            204 => empty(204),
            code => api_error(code, "partial write: field type conflict"),
        },
        ("GET", "/api/v2/orgs") => {
            let orgs = if request.params.get("org").map(String::as_str) == Some(MOCK_ORG) {
                vec![serde_json::json!({ "id": MOCK_ORG_ID, "name": MOCK_ORG })]
            } else {
                Vec::new()
            };
            Box::new(warp::reply::json(&serde_json::json!({ "orgs": orgs })))
        }
        ("GET", "/api/v2/buckets") => {
            let wanted = request.params.get("name").cloned().unwrap_or_default();
            let buckets: Vec<_> = state
                .buckets
                .iter()
                .filter(|b| **b == wanted)
                .map(|b| {
                    serde_json::json!({ "id": format!("id-{b}"), "name": b, "orgID": MOCK_ORG_ID })
                })
                .collect();
            Box::new(warp::reply::json(&serde_json::json!({ "buckets": buckets })))
        }
        ("POST", "/api/v2/buckets") => {
            let body: serde_json::Value = serde_json::from_str(&request.body).unwrap_or_default();
            let name = body["name"].as_str().unwrap_or_default().to_string();
            state.buckets.push(name.clone());
            Box::new(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "id": format!("id-{name}"),
                    "name": name,
                    "orgID": body["orgID"],
                })),
                StatusCode::CREATED,
            ))
        }
        _ => empty(404),
    }
}

/// Annotated CSV for `(unix seconds, value)` rows, one table
pub fn annotated_csv(rows: &[(i64, f64)]) -> String {
    let mut csv = String::from(
        "#datatype,string,long,dateTime:RFC3339,double\r\n\
         #group,false,false,false,false\r\n\
         #default,_result,,,\r\n\
         ,result,table,_time,_value\r\n",
    );
    for (secs, value) in rows {
        let time = chrono::DateTime::from_timestamp(*secs, 0)
            .expect("valid timestamp")
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        csv.push_str(&format!(",,0,{time},{value}\r\n"));
    }
    csv.push_str("\r\n");
    csv
}
