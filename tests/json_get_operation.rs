use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use geocall::apis::{build_client, JsonGetOperation};
use geocall::engine::{CallEngine, RepeatableOperation};
use geocall::errors::{EngineError, ErrorKind};
use geocall::{CacheKey, CallContext, EngineConfig, RetryPolicy, ServiceId};

/// Canned geodata upstream on 127.0.0.1, counting requests per path
struct CannedUpstream {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, u32>>>,
}

impl CannedUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(serve(stream, Arc::clone(&counter)));
            }
        });
        Self { addr, hits }
    }

    fn base(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn hits(&self, path: &str) -> u32 {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

async fn serve(mut stream: TcpStream, hits: Arc<Mutex<HashMap<String, u32>>>) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&head);
    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let path = target.split('?').next().unwrap_or("/").to_string();

    let seen = {
        let mut hits = hits.lock();
        let count = hits.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let (status, body) = match path.as_str() {
        // Throttles the first two requests
        "/search" if seen <= 2 => ("429 Too Many Requests", "slow down".to_string()),
        "/search" => (
            "200 OK",
            json!({"lat": 1.286789, "lon": 103.854501, "query": target}).to_string(),
        ),
        "/features" => ("400 Bad Request", format!("invalid bbox {}", "x".repeat(300))),
        "/route" => ("200 OK", "<html>maintenance</html>".to_string()),
        _ => ("404 Not Found", String::new()),
    };
    let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(10), Duration::from_millis(40), 2.0).unwrap()
}

fn relaxed_engine() -> CallEngine<serde_json::Value> {
    let mut config = EngineConfig::default();
    for service in ServiceId::ALL {
        let settings = config.service_mut(service);
        settings.rate_per_second = 100.0;
        settings.burst = 100;
    }
    CallEngine::from_config(&config).unwrap()
}

#[tokio::test]
async fn test_throttled_search_is_retried_then_decoded() {
    let upstream = CannedUpstream::start().await;
    let engine = relaxed_engine();
    let client = build_client(Duration::from_secs(5)).unwrap();
    let op = JsonGetOperation::endpoint(client, &upstream.base(), "search")
        .unwrap()
        .query("q", "merlion park");
    let request = engine
        .request(ServiceId::Geocode, CacheKey::from_text(ServiceId::Geocode, "merlion park"))
        .policy(fast_policy(3));

    let value = engine.execute(&CallContext::new(), request.clone(), &op).await.unwrap();

    assert_eq!(value["lat"], json!(1.286789));
    assert_eq!(value["query"], json!("/search?q=merlion+park"));
    assert_eq!(upstream.hits("/search"), 3);

    // Served from cache the second time
    let again = engine.execute(&CallContext::new(), request, &op).await.unwrap();
    assert_eq!(again, value);
    assert_eq!(upstream.hits("/search"), 3);
}

#[tokio::test]
async fn test_bad_request_short_circuits_with_truncated_body() {
    let upstream = CannedUpstream::start().await;
    let engine = relaxed_engine();
    let client = build_client(Duration::from_secs(5)).unwrap();
    let op = JsonGetOperation::endpoint(client, &upstream.base(), "features").unwrap();
    let request = engine
        .request(ServiceId::MapFeatures, CacheKey::raw("map_features:bad bbox"))
        .policy(fast_policy(5));

    let error = engine.execute(&CallContext::new(), request, &op).await.unwrap_err();

    match error {
        EngineError::NonRetryable { attempt, ref source, .. } => {
            assert_eq!(attempt, 1);
            assert_eq!(source.kind, ErrorKind::InvalidRequest);
            assert!(source.message.starts_with("HTTP 400 Bad Request: invalid bbox"));
            assert!(source.message.ends_with("..."));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(upstream.hits("/features"), 1);
}

#[tokio::test]
async fn test_non_json_success_is_a_decode_failure() {
    let upstream = CannedUpstream::start().await;
    let client = build_client(Duration::from_secs(5)).unwrap();
    let op = JsonGetOperation::endpoint(client, &upstream.base(), "route").unwrap();

    let error = op.attempt(1).await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::Decode);
    assert!(!error.retryable);
    assert!(error.message.contains("invalid JSON"));
}

#[tokio::test]
async fn test_refused_connection_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = build_client(Duration::from_secs(5)).unwrap();
    let op = JsonGetOperation::endpoint(client, &format!("http://{}/", addr), "search").unwrap();

    let error = op.attempt(1).await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::Unavailable);
    assert!(error.retryable);
}
