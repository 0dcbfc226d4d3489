//! Helpers for tests that talk to a local mock server.

use std::{sync::Arc, time::Duration};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::{Client, Config, HttpTokenIssuer, RetryConfig, TokenManager};

/// Token manager issuing against `base_url`, with retries disabled.
pub fn test_token_manager(base_url: &str) -> Arc<TokenManager> {
    let issuer = HttpTokenIssuer::new(base_url)
        .expect("token issuer")
        .with_retry(RetryConfig::disabled());
    Arc::new(TokenManager::new(Arc::new(issuer)))
}

/// Create a test client configured to use a wiremock server.
/// Disables retries and uses a private token cache for predictable test behavior.
pub fn test_client(base_url: &str) -> Client {
    test_client_with(base_url, Config::default())
}

/// Like [`test_client`], keeping any fields already set on `cfg`.
pub fn test_client_with(base_url: &str, cfg: Config) -> Client {
    Client::new(Config {
        app_key: cfg.app_key.or_else(|| Some("ding_test_key".to_string())),
        app_secret: cfg.app_secret.or_else(|| Some("test_secret".to_string())),
        assistant_id: cfg.assistant_id.or_else(|| Some("asst_test".to_string())),
        api_host: Some(base_url.to_string()),
        retry: cfg.retry.or_else(|| Some(RetryConfig::disabled())),
        token_manager: cfg
            .token_manager
            .or_else(|| Some(test_token_manager(base_url))),
        ..cfg
    })
    .expect("client")
}

/// Start a local server that answers every request with a chunked `text/event-stream`.
///
/// Each step waits for its delay and then writes its text as one chunk, verbatim. The
/// access-token request is answered with a fixed token. Connections are served until the
/// runtime shuts down.
pub async fn start_chunked_sse_server(
    steps: Vec<(Duration, String)>,
    finish_after: Option<Duration>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let steps = steps.clone();

            tokio::spawn(async move {
                // Read the whole request before answering.
                let mut buf = [0u8; 4096];
                let mut received = Vec::new();
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(n) => n,
                        Err(_) => return,
                    };
                    if n == 0 {
                        return;
                    }
                    received.extend_from_slice(&buf[..n]);
                    if request_complete(&received) {
                        break;
                    }
                }
                let request_line = String::from_utf8_lossy(&received)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();

                if request_line.contains("/oauth2/accessToken") {
                    let body = r#"{"accessToken":"sse_token","expireIn":7200}"#;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    return;
                }

                let headers = concat!(
                    "HTTP/1.1 200 OK\r\n",
                    "Content-Type: text/event-stream\r\n",
                    "Transfer-Encoding: chunked\r\n",
                    "Connection: close\r\n",
                    "\r\n"
                );
                if socket.write_all(headers.as_bytes()).await.is_err() {
                    return;
                }

                for (delay, text) in steps {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if text.is_empty() {
                        continue;
                    }
                    let chunk = format!("{:X}\r\n{}\r\n", text.len(), text);
                    if socket.write_all(chunk.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                }

                if let Some(delay) = finish_after {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }

                let _ = socket.write_all(b"0\r\n\r\n").await;
            });
        }
    });

    format!("http://{}", addr)
}

/// Headers received and, when `Content-Length` is set, the whole body too.
fn request_complete(received: &[u8]) -> bool {
    let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&received[..end]);
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    received.len() >= end + 4 + content_length
}

/// Start a local SSE server that immediately emits all chunks.
pub async fn start_sse_server(chunks: Vec<String>) -> String {
    let steps = chunks
        .into_iter()
        .map(|chunk| (Duration::from_millis(0), chunk))
        .collect();
    start_chunked_sse_server(steps, None).await
}
