//! Follows listing through the public Bluesky AppView.

use super::{FollowsPage, FollowsSource};
use crate::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

const GET_FOLLOWS_PATH: &str = "/xrpc/app.bsky.graph.getFollows";

/// Largest page size `getFollows` accepts.
const PAGE_LIMIT: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GetFollowsResponse {
    #[serde(default)]
    cursor: Option<String>,
    follows: Vec<ProfileView>,
}

#[derive(Debug, Deserialize)]
struct ProfileView {
    did: String,
}

/// Blocking `app.bsky.graph.getFollows` client.
///
/// Must not be called from inside an async runtime.
pub struct BskyFollowsClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl BskyFollowsClient {
    /// Create a client for the AppView at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("skymark-listener/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl FollowsSource for BskyFollowsClient {
    fn fetch_page(&self, actor: &str, cursor: Option<&str>) -> Result<FollowsPage> {
        let limit = PAGE_LIMIT.to_string();
        let mut query = vec![("actor", actor), ("limit", limit.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let response = self
            .http
            .get(format!("{}{GET_FOLLOWS_PATH}", self.base_url))
            .query(&query)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::Membership(format!(
                "getFollows for {actor} returned {status}: {body}"
            )));
        }

        let body: GetFollowsResponse = response.json()?;
        Ok(FollowsPage {
            dids: body.follows.into_iter().map(|profile| profile.did).collect(),
            cursor: body.cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one HTTP response and hand back the request line.
    fn serve_once(status: &'static str, body: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }

            let mut stream = reader.into_inner();
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
            request_line
        });

        (base_url, handle)
    }

    #[test]
    fn test_fetch_page() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"subject":{"did":"did:plc:bot"},"cursor":"next1","follows":[{"did":"did:plc:a","handle":"a.test"},{"did":"did:plc:b","handle":"b.test"}]}"#,
        );

        let client = BskyFollowsClient::new(&base_url).unwrap();
        let page = client.fetch_page("did:plc:bot", Some("prev")).unwrap();
        assert_eq!(page.dids, vec!["did:plc:a", "did:plc:b"]);
        assert_eq!(page.cursor.as_deref(), Some("next1"));

        let request_line = server.join().unwrap();
        assert!(request_line.starts_with("GET /xrpc/app.bsky.graph.getFollows?"));
        assert!(request_line.contains("actor=did%3Aplc%3Abot"));
        assert!(request_line.contains("limit=100"));
        assert!(request_line.contains("cursor=prev"));
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let (base_url, server) = serve_once("200 OK", r#"{"follows":[]}"#);
        let client = BskyFollowsClient::new(&base_url).unwrap();
        let page = client.fetch_page("did:plc:bot", None).unwrap();
        assert!(page.dids.is_empty());
        assert!(page.cursor.is_none());

        let request_line = server.join().unwrap();
        assert!(!request_line.contains("cursor="));
    }

    #[test]
    fn test_error_status_is_membership_error() {
        let (base_url, server) = serve_once(
            "400 Bad Request",
            r#"{"error":"InvalidRequest","message":"Profile not found"}"#,
        );
        let client = BskyFollowsClient::new(&base_url).unwrap();
        let err = client.fetch_page("did:plc:missing", None).unwrap_err();
        assert!(matches!(err, Error::Membership(_)));
        assert!(err.to_string().contains("Profile not found"));
        server.join().unwrap();
    }
}
