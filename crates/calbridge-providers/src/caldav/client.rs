//! [`RemoteClient`] over CalDAV.
//!
//! Calendars are discovered with a depth-1 PROPFIND on the configured URL.
//! Changes are detected by comparing the etags of a calendar-query REPORT
//! with the etags already stored; only new or modified resources are then
//! fetched with calendar-multiget.

use std::collections::HashMap;

use calbridge_core::BoxFuture;
use reqwest::header::{
    ALLOW, AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, IF_MATCH, IF_NONE_MATCH, WWW_AUTHENTICATE,
};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{ProviderError, ProviderResult};
use crate::remote::{
    ChangeSet, FetchChanges, PushOp, RemoteCalendar, RemoteClient, RemoteEvent, ServerFeatures,
};

use super::auth::{Authenticator, Challenge};
use super::config::CalDavConfig;
use super::xml;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

pub struct CalDavClient {
    http: Client,
    config: CalDavConfig,
    auth: Option<Authenticator>,
}

impl std::fmt::Debug for CalDavClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalDavClient")
            .field("url", &self.config.url.as_str())
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

struct DavRequest<'a> {
    method: Method,
    url: Url,
    headers: Vec<(reqwest::header::HeaderName, String)>,
    body: Option<(&'static str, &'a str)>,
}

impl<'a> DavRequest<'a> {
    fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    fn header(mut self, name: reqwest::header::HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn depth(self, depth: u8) -> Self {
        self.header(reqwest::header::HeaderName::from_static("depth"), depth.to_string())
    }

    fn body(mut self, content_type: &'static str, body: &'a str) -> Self {
        self.body = Some((content_type, body));
        self
    }
}

impl CalDavClient {
    pub fn new(config: CalDavConfig) -> ProviderResult<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                ProviderError::internal(format!("failed to create HTTP client: {}", e)).with_source(e)
            })?;
        let auth = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some(Authenticator::new(username, password)),
            _ => None,
        };
        Ok(Self { http, config, auth })
    }

    pub fn config(&self) -> &CalDavConfig {
        &self.config
    }

    /// Resolves a server href against the configured URL.
    fn resolve(&self, href: &str) -> ProviderResult<Url> {
        self.config.url.join(href).map_err(|e| {
            ProviderError::invalid_server(format!("bad href '{}': {}", href, e)).with_source(e)
        })
    }

    /// Sends `request`, answering one authentication challenge if the
    /// server raises it.
    async fn execute(&self, request: DavRequest<'_>) -> ProviderResult<Response> {
        let mut challenged = false;
        loop {
            let mut builder = self.http.request(request.method.clone(), request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some((content_type, body)) = request.body {
                builder = builder.header(CONTENT_TYPE, content_type).body(body.to_string());
            }
            if let Some(header) = self
                .auth
                .as_ref()
                .and_then(|auth| auth.header(request.method.as_str(), request.url.path()))
            {
                builder = builder.header(AUTHORIZATION, header);
            }

            trace!(method = %request.method, url = %request.url, "sending request");
            let response = builder.send().await.map_err(|e| {
                ProviderError::offline(format!("{} {} failed: {}", request.method, request.url, e))
                    .with_source(e)
            })?;

            if response.status() != StatusCode::UNAUTHORIZED || challenged {
                return Ok(response);
            }
            let Some(auth) = self.auth.as_ref() else {
                return Ok(response);
            };
            let challenge = Challenge::select(
                response
                    .headers()
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|value| value.to_str().ok()),
            );
            if let Some(challenge) = challenge
                && auth.accept(challenge)
            {
                debug!(url = %request.url, "answering authentication challenge");
                challenged = true;
            } else {
                return Ok(response);
            }
        }
    }

    /// Sends `request` and reads a multistatus answer.
    async fn multistatus(&self, request: DavRequest<'_>) -> ProviderResult<Vec<xml::DavResponse>> {
        let response = check(self.execute(request).await?)?;
        if response.status() != StatusCode::MULTI_STATUS {
            return Err(ProviderError::invalid_server(format!(
                "expected 207 Multi-Status, got {}",
                response.status()
            )));
        }
        xml::parse_multistatus(&read_body(response).await?)
    }

    async fn propfind_calendars(&self) -> ProviderResult<Vec<RemoteCalendar>> {
        let body = xml::propfind_calendars_body();
        let request = DavRequest::new(dav_method("PROPFIND")?, self.config.url.clone())
            .depth(1)
            .body(XML_CONTENT_TYPE, &body);
        let calendars: Vec<RemoteCalendar> = self
            .multistatus(request)
            .await?
            .into_iter()
            .filter(|response| response.is_calendar && !response.href.is_empty())
            .map(|response| RemoteCalendar {
                name: response
                    .display_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| collection_name(&response.href)),
                color: response.color,
                ctag: response.ctag,
                href: response.href,
            })
            .collect();
        if calendars.is_empty() {
            return Err(ProviderError::invalid_server(format!(
                "no calendar collections below {}",
                self.config.url
            )));
        }
        debug!(count = calendars.len(), "calendars listed");
        Ok(calendars)
    }

    async fn remote_etags(&self, collection: &str) -> ProviderResult<HashMap<String, String>> {
        let body = xml::etag_query_body();
        let request = DavRequest::new(dav_method("REPORT")?, self.resolve(collection)?)
            .depth(1)
            .body(XML_CONTENT_TYPE, &body);
        Ok(self
            .multistatus(request)
            .await?
            .into_iter()
            .filter(|response| response.href != collection && response.status.is_none_or(|s| s < 300))
            .map(|response| (response.href, response.etag.unwrap_or_default()))
            .collect())
    }

    async fn fetch(&self, request: FetchChanges) -> ProviderResult<ChangeSet> {
        let server = self.remote_etags(&request.calendar_href).await?;

        let changed: Vec<&String> = server
            .iter()
            .filter(|(href, etag)| request.known_etags.get(*href) != Some(*etag))
            .map(|(href, _)| href)
            .collect();
        let mut removed: Vec<String> = request
            .known_etags
            .keys()
            .filter(|href| !server.contains_key(*href))
            .cloned()
            .collect();
        debug!(
            calendar = %request.calendar_href,
            listed = server.len(),
            changed = changed.len(),
            missing = removed.len(),
            "etags compared"
        );

        let mut upserts = Vec::new();
        if !changed.is_empty() {
            let body = xml::multiget_body(&changed);
            let report = DavRequest::new(dav_method("REPORT")?, self.resolve(&request.calendar_href)?)
                .depth(1)
                .body(XML_CONTENT_TYPE, &body);
            for response in self.multistatus(report).await? {
                match (response.status, response.calendar_data) {
                    (Some(404), _) => removed.push(response.href),
                    (_, Some(ical)) => upserts.push(RemoteEvent {
                        etag: response.etag.or_else(|| server.get(&response.href).cloned()),
                        href: response.href,
                        ical,
                    }),
                    (status, None) => {
                        warn!(href = %response.href, ?status, "resource returned without data");
                    }
                }
            }
        }

        Ok(ChangeSet {
            token: None,
            upserts,
            removed,
        })
    }

    async fn push(&self, op: PushOp) -> ProviderResult<Option<String>> {
        let url = self.resolve(op.href())?;
        match op {
            PushOp::Put { ical, etag, .. } => {
                let mut request = DavRequest::new(Method::PUT, url);
                request = match etag {
                    Some(etag) => request.header(IF_MATCH, etag),
                    None => request.header(IF_NONE_MATCH, "*"),
                };
                let response = check(self.execute(request.body(ICS_CONTENT_TYPE, &ical)).await?)?;
                Ok(etag_header(response.headers()))
            }
            PushOp::Delete { etag, .. } => {
                let mut request = DavRequest::new(Method::DELETE, url);
                if let Some(etag) = etag {
                    request = request.header(IF_MATCH, etag);
                }
                let response = self.execute(request).await?;
                if response.status() == StatusCode::NOT_FOUND {
                    debug!(url = %response.url(), "resource already gone");
                    return Ok(None);
                }
                check(response)?;
                Ok(None)
            }
        }
    }
}

impl RemoteClient for CalDavClient {
    fn server_features(&self) -> BoxFuture<'_, ProviderResult<ServerFeatures>> {
        Box::pin(async move {
            let response = check(
                self.execute(DavRequest::new(Method::OPTIONS, self.config.url.clone()))
                    .await?,
            )?;
            let dav = header_list(response.headers(), "dav");
            if !dav.iter().any(|class| class.eq_ignore_ascii_case("calendar-access")) {
                return Err(ProviderError::invalid_server(format!(
                    "{} is not a CalDAV server",
                    self.config.url
                )));
            }
            let allow = header_list(response.headers(), ALLOW.as_str());
            let can_write = allow.is_empty() || allow.iter().any(|method| method == "PUT");
            Ok(ServerFeatures { can_write })
        })
    }

    fn list_calendars(&self) -> BoxFuture<'_, ProviderResult<Vec<RemoteCalendar>>> {
        Box::pin(self.propfind_calendars())
    }

    fn fetch_changes(&self, request: FetchChanges) -> BoxFuture<'_, ProviderResult<ChangeSet>> {
        Box::pin(self.fetch(request))
    }

    fn push_changes(&self, ops: Vec<PushOp>) -> BoxFuture<'_, ProviderResult<Vec<Option<String>>>> {
        Box::pin(async move {
            let mut etags = Vec::with_capacity(ops.len());
            for op in ops {
                etags.push(self.push(op).await?);
            }
            Ok(etags)
        })
    }
}

fn dav_method(name: &str) -> ProviderResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| ProviderError::internal(format!("invalid HTTP method {}: {}", name, e)))
}

/// Maps a non-success status onto the provider error taxonomy.
fn classify(status: StatusCode) -> ProviderError {
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::authentication(format!("server rejected credentials ({})", status))
        }
        StatusCode::PRECONDITION_FAILED => {
            ProviderError::server_failure("resource changed on the server")
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::server_failure("too many requests"),
        s if s.is_server_error() => ProviderError::server_failure(format!("server error ({})", s)),
        s => ProviderError::invalid_server(format!("unexpected status {}", s)),
    };
    error.with_detail(serde_json::json!({ "status": status.as_u16() }))
}

fn check(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    trace!(%status, url = %response.url(), "response");
    if status.is_success() {
        Ok(response)
    } else {
        Err(classify(status))
    }
}

async fn read_body(response: Response) -> ProviderResult<String> {
    response.text().await.map_err(|e| {
        ProviderError::offline(format!("failed to read response body: {}", e)).with_source(e)
    })
}

fn etag_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Comma-separated values of every occurrence of header `name`.
fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `/calendars/alice/work/` → `work`.
fn collection_name(href: &str) -> String {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(href)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderErrorCode;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        headers: HashMap<String, String>,
    }

    /// Serves one canned response per connection, chosen by `respond`.
    async fn serve<F>(respond: F) -> (String, Arc<Mutex<Vec<Seen>>>)
    where
        F: Fn(&Seen) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/calendars/alice/", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                let head_end = loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break None;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                let Some(head_end) = head_end else { continue };
                let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
                let mut lines = head.lines();
                let mut request_line = lines.next().unwrap().split_whitespace();
                let method = request_line.next().unwrap().to_string();
                let path = request_line.next().unwrap().to_string();
                let headers: HashMap<String, String> = lines
                    .filter_map(|line| line.split_once(':'))
                    .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
                    .collect();
                let length: usize = headers
                    .get("content-length")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                while raw.len() < head_end + length {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let request = Seen {
                    method,
                    path,
                    headers,
                };
                let response = respond(&request);
                log.lock().unwrap().push(request);
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        (url, seen)
    }

    fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut out = format!("HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: {}\r\n", status, body.len());
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out.push_str(body);
        out
    }

    fn client(url: &str) -> CalDavClient {
        CalDavClient::new(CalDavConfig::new(url).unwrap().with_credentials("alice", "secret")).unwrap()
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify(StatusCode::UNAUTHORIZED).code(), ProviderErrorCode::Authentication);
        assert_eq!(classify(StatusCode::FORBIDDEN).code(), ProviderErrorCode::Authentication);
        assert_eq!(classify(StatusCode::NOT_FOUND).code(), ProviderErrorCode::InvalidServer);
        assert_eq!(classify(StatusCode::METHOD_NOT_ALLOWED).code(), ProviderErrorCode::InvalidServer);
        assert_eq!(classify(StatusCode::TOO_MANY_REQUESTS).code(), ProviderErrorCode::ServerFailure);
        let err = classify(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), ProviderErrorCode::ServerFailure);
        assert_eq!(err.detail()["status"], 503);
    }

    #[test]
    fn collection_names() {
        assert_eq!(collection_name("/calendars/alice/work/"), "work");
        assert_eq!(collection_name("/"), "/");
    }

    #[tokio::test]
    async fn unreachable_server_is_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let err = client(&url).server_features().await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::Offline);
    }

    #[tokio::test]
    async fn options_reports_write_support() {
        let (url, _) = serve(|_| {
            reply(
                "200 OK",
                &[("DAV", "1, 2, calendar-access"), ("Allow", "OPTIONS, GET, PUT, DELETE, PROPFIND, REPORT")],
                "",
            )
        })
        .await;
        let features = client(&url).server_features().await.unwrap();
        assert!(features.can_write);
    }

    #[tokio::test]
    async fn plain_webdav_is_invalid_server() {
        let (url, _) = serve(|_| reply("200 OK", &[("DAV", "1, 2")], "")).await;
        let err = client(&url).server_features().await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::InvalidServer);
    }

    #[tokio::test]
    async fn basic_challenge_is_answered_once() {
        let (url, seen) = serve(|request| {
            if request.headers.contains_key("authorization") {
                reply("200 OK", &[("DAV", "calendar-access")], "")
            } else {
                reply("401 Unauthorized", &[("WWW-Authenticate", r#"Basic realm="dav""#)], "")
            }
        })
        .await;
        client(&url).server_features().await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].headers["authorization"], "Basic YWxpY2U6c2VjcmV0");
    }

    #[tokio::test]
    async fn digest_challenge_is_answered_once() {
        let (url, seen) = serve(|request| {
            if request.headers.contains_key("authorization") {
                reply("200 OK", &[("DAV", "calendar-access")], "")
            } else {
                reply(
                    "401 Unauthorized",
                    &[
                        ("WWW-Authenticate", r#"Basic realm="dav""#),
                        ("WWW-Authenticate", r#"Digest realm="dav", nonce="n1", qop="auth""#),
                    ],
                    "",
                )
            }
        })
        .await;
        client(&url).server_features().await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let header = &seen[1].headers["authorization"];
        assert!(header.starts_with("Digest "), "{}", header);
        assert!(header.contains(r#"nonce="n1""#));
    }

    #[tokio::test]
    async fn rejected_credentials_are_authentication_errors() {
        let (url, seen) = serve(|_| {
            reply("401 Unauthorized", &[("WWW-Authenticate", r#"Basic realm="dav""#)], "")
        })
        .await;
        let err = client(&url).server_features().await.unwrap_err();
        assert_eq!(err.code(), ProviderErrorCode::Authentication);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_changes_diffs_etags() {
        let report = r#"<d:multistatus xmlns:d="DAV:">
  <d:response><d:href>/calendars/alice/work/a.ics</d:href>
    <d:propstat><d:prop><d:getetag>"a1"</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
  <d:response><d:href>/calendars/alice/work/b.ics</d:href>
    <d:propstat><d:prop><d:getetag>"b2"</d:getetag></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
</d:multistatus>"#;
        let multiget = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:response><d:href>/calendars/alice/work/b.ics</d:href>
    <d:propstat><d:prop><d:getetag>"b2"</d:getetag><c:calendar-data>BEGIN:VCALENDAR
END:VCALENDAR</c:calendar-data></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat>
  </d:response>
</d:multistatus>"#;
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let (url, seen) = serve(move |request| {
            assert_eq!(request.method, "REPORT");
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            let body = if *calls == 1 { report } else { multiget };
            reply("207 Multi-Status", &[("Content-Type", "application/xml")], body)
        })
        .await;

        let known = HashMap::from([
            ("/calendars/alice/work/a.ics".to_string(), "\"a1\"".to_string()),
            ("/calendars/alice/work/b.ics".to_string(), "\"b1\"".to_string()),
            ("/calendars/alice/work/c.ics".to_string(), "\"c1\"".to_string()),
        ]);
        let changes = client(&url)
            .fetch_changes(FetchChanges {
                calendar_href: "/calendars/alice/work/".to_string(),
                since_token: None,
                known_etags: known,
            })
            .await
            .unwrap();

        assert_eq!(changes.upserts.len(), 1);
        assert_eq!(changes.upserts[0].href, "/calendars/alice/work/b.ics");
        assert_eq!(changes.upserts[0].etag.as_deref(), Some("\"b2\""));
        assert_eq!(changes.removed, vec!["/calendars/alice/work/c.ics".to_string()]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].path, "/calendars/alice/work/");
        assert_eq!(seen[0].headers["depth"], "1");
    }

    #[tokio::test]
    async fn put_sends_preconditions_and_returns_etag() {
        let (url, seen) = serve(|_| reply("201 Created", &[("ETag", "\"new\"")], "")).await;
        let etags = client(&url)
            .push_changes(vec![
                PushOp::Put {
                    href: "/calendars/alice/work/x.ics".to_string(),
                    ical: "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_string(),
                    etag: None,
                },
                PushOp::Put {
                    href: "/calendars/alice/work/y.ics".to_string(),
                    ical: "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n".to_string(),
                    etag: Some("\"old\"".to_string()),
                },
            ])
            .await
            .unwrap();
        assert_eq!(etags, vec![Some("\"new\"".to_string()), Some("\"new\"".to_string())]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].headers["if-none-match"], "*");
        assert_eq!(seen[1].headers["if-match"], "\"old\"");
    }

    #[tokio::test]
    async fn delete_of_missing_resource_succeeds() {
        let (url, _) = serve(|_| reply("404 Not Found", &[], "")).await;
        let result = client(&url)
            .push_changes(vec![PushOp::Delete {
                href: "/calendars/alice/work/gone.ics".to_string(),
                etag: None,
            }])
            .await
            .unwrap();
        assert_eq!(result, vec![None]);
    }
}
