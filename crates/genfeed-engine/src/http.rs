use std::time::Duration;

use anyhow::{bail, Context, Result};
use genfeed_contracts::requests::{
    BulkDeleteResult, GenerationParams, GenerationRequest, RequestFilter, RequestPage,
};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};

use crate::source::RequestSource;

/// JSON-over-HTTP request source.
///
/// `GET {base}/requests`, `POST {base}/requests`, `DELETE {base}/requests/{id}` and
/// `POST {base}/images/bulk-delete`.
pub struct HttpRequestSource {
    api_base: String,
    api_token: Option<String>,
    http: HttpClient,
}

impl HttpRequestSource {
    pub fn new(api_base: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        let api_base = api_base.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            bail!("API base URL is empty");
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base,
            api_token: api_token.filter(|value| !value.trim().is_empty()),
            http,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_token.as_deref() {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    fn send(&self, label: &str, builder: RequestBuilder) -> Result<Value> {
        let response = self
            .authorize(builder)
            .send()
            .with_context(|| format!("{label} request failed ({})", self.api_base))?;
        response_json_or_error(label, response)
    }
}

impl RequestSource for HttpRequestSource {
    fn name(&self) -> &str {
        "http"
    }

    fn get_requests(&self, filter: &RequestFilter, cursor: Option<&str>) -> Result<RequestPage> {
        let endpoint = format!("{}/requests", self.api_base);
        let builder = self.http.get(&endpoint).query(&filter.query_pairs(cursor));
        let payload = self.send("getRequests", builder)?;
        serde_json::from_value(payload).context("getRequests returned an unexpected page shape")
    }

    fn create_request(&self, params: &GenerationParams) -> Result<GenerationRequest> {
        let endpoint = format!("{}/requests", self.api_base);
        let builder = self.http.post(&endpoint).json(params);
        let payload = self.send("createRequest", builder)?;
        serde_json::from_value(payload)
            .context("createRequest returned an unexpected request shape")
    }

    fn delete_request(&self, id: u64) -> Result<()> {
        let endpoint = format!("{}/requests/{id}", self.api_base);
        self.send("deleteRequest", self.http.delete(&endpoint))?;
        Ok(())
    }

    fn bulk_delete_images(&self, ids: &[u64]) -> Result<BulkDeleteResult> {
        let endpoint = format!("{}/images/bulk-delete", self.api_base);
        let builder = self.http.post(&endpoint).json(&json!({ "ids": ids }));
        let payload = self.send("bulkDeleteImages", builder)?;
        if payload.is_null() {
            return Ok(BulkDeleteResult::default());
        }
        serde_json::from_value(payload).context("bulkDeleteImages returned an unexpected shape")
    }
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} failed ({code}): {}", truncate_text(&body, 512));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).with_context(|| format!("{label} returned invalid JSON payload"))
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use genfeed_contracts::requests::{RequestFilter, RequestStatus};

    use crate::source::RequestSource;

    use super::{truncate_text, HttpRequestSource};

    /// Serves one canned response and hands back the raw request head.
    fn serve_once(status: &str, body: &str) -> anyhow::Result<(String, thread::JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base = format!("http://{}", listener.local_addr()?);
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return String::new();
            };
            let mut buf = [0u8; 8192];
            let read = stream.read(&mut buf).unwrap_or(0);
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            String::from_utf8_lossy(&buf[..read]).to_string()
        });
        Ok((base, handle))
    }

    #[test]
    fn get_requests_sends_filter_as_query_and_parses_page() -> anyhow::Result<()> {
        let body = r#"{"items":[{"id":3,"status":"Processing","images":[{"id":30,"hash":"h30"}]}],"nextCursor":null}"#;
        let (base, handle) = serve_once("200 OK", body)?;
        let source = HttpRequestSource::new(&base, Some("tok".to_string()), Duration::from_secs(5))?;

        let page = source.get_requests(&RequestFilter::by_ids(vec![3], 100), None)?;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].status, RequestStatus::Processing);
        assert_eq!(page.next_cursor, None);

        let head = handle.join().unwrap_or_default();
        assert!(head.starts_with("GET /requests?requestId=3&take=100&detailed=true"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer tok"));
        Ok(())
    }

    #[test]
    fn non_success_status_becomes_error_with_body() -> anyhow::Result<()> {
        let (base, handle) = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#)?;
        let source = HttpRequestSource::new(&base, None, Duration::from_secs(5))?;

        let err = source.delete_request(9).err().map(|err| format!("{err:#}"));
        let _ = handle.join();
        let message = err.unwrap_or_default();
        assert!(message.contains("deleteRequest failed (500)"));
        assert!(message.contains("boom"));
        Ok(())
    }

    #[test]
    fn empty_base_is_rejected() {
        assert!(HttpRequestSource::new("  ", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn truncate_text_caps_long_bodies() {
        assert_eq!(truncate_text("abcdef", 3), "abc...");
        assert_eq!(truncate_text(" ok ", 3), "ok");
    }
}
