use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type GenerationParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub const POLLABLE: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Processing];

    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "Pending",
            RequestStatus::Processing => "Processing",
            RequestStatus::Succeeded => "Succeeded",
            RequestStatus::Failed => "Failed",
            RequestStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "succeeded" => Some(RequestStatus::Succeeded),
            "failed" => Some(RequestStatus::Failed),
            "cancelled" | "canceled" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }
}

/// Per-image generation state.
///
/// `Pending -> Processing -> {Success, Failed, RemovedForSafety, Cancelled}`; the four
/// right-hand states are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
    RemovedForSafety,
    Cancelled,
}

impl ImageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ImageStatus::Pending | ImageStatus::Processing)
    }

    /// Success and a safety block both resolve the image, so both mark it available.
    pub fn marks_available(self) -> bool {
        matches!(self, ImageStatus::Success | ImageStatus::RemovedForSafety)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Pending => "Pending",
            ImageStatus::Processing => "Processing",
            ImageStatus::Success => "Success",
            ImageStatus::Failed => "Failed",
            ImageStatus::RemovedForSafety => "RemovedForSafety",
            ImageStatus::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    #[serde(default)]
    pub id: Option<u64>,
    pub hash: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub removed_for_safety: bool,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl GeneratedImage {
    pub fn new(id: Option<u64>, hash: impl Into<String>) -> Self {
        Self {
            id,
            hash: hash.into(),
            url: None,
            status: ImageStatus::Pending,
            available: false,
            removed_for_safety: false,
            seed: None,
            width: None,
            height: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub id: u64,
    pub status: RequestStatus,
    #[serde(default)]
    pub estimated_completion_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue_position: Option<u64>,
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(id: u64, status: RequestStatus, images: Vec<GeneratedImage>) -> Self {
        Self {
            id,
            status,
            estimated_completion_date: None,
            queue_position: None,
            images,
            created_at: None,
            params: Map::new(),
        }
    }

    pub fn is_pollable(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn image_by_hash(&self, hash: &str) -> Option<&GeneratedImage> {
        self.images.iter().find(|image| image.hash == hash)
    }
}

/// Logical query over the request feed.
///
/// Two filters that differ only in id/status ordering address the same cache variant;
/// see [`RequestFilter::cache_key`]. The page cursor is never part of the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    #[serde(default)]
    pub request_ids: Vec<u64>,
    #[serde(default)]
    pub statuses: Vec<RequestStatus>,
    #[serde(default)]
    pub take: Option<u32>,
    #[serde(default)]
    pub detailed: bool,
}

impl RequestFilter {
    pub fn by_ids(ids: Vec<u64>, take: u32) -> Self {
        Self {
            request_ids: ids,
            statuses: Vec::new(),
            take: Some(take),
            detailed: true,
        }
    }

    pub fn by_statuses(statuses: &[RequestStatus], take: u32) -> Self {
        Self {
            request_ids: Vec::new(),
            statuses: statuses.to_vec(),
            take: Some(take),
            detailed: true,
        }
    }

    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.request_ids.sort_unstable();
        out.request_ids.dedup();
        out.statuses.sort();
        out.statuses.dedup();
        out
    }

    pub fn cache_key(&self) -> String {
        serde_json::to_string(&self.normalized()).unwrap_or_default()
    }

    pub fn matches(&self, request: &GenerationRequest) -> bool {
        (self.request_ids.is_empty() || self.request_ids.contains(&request.id))
            && (self.statuses.is_empty() || self.statuses.contains(&request.status))
    }

    /// Query-string pairs for a paged GET, in a stable order.
    pub fn query_pairs(&self, cursor: Option<&str>) -> Vec<(String, String)> {
        let normalized = self.normalized();
        let mut pairs = Vec::new();
        for id in &normalized.request_ids {
            pairs.push(("requestId".to_string(), id.to_string()));
        }
        for status in &normalized.statuses {
            pairs.push(("status".to_string(), status.as_str().to_string()));
        }
        if let Some(take) = normalized.take {
            pairs.push(("take".to_string(), take.to_string()));
        }
        if normalized.detailed {
            pairs.push(("detailed".to_string(), "true".to_string()));
        }
        if let Some(cursor) = cursor {
            pairs.push(("cursor".to_string(), cursor.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPage {
    #[serde(default)]
    pub items: Vec<GenerationRequest>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkDeleteResult {
    #[serde(default)]
    pub deleted: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        GeneratedImage, GenerationRequest, ImageStatus, RequestFilter, RequestPage,
        RequestStatus,
    };

    #[test]
    fn terminal_statuses_exclude_pending_and_processing() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Processing.is_terminal());
        assert!(RequestStatus::Succeeded.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());

        assert!(!ImageStatus::Processing.is_terminal());
        assert!(ImageStatus::RemovedForSafety.is_terminal());
        assert!(ImageStatus::RemovedForSafety.marks_available());
        assert!(!ImageStatus::Failed.marks_available());
    }

    #[test]
    fn request_deserializes_camel_case_wire_shape() -> anyhow::Result<()> {
        let raw = json!({
            "id": 7,
            "status": "Processing",
            "estimatedCompletionDate": "2026-02-19T00:10:00Z",
            "queuePosition": 3,
            "images": [{"id": 1, "hash": "a", "removedForSafety": false}],
        });
        let request: GenerationRequest = serde_json::from_value(raw)?;
        assert_eq!(request.id, 7);
        assert_eq!(request.status, RequestStatus::Processing);
        assert_eq!(request.queue_position, Some(3));
        assert!(request.estimated_completion_date.is_some());
        assert_eq!(request.images[0].status, ImageStatus::Pending);
        assert!(!request.images[0].available);
        assert_eq!(
            request.image_by_hash("a").and_then(|image| image.id),
            Some(1)
        );
        Ok(())
    }

    #[test]
    fn page_serializes_next_cursor_in_camel_case() -> anyhow::Result<()> {
        let page = RequestPage {
            items: vec![GenerationRequest::new(
                1,
                RequestStatus::Pending,
                vec![GeneratedImage::new(None, "h")],
            )],
            next_cursor: Some("c2".to_string()),
        };
        let value = serde_json::to_value(&page)?;
        assert_eq!(value["nextCursor"], Value::String("c2".to_string()));
        assert_eq!(value["items"][0]["images"][0]["hash"], json!("h"));
        Ok(())
    }

    #[test]
    fn cache_key_ignores_id_and_status_order() {
        let a = RequestFilter {
            request_ids: vec![3, 1, 2, 1],
            statuses: vec![RequestStatus::Processing, RequestStatus::Pending],
            take: Some(100),
            detailed: true,
        };
        let b = RequestFilter {
            request_ids: vec![1, 2, 3],
            statuses: vec![RequestStatus::Pending, RequestStatus::Processing],
            take: Some(100),
            detailed: true,
        };
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), RequestFilter::default().cache_key());
    }

    #[test]
    fn query_pairs_repeat_ids_and_append_cursor() {
        let filter = RequestFilter::by_ids(vec![9, 4], 50);
        let pairs = filter.query_pairs(Some("next"));
        let rendered: Vec<String> = pairs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "requestId=4",
                "requestId=9",
                "take=50",
                "detailed=true",
                "cursor=next"
            ]
        );
    }

    #[test]
    fn status_parse_accepts_either_cancel_spelling() {
        assert_eq!(
            RequestStatus::parse(" canceled "),
            Some(RequestStatus::Cancelled)
        );
        assert_eq!(
            RequestStatus::parse("Processing"),
            Some(RequestStatus::Processing)
        );
        assert_eq!(RequestStatus::parse("queued"), None);
    }

    #[test]
    fn filter_matches_on_ids_and_statuses() {
        let request = GenerationRequest::new(5, RequestStatus::Failed, Vec::new());
        assert!(RequestFilter::default().matches(&request));
        assert!(!RequestFilter::by_statuses(&RequestStatus::POLLABLE, 10).matches(&request));
        assert!(RequestFilter::by_ids(vec![5], 10).matches(&request));
    }
}
