use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use genfeed_contracts::requests::{
    BulkDeleteResult, GeneratedImage, GenerationParams, GenerationRequest, RequestFilter,
    RequestPage, RequestStatus,
};
use serde_json::Value;

const IN_MEMORY_PAGE_SIZE_DEFAULT: usize = 20;

/// Remote side of the feed: paged reads plus the three mutations.
pub trait RequestSource: Send + Sync {
    fn name(&self) -> &str;
    fn get_requests(&self, filter: &RequestFilter, cursor: Option<&str>) -> Result<RequestPage>;
    fn create_request(&self, params: &GenerationParams) -> Result<GenerationRequest>;
    fn delete_request(&self, id: u64) -> Result<()>;
    fn bulk_delete_images(&self, ids: &[u64]) -> Result<BulkDeleteResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOp {
    GetRequests,
    CreateRequest,
    DeleteRequest,
    BulkDeleteImages,
}

#[derive(Debug, Default)]
struct InMemoryState {
    requests: Vec<GenerationRequest>,
    next_request_id: u64,
    next_image_id: u64,
    page_size: usize,
    failures: HashMap<SourceOp, String>,
    get_calls: Vec<(RequestFilter, Option<String>)>,
}

/// Deterministic request store, newest request first. Clones share state, so a test
/// can keep one handle while the engine owns another.
///
/// Cursors are plain offsets into the filtered list.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::with_page_size(IN_MEMORY_PAGE_SIZE_DEFAULT)
    }
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                next_request_id: 1,
                next_image_id: 1,
                page_size: page_size.max(1),
                ..InMemoryState::default()
            })),
        }
    }

    pub fn from_requests(requests: Vec<GenerationRequest>) -> Self {
        let source = Self::default();
        for request in requests.into_iter().rev() {
            source.push_request(request);
        }
        source
    }

    fn lock(&self) -> Result<MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory source lock poisoned"))
    }

    /// Adds a request as the newest entry.
    pub fn push_request(&self, request: GenerationRequest) {
        if let Ok(mut state) = self.lock() {
            state.next_request_id = state.next_request_id.max(request.id + 1);
            let max_image = request.images.iter().filter_map(|image| image.id).max();
            if let Some(max_image) = max_image {
                state.next_image_id = state.next_image_id.max(max_image + 1);
            }
            state.requests.insert(0, request);
        }
    }

    /// Applies `update` to the stored request with `id`. Returns whether it existed.
    pub fn update_request<F>(&self, id: u64, update: F) -> bool
    where
        F: FnOnce(&mut GenerationRequest),
    {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        match state.requests.iter_mut().find(|request| request.id == id) {
            Some(request) => {
                update(request);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, id: u64, status: RequestStatus) -> bool {
        self.update_request(id, |request| request.status = status)
    }

    /// The next call of `op` fails with `message`.
    pub fn fail_next(&self, op: SourceOp, message: impl Into<String>) {
        if let Ok(mut state) = self.lock() {
            state.failures.insert(op, message.into());
        }
    }

    pub fn get_calls(&self) -> Vec<(RequestFilter, Option<String>)> {
        self.lock()
            .map(|state| state.get_calls.clone())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    fn take_failure(state: &mut InMemoryState, op: SourceOp) -> Result<()> {
        if let Some(message) = state.failures.remove(&op) {
            bail!("{message}");
        }
        Ok(())
    }
}

impl RequestSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_requests(&self, filter: &RequestFilter, cursor: Option<&str>) -> Result<RequestPage> {
        let mut state = self.lock()?;
        state
            .get_calls
            .push((filter.clone(), cursor.map(str::to_string)));
        Self::take_failure(&mut state, SourceOp::GetRequests)?;

        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| anyhow!("invalid cursor '{raw}'"))?,
            None => 0,
        };
        let take = filter
            .take
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(state.page_size)
            .max(1);
        let matching: Vec<&GenerationRequest> = state
            .requests
            .iter()
            .filter(|request| filter.matches(request))
            .collect();
        let items: Vec<GenerationRequest> = matching
            .iter()
            .skip(offset)
            .take(take)
            .map(|request| (*request).clone())
            .collect();
        let end = offset + items.len();
        let next_cursor = (end < matching.len()).then(|| end.to_string());
        Ok(RequestPage { items, next_cursor })
    }

    fn create_request(&self, params: &GenerationParams) -> Result<GenerationRequest> {
        let mut state = self.lock()?;
        Self::take_failure(&mut state, SourceOp::CreateRequest)?;

        let quantity = params
            .get("quantity")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .clamp(1, 10);
        let id = state.next_request_id;
        state.next_request_id += 1;
        let mut images = Vec::new();
        for idx in 0..quantity {
            images.push(GeneratedImage::new(None, format!("req{id}-img{idx}")));
        }
        let mut request = GenerationRequest::new(id, RequestStatus::Pending, images);
        request.created_at = Some(Utc::now());
        request.params = params.clone();
        state.requests.insert(0, request.clone());
        Ok(request)
    }

    fn delete_request(&self, id: u64) -> Result<()> {
        let mut state = self.lock()?;
        Self::take_failure(&mut state, SourceOp::DeleteRequest)?;
        let before = state.requests.len();
        state.requests.retain(|request| request.id != id);
        if state.requests.len() == before {
            bail!("request {id} not found");
        }
        Ok(())
    }

    fn bulk_delete_images(&self, ids: &[u64]) -> Result<BulkDeleteResult> {
        let mut state = self.lock()?;
        Self::take_failure(&mut state, SourceOp::BulkDeleteImages)?;
        let mut deleted = 0;
        for request in &mut state.requests {
            let before = request.images.len();
            request
                .images
                .retain(|image| image.id.map_or(true, |id| !ids.contains(&id)));
            deleted += (before - request.images.len()) as u64;
        }
        state.requests.retain(|request| !request.images.is_empty());
        Ok(BulkDeleteResult { deleted })
    }
}

#[cfg(test)]
mod tests {
    use genfeed_contracts::requests::{
        GeneratedImage, GenerationParams, GenerationRequest, RequestFilter, RequestStatus,
    };
    use serde_json::json;

    use super::{InMemorySource, RequestSource, SourceOp};

    #[test]
    fn pages_use_offset_cursors_and_filters() -> anyhow::Result<()> {
        let source = InMemorySource::with_page_size(2);
        for id in 1..=5 {
            let status = if id % 2 == 0 {
                RequestStatus::Succeeded
            } else {
                RequestStatus::Pending
            };
            source.push_request(GenerationRequest::new(
                id,
                status,
                vec![GeneratedImage::new(Some(id), format!("h{id}"))],
            ));
        }

        let first = source.get_requests(&RequestFilter::default(), None)?;
        assert_eq!(
            first.items.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![5, 4]
        );
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let pending = RequestFilter::by_statuses(&[RequestStatus::Pending], 10);
        let page = source.get_requests(&pending, None)?;
        assert_eq!(
            page.items.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![5, 3, 1]
        );
        assert_eq!(page.next_cursor, None);
        assert_eq!(source.get_calls().len(), 2);
        Ok(())
    }

    #[test]
    fn create_assigns_ids_and_hashes() -> anyhow::Result<()> {
        let source = InMemorySource::new();
        source.push_request(GenerationRequest::new(41, RequestStatus::Succeeded, Vec::new()));
        let mut params = GenerationParams::new();
        params.insert("prompt".to_string(), json!("a boat"));
        params.insert("quantity".to_string(), json!(2));

        let created = source.create_request(&params)?;
        assert_eq!(created.id, 42);
        assert_eq!(created.status, RequestStatus::Pending);
        assert_eq!(created.images.len(), 2);
        assert_eq!(created.images[1].hash, "req42-img1");
        assert!(created.images.iter().all(|image| image.id.is_none()));
        assert_eq!(created.params["prompt"], json!("a boat"));
        assert_eq!(source.requests()[0].id, 42);
        Ok(())
    }

    #[test]
    fn injected_failure_applies_once() {
        let source = InMemorySource::new();
        source.fail_next(SourceOp::DeleteRequest, "backend unavailable");
        source.push_request(GenerationRequest::new(1, RequestStatus::Pending, Vec::new()));

        let err = source.delete_request(1).err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("backend unavailable"));
        assert!(source.delete_request(1).is_ok());
        assert!(source.delete_request(1).is_err());
    }

    #[test]
    fn bulk_delete_drops_emptied_requests() -> anyhow::Result<()> {
        let source = InMemorySource::new();
        source.push_request(GenerationRequest::new(
            1,
            RequestStatus::Succeeded,
            vec![
                GeneratedImage::new(Some(10), "a"),
                GeneratedImage::new(Some(11), "b"),
            ],
        ));
        source.push_request(GenerationRequest::new(
            2,
            RequestStatus::Succeeded,
            vec![GeneratedImage::new(Some(20), "c")],
        ));

        let result = source.bulk_delete_images(&[11, 20])?;
        assert_eq!(result.deleted, 2);
        let remaining = source.requests();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].images.len(), 1);
        Ok(())
    }
}
