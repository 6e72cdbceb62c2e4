use std::collections::HashSet;

use anyhow::Result;
use genfeed_contracts::patch::{apply_image_patch, apply_request_patch, ImagePatch, RequestPatch};
use genfeed_contracts::requests::{GeneratedImage, GenerationRequest, RequestFilter, RequestPage};
use indexmap::IndexMap;

use crate::reconcile::SignalBuffer;
use crate::source::RequestSource;

/// Borrowed, flattened view over one cached query variant.
#[derive(Debug, Clone, Copy)]
pub struct FeedView<'a> {
    pub requests: &'a [GenerationRequest],
    pub images: &'a [GeneratedImage],
}

#[derive(Debug, Clone)]
struct Flattened {
    revision: u64,
    requests: Vec<GenerationRequest>,
    images: Vec<GeneratedImage>,
}

/// All pages fetched so far for one filter.
#[derive(Debug, Clone)]
pub struct PagedQuery {
    filter: RequestFilter,
    pages: Vec<RequestPage>,
    next_cursor: Option<String>,
    exhausted: bool,
    revision: u64,
    flattened: Option<Flattened>,
    flatten_runs: u64,
}

impl PagedQuery {
    pub fn new(filter: RequestFilter) -> Self {
        Self {
            filter,
            pages: Vec::new(),
            next_cursor: None,
            exhausted: false,
            revision: 0,
            flattened: None,
            flatten_runs: 0,
        }
    }

    pub fn filter(&self) -> &RequestFilter {
        &self.filter
    }

    pub fn pages(&self) -> &[RequestPage] {
        &self.pages
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// How many times the flattened lists were rebuilt.
    pub fn flatten_runs(&self) -> u64 {
        self.flatten_runs
    }

    pub fn contains_request(&self, id: u64) -> bool {
        self.requests().any(|request| request.id == id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &GenerationRequest> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn flattened(&mut self) -> FeedView<'_> {
        let stale = self
            .flattened
            .as_ref()
            .map(|flat| flat.revision != self.revision)
            .unwrap_or(true);
        if stale {
            let requests: Vec<GenerationRequest> = self.requests().cloned().collect();
            let images = requests
                .iter()
                .flat_map(|request| request.images.iter().cloned())
                .collect();
            self.flattened = Some(Flattened {
                revision: self.revision,
                requests,
                images,
            });
            self.flatten_runs += 1;
        }
        match self.flattened.as_ref() {
            Some(flat) => FeedView {
                requests: &flat.requests,
                images: &flat.images,
            },
            None => FeedView {
                requests: &[],
                images: &[],
            },
        }
    }

    fn append_page(&mut self, mut page: RequestPage) {
        let known: HashSet<u64> = self.requests().map(|request| request.id).collect();
        page.items.retain(|request| !known.contains(&request.id));
        self.next_cursor = page.next_cursor.clone();
        self.exhausted = page.next_cursor.is_none();
        self.pages.push(page);
        self.touch();
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

/// Outcome of merging one poll response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollMerge {
    pub merged: Vec<u64>,
    pub dropped: Vec<u64>,
}

/// Result of [`FeedCache::insert_new`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    /// The created request with any buffered statuses applied.
    pub request: GenerationRequest,
    /// Hashes whose buffered signal was drained.
    pub applied: Vec<String>,
    /// Variants the request was prepended to.
    pub variants: usize,
}

/// Client-side view of the request feed, one [`PagedQuery`] per filter variant.
///
/// Every mutation walks all variants in place and never fails; a missing target is a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct FeedCache {
    queries: IndexMap<String, PagedQuery>,
}

impl FeedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variant_count(&self) -> usize {
        self.queries.len()
    }

    pub fn query(&self, filter: &RequestFilter) -> Option<&PagedQuery> {
        self.queries.get(&filter.cache_key())
    }

    pub fn query_mut(&mut self, filter: &RequestFilter) -> Option<&mut PagedQuery> {
        self.queries.get_mut(&filter.cache_key())
    }

    pub fn clear(&mut self) {
        self.queries.clear();
    }

    /// Loads the next page for `filter` and returns everything loaded so far.
    ///
    /// An exhausted variant is returned as-is without touching the source.
    pub fn fetch_page(
        &mut self,
        source: &dyn RequestSource,
        filter: &RequestFilter,
    ) -> Result<FeedView<'_>> {
        let query = self
            .queries
            .entry(filter.cache_key())
            .or_insert_with(|| PagedQuery::new(filter.normalized()));
        if query.has_more() {
            let page = source.get_requests(filter, query.next_cursor())?;
            query.append_page(page);
        }
        Ok(query.flattened())
    }

    /// Installs already-known pages for `filter`, replacing what was cached for it.
    pub fn seed(&mut self, filter: &RequestFilter, pages: Vec<RequestPage>) {
        let mut query = PagedQuery::new(filter.normalized());
        for page in pages {
            query.append_page(page);
        }
        self.queries.insert(filter.cache_key(), query);
    }

    /// Runs `updater` over the pages of every variant. The updater reports whether it
    /// changed anything; only those variants get a new revision. Returns how many did.
    pub fn mutate<F>(&mut self, mut updater: F) -> usize
    where
        F: FnMut(&mut Vec<RequestPage>) -> bool,
    {
        let mut touched = 0;
        for query in self.queries.values_mut() {
            if updater(&mut query.pages) {
                query.touch();
                touched += 1;
            }
        }
        touched
    }

    /// Prepends a freshly created request to the first page of every variant whose
    /// filter admits it and that does not hold it yet.
    ///
    /// Buffered signals for its images are always drained: each one is applied to the
    /// new request and to any copy of the image that is already cached.
    pub fn insert_new(
        &mut self,
        mut request: GenerationRequest,
        buffer: &mut SignalBuffer,
    ) -> InsertOutcome {
        let mut applied = Vec::new();
        for image in &mut request.images {
            if let Some(event) = buffer.take(&image.hash) {
                let patch = event.to_patch();
                apply_image_patch(image, &patch);
                self.patch_image_by_hash(&patch);
                applied.push(event.image_hash);
            }
        }

        let targets: Vec<String> = self
            .queries
            .iter()
            .filter(|(_, query)| query.filter().matches(&request))
            .filter(|(_, query)| !query.contains_request(request.id))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &targets {
            if let Some(query) = self.queries.get_mut(key) {
                match query.pages.first_mut() {
                    Some(page) => page.items.insert(0, request.clone()),
                    None => query.pages.push(RequestPage {
                        items: vec![request.clone()],
                        next_cursor: None,
                    }),
                }
                query.touch();
            }
        }
        InsertOutcome {
            request,
            applied,
            variants: targets.len(),
        }
    }

    pub fn remove_request(&mut self, id: u64) -> bool {
        self.mutate(|pages| {
            for page in pages.iter_mut() {
                if let Some(index) = page.items.iter().position(|request| request.id == id) {
                    page.items.remove(index);
                    return true;
                }
            }
            false
        }) > 0
    }

    /// Removes images by id everywhere and prunes requests left without images.
    /// Returns the ids of pruned requests (deduplicated across variants).
    pub fn remove_images(&mut self, ids: &[u64]) -> Vec<u64> {
        let doomed: HashSet<u64> = ids.iter().copied().collect();
        let mut pruned: Vec<u64> = Vec::new();
        self.mutate(|pages| {
            let mut changed = false;
            for page in pages.iter_mut() {
                for request in page.items.iter_mut() {
                    let before = request.images.len();
                    request
                        .images
                        .retain(|image| image.id.map_or(true, |id| !doomed.contains(&id)));
                    if request.images.len() != before {
                        changed = true;
                        if request.images.is_empty() && !pruned.contains(&request.id) {
                            pruned.push(request.id);
                        }
                    }
                }
                let before = page.items.len();
                page.items.retain(|request| !request.images.is_empty());
                changed |= page.items.len() != before;
            }
            changed
        });
        pruned
    }

    /// Merges a poll response field by field into every cached copy of each request.
    pub fn apply_poll_response(&mut self, page: &RequestPage) -> PollMerge {
        let mut report = PollMerge::default();
        for polled in &page.items {
            let patch = RequestPatch::from_polled(polled);
            if self.apply_request_patch(&patch) {
                report.merged.push(polled.id);
            } else if !self.contains_request(polled.id) {
                report.dropped.push(polled.id);
            }
        }
        report
    }

    /// Returns whether any copy changed.
    pub fn apply_request_patch(&mut self, patch: &RequestPatch) -> bool {
        self.mutate(|pages| {
            let mut changed = false;
            for request in pages.iter_mut().flat_map(|page| page.items.iter_mut()) {
                if request.id == patch.id {
                    changed |= apply_request_patch(request, patch);
                }
            }
            changed
        }) > 0
    }

    /// Patches the first image with a matching hash in each variant.
    /// Returns `false` when no variant holds the hash.
    pub fn patch_image_by_hash(&mut self, patch: &ImagePatch) -> bool {
        if !self.contains_hash(&patch.hash) {
            return false;
        }
        self.mutate(|pages| {
            let target = pages
                .iter_mut()
                .flat_map(|page| page.items.iter_mut())
                .flat_map(|request| request.images.iter_mut())
                .find(|image| image.hash == patch.hash);
            match target {
                Some(image) => apply_image_patch(image, patch),
                None => false,
            }
        });
        true
    }

    pub fn contains_request(&self, id: u64) -> bool {
        self.queries.values().any(|query| query.contains_request(id))
    }

    pub fn contains_hash(&self, hash: &str) -> bool {
        self.queries
            .values()
            .flat_map(|query| query.requests())
            .any(|request| request.image_by_hash(hash).is_some())
    }

    /// Union of every variant, first occurrence of each id wins.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        let mut seen = HashSet::new();
        self.queries
            .values()
            .flat_map(|query| query.requests())
            .filter(|request| seen.insert(request.id))
            .cloned()
            .collect()
    }

    pub fn request(&self, id: u64) -> Option<&GenerationRequest> {
        self.queries
            .values()
            .flat_map(|query| query.requests())
            .find(|request| request.id == id)
    }

    pub fn images(&self) -> Vec<GeneratedImage> {
        self.requests()
            .into_iter()
            .flat_map(|request| request.images)
            .collect()
    }

    pub fn image_by_hash(&self, hash: &str) -> Option<&GeneratedImage> {
        self.queries
            .values()
            .flat_map(|query| query.requests())
            .find_map(|request| request.image_by_hash(hash))
    }

    pub fn non_terminal_requests(&self) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(GenerationRequest::is_pollable)
            .collect()
    }
}
