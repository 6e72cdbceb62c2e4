use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use genfeed_contracts::events::EventLog;
use genfeed_contracts::requests::{
    BulkDeleteResult, GenerationParams, GenerationRequest, RequestFilter, RequestPage,
};
use genfeed_contracts::signals::SignalEvent;
use genfeed_contracts::snapshot::FeedSnapshot;
use serde_json::{json, Map, Value};

pub mod cache;
pub mod config;
pub mod http;
pub mod notify;
pub mod poller;
pub mod reconcile;
pub mod source;

pub use cache::{FeedCache, FeedView, InsertOutcome, PagedQuery, PollMerge};
pub use config::FeedConfig;
pub use http::HttpRequestSource;
pub use notify::{Notification, Notifier, RecordingNotifier, StderrNotifier};
pub use poller::{Debouncer, PollScope, PollWorker, Poller};
pub use reconcile::{reconcile_signal, SignalBuffer, SignalOutcome};
pub use source::{InMemorySource, RequestSource, SourceOp};

/// One writer at a time: everything that mutates the feed goes through this lock.
pub type SharedFeed = Arc<Mutex<FeedEngine>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Merged(PollMerge),
    Failed(String),
    /// The poll was cancelled while its fetch was out; the response was dropped.
    Cancelled,
}

/// A due poll fetch, taken out of the engine so it can run without the feed lock.
pub struct PollTicket {
    filter: RequestFilter,
    source: Arc<dyn RequestSource>,
}

impl PollTicket {
    pub fn filter(&self) -> &RequestFilter {
        &self.filter
    }

    pub fn fetch(&self) -> Result<RequestPage> {
        self.source.get_requests(&self.filter, None)
    }
}

/// Owned store for the request feed: cache, unmatched-signal buffer and poller,
/// wired to a remote source, a notification surface and the event log.
pub struct FeedEngine {
    config: FeedConfig,
    source: Arc<dyn RequestSource>,
    notifier: Box<dyn Notifier>,
    events: EventLog,
    cache: FeedCache,
    signals: SignalBuffer,
    poller: Poller,
    poll_global: bool,
}

impl FeedEngine {
    pub fn new(
        source: Box<dyn RequestSource>,
        notifier: Box<dyn Notifier>,
        events: EventLog,
        config: FeedConfig,
    ) -> Self {
        events.note(
            "session_started",
            map_object(json!({
                "source": source.name(),
                "poll_debounce_ms": u64::try_from(config.poll_debounce.as_millis()).unwrap_or(u64::MAX),
                "poll_page_size": config.poll_page_size,
                "signal_buffer_limit": config.signal_buffer_limit,
            })),
        );
        Self {
            signals: SignalBuffer::new(config.signal_buffer_limit),
            poller: Poller::new(config.poll_debounce, config.poll_page_size),
            cache: FeedCache::new(),
            poll_global: false,
            config,
            source: Arc::from(source),
            notifier,
            events,
        }
    }

    pub fn into_shared(self) -> SharedFeed {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    pub fn signals(&self) -> &SignalBuffer {
        &self.signals
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Number of requests currently pending or processing.
    pub fn in_progress(&self) -> usize {
        self.poller.in_progress()
    }

    /// Loads the next page for `filter`, then re-observes the poll set.
    pub fn fetch_page(&mut self, filter: &RequestFilter, now: Instant) -> Result<FeedView<'_>> {
        let loaded = {
            let view = self.cache.fetch_page(self.source.as_ref(), filter)?;
            view.requests.len()
        };
        self.events.note(
            "page_fetched",
            map_object(json!({
                "filter": filter.cache_key(),
                "loaded": loaded,
            })),
        );
        self.observe(now);
        let Some(query) = self.cache.query_mut(filter) else {
            return Ok(FeedView {
                requests: &[],
                images: &[],
            });
        };
        Ok(query.flattened())
    }

    /// Warms the default variant from a saved snapshot.
    pub fn restore(&mut self, snapshot: &FeedSnapshot, now: Instant) {
        self.cache.seed(
            &RequestFilter::default(),
            vec![RequestPage {
                items: snapshot.requests.clone(),
                next_cursor: snapshot.next_cursor.clone(),
            }],
        );
        self.events.note(
            "snapshot_restored",
            map_object(json!({
                "requests": snapshot.requests.len(),
                "saved_at": snapshot.saved_at,
            })),
        );
        self.observe(now);
    }

    /// Re-derives the pollable set from the cache. Returns the in-progress count.
    pub fn observe(&mut self, now: Instant) -> usize {
        let requests = self.cache.requests();
        let before = self.poller.deadline();
        let count = if self.poll_global {
            self.poller.observe_global(&requests, now)
        } else {
            self.poller.observe(Some(requests.as_slice()), now)
        };
        self.note_schedule(before);
        count
    }

    /// Switches polling to the server-side status filter instead of the cached id
    /// list. Stays in effect for the engine's lifetime.
    pub fn observe_global(&mut self, now: Instant) -> usize {
        self.poll_global = true;
        self.observe(now)
    }

    fn note_schedule(&self, before: Option<Instant>) {
        let after = self.poller.deadline();
        if after.is_some() && after != before {
            self.events.note(
                "poll_scheduled",
                map_object(json!({
                    "in_progress": self.poller.in_progress(),
                    "delay_ms": u64::try_from(self.config.poll_debounce.as_millis()).unwrap_or(u64::MAX),
                })),
            );
        }
    }

    pub fn next_poll_at(&self) -> Option<Instant> {
        self.poller.deadline()
    }

    pub fn cancel_poll(&mut self) {
        self.poller.cancel();
    }

    /// Hands out the poll fetch if its debounce elapsed. The caller runs it and
    /// reports back through [`FeedEngine::finish_poll`].
    pub fn begin_poll(&mut self, now: Instant) -> Option<PollTicket> {
        let filter = self.poller.due(now)?;
        Some(PollTicket {
            filter,
            source: Arc::clone(&self.source),
        })
    }

    /// Merges a finished poll fetch. Failures are absorbed here: they are logged and
    /// retried after the same debounce.
    pub fn finish_poll(
        &mut self,
        ticket: PollTicket,
        fetched: Result<RequestPage>,
        now: Instant,
    ) -> PollOutcome {
        let filter = ticket.filter;
        match fetched {
            Ok(page) => {
                if !self.poller.finish(now, true) {
                    return PollOutcome::Cancelled;
                }
                let merge = self.cache.apply_poll_response(&page);
                self.poller.record_global_response(page.items.len());
                self.events.note(
                    "poll_fetched",
                    map_object(json!({
                        "requested": filter.request_ids,
                        "statuses": filter.statuses.iter().map(|status| status.as_str()).collect::<Vec<_>>(),
                        "returned": page.items.len(),
                        "merged": merge.merged,
                        "dropped": merge.dropped,
                    })),
                );
                self.observe(now);
                PollOutcome::Merged(merge)
            }
            Err(err) => {
                if !self.poller.finish(now, false) {
                    return PollOutcome::Cancelled;
                }
                let message = format!("{err:#}");
                self.events.note(
                    "poll_failed",
                    map_object(json!({ "error": message })),
                );
                PollOutcome::Failed(message)
            }
        }
    }

    /// Runs a due poll inline: fetch and merge in one call.
    pub fn poll_due(&mut self, now: Instant) -> PollOutcome {
        let Some(ticket) = self.begin_poll(now) else {
            return PollOutcome::Idle;
        };
        let fetched = ticket.fetch();
        self.finish_poll(ticket, fetched, now)
    }

    /// Applies a realtime status push, buffering it if the image is not cached.
    pub fn apply_signal(&mut self, event: &SignalEvent) -> SignalOutcome {
        let outcome = reconcile_signal(&mut self.cache, &mut self.signals, event);
        let mut payload = map_object(json!({
            "image_hash": event.image_hash,
            "status": event.status.as_str(),
        }));
        match &outcome {
            SignalOutcome::Applied => self.events.note("signal_applied", payload),
            SignalOutcome::Buffered { evicted } => {
                payload.insert("buffered".to_string(), json!(self.signals.len()));
                self.events.note("signal_buffered", payload);
                if let Some(hash) = evicted {
                    self.events.note(
                        "signal_evicted",
                        map_object(json!({ "image_hash": hash })),
                    );
                }
            }
        }
        outcome
    }

    pub fn create_request(
        &mut self,
        params: &GenerationParams,
        now: Instant,
    ) -> Result<GenerationRequest> {
        let created = match self.source.create_request(params) {
            Ok(created) => created,
            Err(err) => return Err(self.report_failure("Failed to create request", err)),
        };
        let inserted = self.cache.insert_new(created, &mut self.signals);
        self.events.note(
            "request_inserted",
            map_object(json!({
                "request_id": inserted.request.id,
                "images": inserted.request.images.len(),
                "applied_signals": inserted.applied,
                "variants": inserted.variants,
            })),
        );
        self.observe(now);
        Ok(self
            .cache
            .request(inserted.request.id)
            .cloned()
            .unwrap_or(inserted.request))
    }

    pub fn delete_request(&mut self, id: u64, now: Instant) -> Result<()> {
        if let Err(err) = self.source.delete_request(id) {
            return Err(self.report_failure("Failed to delete request", err));
        }
        let removed = self.cache.remove_request(id);
        self.events.note(
            "request_removed",
            map_object(json!({ "request_id": id, "was_cached": removed })),
        );
        self.observe(now);
        Ok(())
    }

    pub fn bulk_delete_images(&mut self, ids: &[u64], now: Instant) -> Result<BulkDeleteResult> {
        let result = match self.source.bulk_delete_images(ids) {
            Ok(result) => result,
            Err(err) => return Err(self.report_failure("Failed to delete images", err)),
        };
        let pruned = self.cache.remove_images(ids);
        self.events.note(
            "images_removed",
            map_object(json!({
                "image_ids": ids,
                "deleted": result.deleted,
                "pruned_requests": pruned,
            })),
        );
        self.observe(now);
        Ok(result)
    }

    fn report_failure(&self, title: &str, err: anyhow::Error) -> anyhow::Error {
        let message = format!("{err:#}");
        self.notifier.notify_error(title, &message);
        self.events.note(
            "mutation_failed",
            map_object(json!({ "title": title, "error": message })),
        );
        err.context(title.to_string())
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
