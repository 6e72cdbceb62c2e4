use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use genfeed_contracts::requests::{GenerationRequest, RequestFilter, RequestStatus};

use crate::SharedFeed;

const WORKER_TICK: Duration = Duration::from_millis(200);

/// What a poll fetch is narrowed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollScope {
    Ids(Vec<u64>),
    /// Server-side status filter, used when the caller supplies no request list.
    Statuses(Vec<RequestStatus>),
}

impl PollScope {
    /// `None` means nothing to poll: a list was supplied and all of it is terminal.
    pub fn from_requests(requests: Option<&[GenerationRequest]>) -> Option<Self> {
        let Some(requests) = requests else {
            return Some(PollScope::Statuses(RequestStatus::POLLABLE.to_vec()));
        };
        let ids = pollable_ids(requests);
        if ids.is_empty() {
            return None;
        }
        Some(PollScope::Ids(ids.into_iter().collect()))
    }

    pub fn to_filter(&self, take: u32) -> RequestFilter {
        match self {
            PollScope::Ids(ids) => RequestFilter::by_ids(ids.clone(), take),
            PollScope::Statuses(statuses) => RequestFilter::by_statuses(statuses, take),
        }
    }
}

pub fn pollable_ids(requests: &[GenerationRequest]) -> BTreeSet<u64> {
    requests
        .iter()
        .filter(|request| request.is_pollable())
        .map(|request| request.id)
        .collect()
}

/// Single cancellable deadline. Arming again replaces the pending one.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn arm(&mut self, now: Instant) -> Instant {
        let deadline = now + self.delay;
        self.deadline = Some(deadline);
        deadline
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears and returns `true` once the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PollKey {
    Ids(BTreeSet<u64>),
    Global,
}

/// Decides when, and for which requests, the next poll fetch happens.
///
/// The poller never talks to the network itself; [`crate::FeedEngine::begin_poll`]
/// asks it for a filter and reports back with [`Poller::finish`].
#[derive(Debug, Clone)]
pub struct Poller {
    debouncer: Debouncer,
    page_size: u32,
    key: Option<PollKey>,
    scope: Option<PollScope>,
    in_progress: usize,
    in_flight: bool,
    reported: Option<usize>,
    fetches: u64,
}

impl Poller {
    pub fn new(delay: Duration, page_size: u32) -> Self {
        Self {
            debouncer: Debouncer::new(delay),
            page_size,
            key: None,
            scope: None,
            in_progress: 0,
            in_flight: false,
            reported: None,
            fetches: 0,
        }
    }

    /// Feeds the current request list. Re-arms the debounce when the set of pollable
    /// ids changed and cancels it when nothing is left to poll.
    ///
    /// Returns the number of requests still in progress.
    pub fn observe(&mut self, requests: Option<&[GenerationRequest]>, now: Instant) -> usize {
        let key = match requests {
            Some(list) => PollKey::Ids(pollable_ids(list)),
            None => PollKey::Global,
        };
        self.in_progress = match &key {
            PollKey::Ids(ids) => ids.len(),
            PollKey::Global => self.in_progress,
        };
        self.scope = PollScope::from_requests(requests);

        if self.key.as_ref() != Some(&key) {
            self.key = Some(key);
            if self.scope.is_some() {
                self.debouncer.arm(now);
            } else {
                self.debouncer.cancel();
            }
        }
        self.in_progress
    }

    /// Polls by status regardless of the cached list. Finished requests drop out of
    /// a status-filtered response, so once a response arrived its size is the
    /// in-progress count; `cached` only counts until then.
    pub fn observe_global(&mut self, cached: &[GenerationRequest], now: Instant) -> usize {
        self.in_progress = self
            .reported
            .unwrap_or_else(|| pollable_ids(cached).len());
        self.observe(None, now)
    }

    /// Records how many requests a status-scoped poll returned.
    pub fn record_global_response(&mut self, returned: usize) {
        if self.key == Some(PollKey::Global) {
            self.reported = Some(returned);
        }
    }

    /// Hands out the filter for a fetch whose debounce has elapsed.
    pub fn due(&mut self, now: Instant) -> Option<RequestFilter> {
        let scope = self.scope.as_ref()?;
        if !self.debouncer.fire_if_due(now) {
            return None;
        }
        self.fetches += 1;
        self.in_flight = true;
        Some(scope.to_filter(self.page_size))
    }

    /// Reports the end of a fetch. Failures retry after the same debounce; a success
    /// keeps polling while anything is still in progress.
    ///
    /// Returns `false` when the poll was cancelled while the fetch was out; its
    /// response should then be discarded.
    pub fn finish(&mut self, now: Instant, succeeded: bool) -> bool {
        if !std::mem::take(&mut self.in_flight) {
            return false;
        }
        if !succeeded || self.scope.is_some() {
            self.debouncer.arm(now);
        }
        true
    }

    pub fn cancel(&mut self) {
        self.debouncer.cancel();
        self.key = None;
        self.in_flight = false;
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress
    }

    pub fn scope(&self) -> Option<&PollScope> {
        self.scope.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn fetches(&self) -> u64 {
        self.fetches
    }
}

enum PollCommand {
    Wake,
    Stop,
}

/// Background thread that fires due polls for a shared feed.
///
/// The feed lock is released while a fetch is out, so signals and mutations keep
/// flowing. Stopping (or dropping) the worker joins it and cancels any pending poll.
pub struct PollWorker {
    feed: SharedFeed,
    sender: Option<mpsc::Sender<PollCommand>>,
    handle: Option<thread::JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl PollWorker {
    pub fn spawn(feed: SharedFeed) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker_feed = Arc::clone(&feed);
        let worker_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("genfeed-poller".to_string())
            .spawn(move || run_worker(worker_feed, rx, worker_stop))?;
        Ok(Self {
            feed,
            sender: Some(tx),
            handle: Some(handle),
            stop_flag,
        })
    }

    /// Nudges the worker to check for a due poll without waiting for its next tick.
    pub fn wake(&self) {
        if let Some(tx) = self.sender.as_ref() {
            let _ = tx.send(PollCommand::Wake);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(PollCommand::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Ok(mut feed) = self.feed.lock() {
            feed.cancel_poll();
        }
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(feed: SharedFeed, rx: mpsc::Receiver<PollCommand>, stop_flag: Arc<AtomicBool>) {
    while !stop_flag.load(Ordering::SeqCst) {
        match rx.recv_timeout(WORKER_TICK) {
            Ok(PollCommand::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(PollCommand::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let ticket = match feed.lock() {
            Ok(mut guard) => guard.begin_poll(Instant::now()),
            Err(_) => break,
        };
        let Some(ticket) = ticket else {
            continue;
        };
        let fetched = ticket.fetch();
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut guard) = feed.lock() else {
            break;
        };
        guard.finish_poll(ticket, fetched, Instant::now());
    }
}
