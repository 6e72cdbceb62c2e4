use std::env;
use std::time::Duration;

const POLL_DEBOUNCE_MS_DEFAULT: u64 = 5_000;
const POLL_PAGE_SIZE_DEFAULT: u32 = 100;
const HTTP_TIMEOUT_MS_DEFAULT: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub poll_debounce: Duration,
    pub poll_page_size: u32,
    /// `None` keeps every unmatched signal for the life of the session.
    pub signal_buffer_limit: Option<usize>,
    pub http_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_debounce: Duration::from_millis(POLL_DEBOUNCE_MS_DEFAULT),
            poll_page_size: POLL_PAGE_SIZE_DEFAULT,
            signal_buffer_limit: None,
            http_timeout: Duration::from_millis(HTTP_TIMEOUT_MS_DEFAULT),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read_u64 = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());

        let poll_debounce_ms = read_u64("GENFEED_POLL_DEBOUNCE_MS")
            .map(|value| value.clamp(50, 600_000))
            .unwrap_or(POLL_DEBOUNCE_MS_DEFAULT);
        let poll_page_size = read_u64("GENFEED_POLL_PAGE_SIZE")
            .map(|value| value.clamp(1, 500))
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(POLL_PAGE_SIZE_DEFAULT);
        let signal_buffer_limit = read_u64("GENFEED_SIGNAL_BUFFER_LIMIT")
            .filter(|value| *value > 0)
            .and_then(|value| usize::try_from(value).ok());
        let http_timeout_ms = read_u64("GENFEED_HTTP_TIMEOUT_MS")
            .map(|value| value.clamp(500, 300_000))
            .unwrap_or(HTTP_TIMEOUT_MS_DEFAULT);

        Self {
            poll_debounce: Duration::from_millis(poll_debounce_ms),
            poll_page_size,
            signal_buffer_limit,
            http_timeout: Duration::from_millis(http_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::FeedConfig;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_five_second_debounce_and_unbounded_buffer() {
        let config = FeedConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, FeedConfig::default());
        assert_eq!(config.poll_debounce, Duration::from_secs(5));
        assert_eq!(config.poll_page_size, 100);
        assert_eq!(config.signal_buffer_limit, None);
    }

    #[test]
    fn env_values_are_clamped() {
        let config = FeedConfig::from_lookup(lookup_from(&[
            ("GENFEED_POLL_DEBOUNCE_MS", "1"),
            ("GENFEED_POLL_PAGE_SIZE", "10000"),
            ("GENFEED_SIGNAL_BUFFER_LIMIT", " 256 "),
            ("GENFEED_HTTP_TIMEOUT_MS", "999999999"),
        ]));
        assert_eq!(config.poll_debounce, Duration::from_millis(50));
        assert_eq!(config.poll_page_size, 500);
        assert_eq!(config.signal_buffer_limit, Some(256));
        assert_eq!(config.http_timeout, Duration::from_millis(300_000));
    }

    #[test]
    fn zero_or_garbage_buffer_limit_means_unbounded() {
        let zero = FeedConfig::from_lookup(lookup_from(&[("GENFEED_SIGNAL_BUFFER_LIMIT", "0")]));
        assert_eq!(zero.signal_buffer_limit, None);
        let garbage =
            FeedConfig::from_lookup(lookup_from(&[("GENFEED_POLL_DEBOUNCE_MS", "soon")]));
        assert_eq!(garbage.poll_debounce, Duration::from_secs(5));
    }
}
