use std::collections::HashMap;
use std::sync::Mutex;

/// Process-wide statistics counter map (spec §5, resource (c)).
///
/// Written during normal operation (e.g. "http retry" is bumped once per
/// retried request, per spec §8 scenario 4), read only for diagnostics or
/// tests. Accessed only from the thread owning the process's event loop,
/// so a plain `Mutex` (rather than anything lock-free) is enough.
#[derive(Default)]
pub struct StatCounters {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, key: &'static str) {
        self.incr_by(key, 1);
    }

    pub fn incr_by(&self, key: &'static str, n: u64) {
        let mut guard = self.counts.lock().expect("stats mutex poisoned");
        *guard.entry(key).or_insert(0) += n;
    }

    pub fn get(&self, key: &str) -> u64 {
        let guard = self.counts.lock().expect("stats mutex poisoned");
        guard.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_key() {
        let stats = StatCounters::new();
        stats.incr("http.retry");
        stats.incr("http.retry");
        stats.incr_by("http.retry", 3);
        stats.incr("s3.put");

        assert_eq!(stats.get("http.retry"), 5);
        assert_eq!(stats.get("s3.put"), 1);
        assert_eq!(stats.get("unknown"), 0);
    }
}
