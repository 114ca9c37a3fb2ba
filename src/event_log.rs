//! Bounded in-memory detection log.
//!
//! Entries are kept oldest first. After every append the log is checked
//! against `max_size`; once it is exceeded the log is replaced by its own
//! tail of [`retained_len`] entries. Between two truncations the log grows
//! freely up to `max_size`, so a full log does not truncate on every append.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::Detection;

/// Entries kept after an overflow: the most recent half, rounded up.
pub fn retained_len(max_size: usize) -> usize {
    max_size.div_ceil(2)
}

/// Emitted once per truncation. Informational, never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Truncation {
    pub dropped: usize,
    pub kept: usize,
    pub max_size: usize,
}

#[derive(Clone, Debug)]
pub struct EventLog {
    entries: Vec<Detection>,
    max_size: usize,
    generation: u64,
}

impl EventLog {
    pub fn new(max_size: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(anyhow!("event log max size must be greater than zero"));
        }
        Ok(Self {
            entries: Vec::new(),
            max_size,
            generation: 0,
        })
    }

    /// Append a batch in order, then truncate if the log overflowed.
    pub fn append<I>(&mut self, batch: I) -> Option<Truncation>
    where
        I: IntoIterator<Item = Detection>,
    {
        let before = self.entries.len();
        self.entries.extend(batch);
        if self.entries.len() != before {
            self.generation += 1;
        }
        self.truncate_if_needed()
    }

    pub fn get_all(&self) -> &[Detection] {
        &self.entries
    }

    pub fn truncate_if_needed(&mut self) -> Option<Truncation> {
        if self.entries.len() <= self.max_size {
            return None;
        }
        let kept = retained_len(self.max_size);
        let dropped = self.entries.len() - kept;
        self.entries.drain(..dropped);
        self.generation += 1;

        let truncation = Truncation {
            dropped,
            kept,
            max_size: self.max_size,
        };
        log::warn!(
            "log size exceeded {}; truncated to the {} most recent entries",
            self.max_size,
            kept
        );
        Some(truncation)
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.generation += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bumped on every change to the contents. Used as a cache key for
    /// derived summaries.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// [`EventLog`] behind a mutex; append and truncation run under one lock.
#[derive(Clone, Debug)]
pub struct SharedEventLog {
    inner: Arc<Mutex<EventLog>>,
}

impl SharedEventLog {
    pub fn new(max_size: usize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(EventLog::new(max_size)?)),
        })
    }

    pub fn append<I>(&self, batch: I) -> Result<Option<Truncation>>
    where
        I: IntoIterator<Item = Detection>,
    {
        Ok(self.lock()?.append(batch))
    }

    /// Snapshot of the current contents.
    pub fn get_all(&self) -> Result<Vec<Detection>> {
        Ok(self.lock()?.get_all().to_vec())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, EventLog>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;
    use chrono::{Duration, TimeZone, Utc};

    fn numbered(i: usize) -> Detection {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let ts = t0 + Duration::seconds(i as i64);
        Detection::recorded_at(
            "Violence",
            0.5,
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            ts,
            ts,
            &format!("frame-{}", i),
        )
        .unwrap()
    }

    #[test]
    fn retained_len_rounds_up() {
        assert_eq!(retained_len(10), 5);
        assert_eq!(retained_len(5000), 2500);
        assert_eq!(retained_len(7), 4);
        assert_eq!(retained_len(1), 1);
    }

    #[test]
    fn thirteen_single_appends_with_max_ten() {
        let mut log = EventLog::new(10).unwrap();
        let mut truncations = 0;
        let mut lengths = Vec::new();
        for i in 0..13 {
            if log.append([numbered(i)]).is_some() {
                truncations += 1;
            }
            lengths.push(log.len());
        }
        assert_eq!(&lengths[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(&lengths[10..], &[5, 6, 7]);
        assert_eq!(truncations, 1);
    }

    #[test]
    fn truncation_keeps_tail_in_order() {
        for max in [1usize, 2, 7, 10] {
            for n in (max + 1)..(3 * max + 2) {
                let mut log = EventLog::new(max).unwrap();
                log.append((0..n).map(numbered));
                let kept = retained_len(max);
                assert_eq!(log.len(), kept, "max={} n={}", max, n);
                let sources: Vec<String> =
                    log.get_all().iter().map(|d| d.source().to_string()).collect();
                let expected: Vec<String> =
                    ((n - kept)..n).map(|i| format!("frame-{}", i)).collect();
                assert_eq!(sources, expected);
            }
        }
    }

    #[test]
    fn truncation_is_reported_once_per_event() {
        let mut log = EventLog::new(4).unwrap();
        assert!(log.append((0..4).map(numbered)).is_none());
        let t = log.append([numbered(4)]).unwrap();
        assert_eq!(
            t,
            Truncation {
                dropped: 3,
                kept: 2,
                max_size: 4
            }
        );
        assert!(log.truncate_if_needed().is_none());
    }

    #[test]
    fn generation_tracks_changes() {
        let mut log = EventLog::new(4).unwrap();
        let g0 = log.generation();
        log.append(Vec::new());
        assert_eq!(log.generation(), g0);
        log.append([numbered(0)]);
        assert!(log.generation() > g0);
        let g1 = log.generation();
        log.clear();
        assert!(log.generation() > g1);
        assert!(log.is_empty());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(EventLog::new(0).is_err());
    }

    #[test]
    fn shared_log_holds_bound_across_threads() {
        let log = SharedEventLog::new(10).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.append([numbered(t * 100 + i)]).unwrap();
                        assert!(log.len().unwrap() <= 10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(log.len().unwrap() <= 10);
    }
}
