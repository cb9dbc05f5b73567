//! Weighted delaying queue.
//!
//! Items are scheduled with a ready time and a weight band. A background
//! loop promotes items whose ready time has elapsed into the ready
//! structure, which consumers drain in band order:
//!
//! - band 0 ("fresh") is always drained first;
//! - otherwise bands are visited from the highest weight down, and band `W`
//!   yields up to `W` items before the scan moves on (re-checking band 0
//!   before every item).
//!
//! Within a band items come out in ready-time order. Cancellation is lazy:
//! every item maps to the sequence number of its single live entry, and
//! entries whose sequence no longer matches are discarded when they surface.
//! A delay heap is compacted once it holds more than twice as many entries
//! as there are live items, so it never grows past
//! `max(COMPACT_MIN, 2 * live) + 1` entries.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Highest priority band, used for freshly observed work.
pub const FRESH_WEIGHT: u32 = 0;
/// Band used to re-enqueue failed work behind fresh work.
pub const RETRY_WEIGHT: u32 = 1;

struct Delayed<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at.cmp(&other.ready_at).then(self.seq.cmp(&other.seq))
    }
}

type Band<T> = VecDeque<(u64, T)>;

const COMPACT_MIN: usize = 64;

struct State<T> {
    seq: u64,
    /// item -> sequence of its live entry
    live: FxHashMap<T, u64>,
    /// Delay heaps keyed by weight; weight 0 is the unweighted heap.
    delayed: BTreeMap<u32, BinaryHeap<Reverse<Delayed<T>>>>,
    fresh: Band<T>,
    bands: BTreeMap<u32, Band<T>>,
    /// Band currently being drained and how many more items it may yield.
    cursor: Option<(u32, u32)>,
}

impl<T: Hash + Eq + Clone> State<T> {
    fn new() -> Self {
        Self {
            seq: 0,
            live: FxHashMap::default(),
            delayed: BTreeMap::new(),
            fresh: VecDeque::new(),
            bands: BTreeMap::new(),
            cursor: None,
        }
    }

    fn track(&mut self, item: &T) -> u64 {
        self.seq += 1;
        if self.live.insert(item.clone(), self.seq).is_some() {
            trace!("re-adding queued item; previous entry superseded");
        }
        self.seq
    }

    fn push_ready(&mut self, weight: u32, seq: u64, item: T) {
        if weight == FRESH_WEIGHT {
            self.fresh.push_back((seq, item));
        } else {
            self.bands.entry(weight).or_default().push_back((seq, item));
        }
    }

    fn is_live(live: &FxHashMap<T, u64>, item: &T, seq: u64) -> bool {
        live.get(item) == Some(&seq)
    }

    fn schedule(&mut self, weight: u32, ready_at: Instant, item: T) {
        let seq = self.track(&item);
        self.delayed.entry(weight).or_default().push(Reverse(Delayed { ready_at, seq, item }));
        self.compact();
    }

    /// Drop dead entries from delay heaps dominated by them.
    fn compact(&mut self) {
        let live = &self.live;
        for heap in self.delayed.values_mut() {
            if heap.len() > COMPACT_MIN && heap.len() > 2 * live.len() {
                let before = heap.len();
                heap.retain(|Reverse(d)| Self::is_live(live, &d.item, d.seq));
                trace!(before, after = heap.len(), "delay heap compacted");
            }
        }
    }

    /// Move every live delayed entry with `ready_at <= now` into the ready bands.
    fn promote(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        let mut moved: Vec<(u32, u64, T)> = Vec::new();
        for (&weight, heap) in self.delayed.iter_mut() {
            while let Some(Reverse(top)) = heap.peek() {
                if !Self::is_live(&self.live, &top.item, top.seq) {
                    heap.pop();
                    continue;
                }
                if top.ready_at > now {
                    break;
                }
                if let Some(Reverse(d)) = heap.pop() {
                    moved.push((weight, d.seq, d.item));
                }
            }
        }
        self.delayed.retain(|_, heap| !heap.is_empty());
        for (weight, seq, item) in moved {
            self.push_ready(weight, seq, item);
            promoted += 1;
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.values().filter_map(|heap| heap.peek().map(|Reverse(d)| d.ready_at)).min()
    }

    fn prune(band: &mut Band<T>, live: &FxHashMap<T, u64>) {
        while let Some((seq, item)) = band.front() {
            if Self::is_live(live, item, *seq) {
                break;
            }
            band.pop_front();
        }
    }

    fn pop_live(band: &mut Band<T>, live: &mut FxHashMap<T, u64>) -> Option<T> {
        while let Some((seq, item)) = band.pop_front() {
            if Self::is_live(live, &item, seq) {
                live.remove(&item);
                return Some(item);
            }
        }
        None
    }

    fn pop_ready(&mut self) -> Option<T> {
        if let Some(item) = Self::pop_live(&mut self.fresh, &mut self.live) {
            return Some(item);
        }
        let live = &self.live;
        self.bands.retain(|_, band| {
            Self::prune(band, live);
            !band.is_empty()
        });
        let highest = *self.bands.keys().next_back()?;
        let weight = match self.cursor {
            Some((w, left)) if left > 0 && self.bands.contains_key(&w) => {
                self.cursor = Some((w, left - 1));
                w
            }
            Some((w, _)) => {
                let next = self.bands.range(..w).next_back().map(|(k, _)| *k).unwrap_or(highest);
                self.cursor = Some((next, next - 1));
                next
            }
            None => {
                self.cursor = Some((highest, highest - 1));
                highest
            }
        };
        let band = self.bands.get_mut(&weight)?;
        Self::pop_live(band, &mut self.live)
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Wakes the delay loop when the earliest ready time may have changed.
    wake: Notify,
    /// Wakes consumers blocked in `get_or_wait`.
    ready: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Delay queue with coarse priority bands. Cloning yields another handle to
/// the same queue.
pub struct WeightedDelayingQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WeightedDelayingQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> WeightedDelayingQueue<T>
where
    T: Hash + Eq + Clone + Send + 'static,
{
    /// Create the queue and spawn its delay loop, which runs until `done` fires.
    /// Must be called from within a tokio runtime.
    pub fn new(done: CancellationToken) -> Self {
        let shared = Arc::new(Shared { state: Mutex::new(State::new()), wake: Notify::new(), ready: Notify::new() });
        tokio::spawn(run_delay_loop(Arc::clone(&shared), done));
        Self { shared }
    }

    /// Make `item` available immediately in band `weight`.
    pub fn add_weight(&self, item: T, weight: u32) {
        {
            let mut st = self.shared.lock();
            let seq = st.track(&item);
            st.push_ready(weight, seq, item);
        }
        self.shared.ready.notify_waiters();
    }

    /// Make `item` available after `delay` in band `weight`. A zero delay
    /// bypasses the delay heaps.
    pub fn add_weight_after(&self, item: T, weight: u32, delay: Duration) {
        if delay.is_zero() {
            return self.add_weight(item, weight);
        }
        let ready_at = Instant::now() + delay;
        self.shared.lock().schedule(weight, ready_at, item);
        self.shared.wake.notify_one();
    }

    pub fn add(&self, item: T) {
        self.add_weight(item, FRESH_WEIGHT)
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.add_weight_after(item, FRESH_WEIGHT, delay)
    }

    /// Remove a not-yet-dequeued item. Returns false when the item is unknown
    /// or was already handed to a consumer.
    pub fn cancel(&self, item: &T) -> bool {
        let mut st = self.shared.lock();
        let removed = st.live.remove(item).is_some();
        if removed {
            st.compact();
        }
        removed
    }

    /// Pop a ready item without waiting.
    pub fn try_get(&self) -> Option<T> {
        let mut st = self.shared.lock();
        st.promote(Instant::now());
        st.pop_ready()
    }

    /// Wait for the next ready item; `None` once `done` fires.
    pub async fn get_or_wait(&self, done: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_get() {
                return Some(item);
            }
            tokio::select! {
                biased;
                _ = done.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Number of live (queued, not cancelled, not yet dequeued) items.
    pub fn len(&self) -> usize {
        self.shared.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run_delay_loop<T>(shared: Arc<Shared<T>>, done: CancellationToken)
where
    T: Hash + Eq + Clone + Send + 'static,
{
    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();
        let (promoted, next) = {
            let mut st = shared.lock();
            let promoted = st.promote(Instant::now());
            (promoted, st.next_ready_at())
        };
        if promoted > 0 {
            trace!(promoted, "delayed items ready");
            shared.ready.notify_waiters();
        }
        match next {
            Some(at) => tokio::select! {
                _ = done.cancelled() => break,
                _ = &mut wake => {}
                _ = sleep_until(at) => {}
            },
            None => tokio::select! {
                _ = done.cancelled() => break,
                _ = &mut wake => {}
            },
        }
    }
    debug!("delay loop stopped");
}
