//! Bounded, priority-ordered outbound queue.
//!
//! Items are kept in descending priority order; within one priority band
//! they are FIFO. When the byte budget would be exceeded, the oldest item
//! of the lowest band is evicted, unless that band outranks the incoming
//! item, in which case the incoming item is rejected.
//!
//! The queue is the only structure shared with producer threads. A single
//! mutex covers single-item mutations and the whole drain traversal, so
//! the drive loop sees a consistent snapshot while it fills requests.

use crate::config::QueueConfig;
use crate::model::{ConfigId, DeviceId};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Priority of a queued item. Higher values are sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Background data.
    pub const LOW: Priority = Priority(25);
    /// Regular telemetry.
    pub const NORMAL: Priority = Priority(50);
    /// Alarms and command results.
    pub const HIGH: Priority = Priority(75);
    /// Must go out before anything else.
    pub const URGENT: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Type of payload carried by a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    /// Data item values.
    Data,
    /// Alarm.
    Alarm,
    /// Event.
    Event,
    /// Email.
    Email,
    /// Status of a server command, posted back to the server.
    ResponseStatusEcho,
    /// Anything else.
    Misc,
}

/// An item awaiting transmission.
#[derive(Debug, Clone)]
pub struct QueueItem {
    kind: ItemKind,
    device: DeviceId,
    config: Option<ConfigId>,
    content: Vec<u8>,
    priority: Priority,
    request_id: Option<u64>,
    footprint: usize,
}

impl QueueItem {
    /// Creates an item at normal priority addressed to the primary server.
    pub fn new(kind: ItemKind, device: DeviceId, content: Vec<u8>) -> Self {
        Self {
            kind,
            device,
            config: None,
            content,
            priority: Priority::default(),
            request_id: None,
            footprint: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Addresses the item to a specific server configuration.
    pub fn with_config(mut self, config: ConfigId) -> Self {
        self.config = Some(config);
        self
    }

    /// Payload type.
    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Owning device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Target configuration; `None` means the primary.
    pub fn config(&self) -> Option<ConfigId> {
        self.config
    }

    /// Serialized payload.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Message ID of the request this item was folded into, if any.
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    /// Records the request this item was folded into.
    pub fn claim(&mut self, request_id: u64) {
        self.request_id = Some(request_id);
    }
}

/// Occupancy state reported to the host on change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No items queued.
    Empty,
    /// At least one item queued.
    NonEmpty,
    /// An item was rejected for lack of room.
    Full,
}

/// Result of [`Queue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The item was queued, possibly after evicting others.
    Queued,
    /// The item alone exceeds the budget and was discarded.
    TooLarge,
    /// Higher-priority items fill the budget; the item was rejected.
    Rejected,
}

/// Selects items by owning device when purging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Every device.
    Any,
    /// One device.
    Device(DeviceId),
}

impl DeviceFilter {
    fn matches(&self, device: DeviceId) -> bool {
        match self {
            DeviceFilter::Any => true,
            DeviceFilter::Device(d) => *d == device,
        }
    }
}

type StateListener = Box<dyn Fn(QueueState) + Send + Sync>;

struct QueueInner {
    items: Vec<QueueItem>,
    size: usize,
    state: QueueState,
}

impl QueueInner {
    /// Evicts items until `footprint` more bytes fit in `budget`.
    fn make_room(&mut self, footprint: usize, priority: Priority, budget: usize) -> bool {
        while self.size + footprint > budget {
            let Some(tail) = self.items.last() else {
                break;
            };
            if tail.priority > priority {
                return false;
            }
            let band = tail.priority;
            let Some(index) = self.items.iter().position(|i| i.priority == band) else {
                break;
            };
            let evicted = self.items.remove(index);
            self.size = self.size.saturating_sub(evicted.footprint);
            debug!(
                "evicted {:?} item for device {} (priority {})",
                evicted.kind, evicted.device, evicted.priority.0
            );
        }
        true
    }

    fn insert(&mut self, item: QueueItem) {
        let position = self.items.partition_point(|i| i.priority >= item.priority);
        self.size += item.footprint;
        self.items.insert(position, item);
    }

    fn transition(&mut self, state: QueueState) -> Option<QueueState> {
        if self.state == state {
            None
        } else {
            self.state = state;
            Some(state)
        }
    }

    fn settle(&mut self) -> Option<QueueState> {
        if self.items.is_empty() {
            self.transition(QueueState::Empty)
        } else {
            self.transition(QueueState::NonEmpty)
        }
    }
}

/// Thread-safe outbound queue.
pub struct Queue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    listener: Option<StateListener>,
}

impl Queue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                items: Vec::new(),
                size: 0,
                state: QueueState::Empty,
            }),
            listener: None,
        }
    }

    /// Registers a callback invoked whenever the occupancy state changes.
    pub fn with_state_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(QueueState) + Send + Sync + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    fn notify(&self, change: Option<QueueState>) {
        if let (Some(state), Some(listener)) = (change, &self.listener) {
            listener(state);
        }
    }

    /// Adds an item, evicting lower-priority content if needed.
    ///
    /// Never blocks beyond the queue lock and never fails; discarded and
    /// rejected items are reported through the outcome, logs, and the
    /// state listener.
    pub fn enqueue(&self, mut item: QueueItem) -> EnqueueOutcome {
        let footprint = self.config.footprint(item.content.len());
        if footprint > self.config.budget_bytes {
            warn!(
                "discarding {:?} item for device {}: {} bytes exceeds queue budget of {}",
                item.kind, item.device, footprint, self.config.budget_bytes
            );
            return EnqueueOutcome::TooLarge;
        }
        item.footprint = footprint;
        item.request_id = None;

        let (outcome, change) = {
            let mut inner = self.inner.lock();
            if inner.make_room(footprint, item.priority, self.config.budget_bytes) {
                inner.insert(item);
                (EnqueueOutcome::Queued, inner.transition(QueueState::NonEmpty))
            } else {
                warn!(
                    "queue full, rejecting {:?} item for device {} (priority {})",
                    item.kind, item.device, item.priority.0
                );
                (EnqueueOutcome::Rejected, inner.transition(QueueState::Full))
            }
        };
        self.notify(change);
        outcome
    }

    /// Locks the queue for a full traversal. The lock is released when the
    /// returned guard is dropped.
    pub fn open_drain(&self) -> QueueDrain<'_> {
        QueueDrain {
            guard: self.inner.lock(),
            cursor: 0,
        }
    }

    /// Removes items folded into `request_id` that match `filter`.
    ///
    /// Returns the number of items removed.
    pub fn purge(&self, request_id: u64, filter: DeviceFilter) -> usize {
        let (removed, change) = {
            let mut inner = self.inner.lock();
            let before = inner.items.len();
            let mut freed = 0usize;
            inner.items.retain(|item| {
                let hit = item.request_id == Some(request_id) && filter.matches(item.device);
                if hit {
                    freed += item.footprint;
                }
                !hit
            });
            inner.size = inner.size.saturating_sub(freed);
            let removed = before - inner.items.len();
            let change = if removed > 0 { inner.settle() } else { None };
            (removed, change)
        };
        if removed > 0 {
            debug!("purged {removed} delivered items of message {request_id}");
        }
        self.notify(change);
        removed
    }

    /// Clears the request claim on items still folded into `request_id`,
    /// making them eligible for a later drain.
    pub fn release(&self, request_id: u64) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for item in inner
            .items
            .iter_mut()
            .filter(|i| i.request_id == Some(request_id))
        {
            item.request_id = None;
            released += 1;
        }
        released
    }

    /// Current size as a percentage of the budget. A zero budget reports 100.
    pub fn occupancy_percent(&self) -> u8 {
        if self.config.budget_bytes == 0 {
            return 100;
        }
        let size = self.inner.lock().size;
        ((size.saturating_mul(100)) / self.config.budget_bytes).min(100) as u8
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Estimated bytes currently occupied.
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().size
    }

    /// Configured byte budget.
    pub fn budget_bytes(&self) -> usize {
        self.config.budget_bytes
    }
}

/// Exclusive, in-order traversal of the queue.
///
/// Producers calling [`Queue::enqueue`] block until this guard is dropped.
pub struct QueueDrain<'a> {
    guard: MutexGuard<'a, QueueInner>,
    cursor: usize,
}

impl QueueDrain<'_> {
    /// Returns the next item in priority order.
    pub fn fetch_next(&mut self) -> Option<&mut QueueItem> {
        let index = self.cursor;
        if index >= self.guard.items.len() {
            return None;
        }
        self.cursor += 1;
        self.guard.items.get_mut(index)
    }

    /// Number of items not yet fetched.
    pub fn remaining(&self) -> usize {
        self.guard.items.len().saturating_sub(self.cursor)
    }
}
