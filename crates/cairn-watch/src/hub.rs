//! Coalescing fan-out from one producer loop to many subscribers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use tracing::trace;

/// Items that supersede earlier items with the same key.
pub trait Coalesce {
    type Key: PartialEq;

    fn coalesce_key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification<T> {
    /// Latest item per key since the previous receive, oldest first.
    Changes(Vec<T>),
    /// Continuity was lost; re-read everything of interest.
    Resync,
}

struct MailboxState<T> {
    items: Vec<T>,
    resync: bool,
    closed: bool,
}

struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    notify: Notify,
}

impl<T: Coalesce> Mailbox<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                items: Vec::new(),
                resync: false,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState<T>> {
        // Mailbox state stays consistent even if a holder panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(&self, item: T) {
        {
            let mut state = self.lock();
            if state.closed || state.resync {
                return;
            }
            let key = item.coalesce_key();
            state.items.retain(|i| i.coalesce_key() != key);
            state.items.push(item);
        }
        self.notify.notify_one();
    }

    fn resync(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.items.clear();
            state.resync = true;
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Option<Notification<T>>> {
        let mut state = self.lock();
        if state.resync {
            state.resync = false;
            return Some(Some(Notification::Resync));
        }
        if !state.items.is_empty() {
            return Some(Some(Notification::Changes(std::mem::take(&mut state.items))));
        }
        if state.closed {
            return Some(None);
        }
        None
    }
}

type Registry<K, T> = BTreeMap<K, Vec<(u64, Arc<Mailbox<T>>)>>;

struct HubInner<K, T> {
    subscribers: Mutex<Registry<K, T>>,
    next_id: AtomicU64,
}

impl<K, T> HubInner<K, T> {
    fn lock(&self) -> MutexGuard<'_, Registry<K, T>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registry of subscriptions keyed by what they watch.
///
/// Delivery never blocks: items land in the subscriber's mailbox, replacing
/// any undelivered item with the same coalescing key.
pub struct Hub<K, T> {
    inner: Arc<HubInner<K, T>>,
}

impl<K, T> Clone for Hub<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Ord + Clone, T: Coalesce + Clone> Default for Hub<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, T: Coalesce + Clone> Hub<K, T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, key: K) -> Subscription<K, T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new());
        self.inner
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, mailbox.clone()));
        Subscription {
            id,
            key,
            mailbox,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn deliver(&self, key: &K, item: &T) {
        let subscribers = self.inner.lock();
        if let Some(mailboxes) = subscribers.get(key) {
            for (_, mailbox) in mailboxes {
                mailbox.push(item.clone());
            }
        }
    }

    pub fn resync_all(&self) {
        for mailboxes in self.inner.lock().values() {
            for (_, mailbox) in mailboxes {
                mailbox.resync();
            }
        }
    }

    /// Close every subscription; receivers drain what is queued, then get `None`.
    pub fn close_all(&self) {
        let mut subscribers = self.inner.lock();
        for (_, mailboxes) in std::mem::take(&mut *subscribers) {
            for (_, mailbox) in mailboxes {
                mailbox.close();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }
}

/// Receiving end of a hub registration. Unsubscribes on drop.
pub struct Subscription<K: Ord, T> {
    id: u64,
    key: K,
    mailbox: Arc<Mailbox<T>>,
    hub: Weak<HubInner<K, T>>,
}

impl<K: Ord, T: Coalesce> Subscription<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the next notification. Returns `None` once the subscription
    /// is closed and everything queued has been received.
    pub async fn recv(&mut self) -> Option<Notification<T>> {
        loop {
            if let Some(next) = self.mailbox.take() {
                return next;
            }
            self.mailbox.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Notification<T>> {
        self.mailbox.take().flatten()
    }

    /// Queue an item for this subscriber only.
    pub(crate) fn push(&self, item: T) {
        self.mailbox.push(item);
    }

    /// Unsubscribe explicitly.
    pub fn close(self) {}
}

impl<K: Ord, T> Drop for Subscription<K, T> {
    fn drop(&mut self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut subscribers = hub.lock();
        if let Some(mailboxes) = subscribers.get_mut(&self.key) {
            mailboxes.retain(|(id, _)| *id != self.id);
            if mailboxes.is_empty() {
                subscribers.remove(&self.key);
            }
        }
        trace!("subscription {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(&'static str, u32);

    impl Coalesce for Item {
        type Key = &'static str;
        fn coalesce_key(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn coalesces_by_key() {
        let hub: Hub<String, Item> = Hub::new();
        let mut sub = hub.subscribe("k".to_owned());
        hub.deliver(&"k".to_owned(), &Item("a", 1));
        hub.deliver(&"k".to_owned(), &Item("b", 1));
        hub.deliver(&"k".to_owned(), &Item("a", 2));
        assert_eq!(
            sub.try_recv(),
            Some(Notification::Changes(vec![Item("b", 1), Item("a", 2)]))
        );
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn only_matching_keys_deliver() {
        let hub: Hub<String, Item> = Hub::new();
        let mut sub = hub.subscribe("k".to_owned());
        hub.deliver(&"other".to_owned(), &Item("a", 1));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn resync_supersedes_pending_items() {
        let hub: Hub<String, Item> = Hub::new();
        let mut sub = hub.subscribe("k".to_owned());
        hub.deliver(&"k".to_owned(), &Item("a", 1));
        hub.resync_all();
        hub.deliver(&"k".to_owned(), &Item("a", 2));
        assert_eq!(sub.try_recv(), Some(Notification::Resync));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn drop_unsubscribes() {
        let hub: Hub<String, Item> = Hub::new();
        let a = hub.subscribe("k".to_owned());
        let b = hub.subscribe("k".to_owned());
        assert_eq!(hub.subscriber_count(), 2);
        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        b.close();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_delivery() {
        let hub: Hub<String, Item> = Hub::new();
        let mut sub = hub.subscribe("k".to_owned());
        let producer = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.deliver(&"k".to_owned(), &Item("a", 1));
        });
        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Notification::Changes(vec![Item("a", 1)])));
    }

    #[tokio::test]
    async fn close_all_ends_receivers() {
        let hub: Hub<String, Item> = Hub::new();
        let mut sub = hub.subscribe("k".to_owned());
        hub.deliver(&"k".to_owned(), &Item("a", 1));
        hub.close_all();
        assert!(matches!(sub.recv().await, Some(Notification::Changes(_))));
        assert_eq!(sub.recv().await, None);
    }
}
