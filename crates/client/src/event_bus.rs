//! 按事件类型分发服务端推送的订阅总线。
//!
//! 订阅返回一个 [`Subscription`] 句柄，句柄被 drop 时自动退订。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use application::{ServerEvent, ServerEventKind};
use tokio::sync::mpsc;

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
    next_id: u64,
    handlers: HashMap<ServerEventKind, Vec<(u64, Handler)>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: ServerEventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(&self.state),
            kind,
            id,
        }
    }

    /// 以通道的形式订阅，适合在异步代码里逐条等待事件。
    pub fn stream(&self, kind: ServerEventKind) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            receiver: rx,
            _subscription: subscription,
        }
    }

    /// 把事件交给该类型的全部订阅者。回调在锁外执行，可以在回调里再订阅或退订。
    pub fn publish(&self, event: &ServerEvent) -> usize {
        let handlers: Vec<Handler> = self
            .lock()
            .handlers
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn subscriber_count(&self, kind: ServerEventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.lock().handlers.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        // 回调不在锁内执行，锁中毒只可能来自本模块自身的 panic
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventBus")
            .field("kinds", &state.handlers.len())
            .finish()
    }
}

/// 订阅句柄
#[must_use = "dropping a subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Mutex<BusState>>,
    kind: ServerEventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> ServerEventKind {
        self.kind
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut state = bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = state.handlers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                state.handlers.remove(&self.kind);
            }
        }
    }
}

/// 通道形式的订阅，drop 时一并退订。
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
    _subscription: Subscription,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use application::realtime::events::{PresenceStatus, StatusChange};
    use uuid::Uuid;

    use super::*;

    fn offline() -> ServerEvent {
        ServerEvent::UserStatusChange(StatusChange {
            user_id: Uuid::new_v4(),
            status: PresenceStatus::Offline,
        })
    }

    #[test]
    fn delivers_only_to_matching_kind() {
        let bus = EventBus::new();
        let status_hits = Arc::new(AtomicUsize::new(0));
        let error_hits = Arc::new(AtomicUsize::new(0));

        let counter = status_hits.clone();
        let _status = bus.subscribe(ServerEventKind::UserStatusChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = error_hits.clone();
        let _errors = bus.subscribe(ServerEventKind::Error, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&offline()), 1);
        assert_eq!(status_hits.load(Ordering::SeqCst), 1);
        assert_eq!(error_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = bus.subscribe(ServerEventKind::UserStatusChange, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(ServerEventKind::UserStatusChange), 1);

        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(ServerEventKind::UserStatusChange), 0);
        assert_eq!(bus.publish(&offline()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscription_outliving_bus_is_harmless() {
        let bus = EventBus::new();
        let subscription = bus.subscribe(ServerEventKind::Error, |_| {});
        drop(bus);
        drop(subscription);
    }

    #[tokio::test]
    async fn stream_receives_published_events() {
        let bus = EventBus::new();
        let mut stream = bus.stream(ServerEventKind::Error);
        bus.publish(&ServerEvent::error("Unauthorized"));
        match stream.recv().await {
            Some(ServerEvent::Error(notice)) => assert_eq!(notice.message, "Unauthorized"),
            other => panic!("unexpected {other:?}"),
        }
        drop(stream);
        assert_eq!(bus.subscriber_count(ServerEventKind::Error), 0);
    }
}
