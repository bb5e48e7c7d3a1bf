use crate::models::EntityId;
use crate::paths::EntityParser;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type ListenerCallback = Arc<dyn Fn(ListenerEvent) -> ListenerFuture + Send + Sync>;

/// Fan-out of data-dir-relative paths reported by the OS watcher (or by
/// tests and other writers).
#[derive(Clone)]
pub struct WatchHub {
    sender: broadcast::Sender<String>,
}

impl WatchHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn notify(&self, relative_path: impl Into<String>) {
        let _ = self.sender.send(relative_path.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

#[derive(Clone)]
pub enum ListenerMode {
    Entity { parser: EntityParser },
    Simple { fallback_interval: Option<Duration> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Entity { entity_id: EntityId, path: String },
    /// Something under the watched paths changed, or events were lost.
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(Uuid);

/// Filters hub events down to one persister's paths and dispatches them to
/// registered callbacks. Watching starts with the first callback and stops
/// with the last.
#[derive(Clone)]
pub struct FileListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    hub: WatchHub,
    prefixes: Vec<String>,
    mode: ListenerMode,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    callbacks: HashMap<Uuid, ListenerCallback>,
    task: Option<JoinHandle<()>>,
}

impl FileListener {
    pub fn new(hub: WatchHub, prefixes: Vec<String>, mode: ListenerMode) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                hub,
                prefixes,
                mode,
                state: Mutex::new(ListenerState::default()),
            }),
        }
    }

    pub fn add_listener(&self, callback: ListenerCallback) -> ListenerHandle {
        let id = Uuid::new_v4();
        let mut state = self.inner.lock_state();
        state.callbacks.insert(id, callback);
        if state.task.is_none() {
            let receiver = self.inner.hub.subscribe();
            state.task = Some(tokio::spawn(watch_loop(
                Arc::downgrade(&self.inner),
                receiver,
                self.fallback_interval(),
            )));
            tracing::debug!(prefixes = ?self.inner.prefixes, "file listener watching");
        }
        ListenerHandle(id)
    }

    pub fn del_listener(&self, handle: ListenerHandle) {
        let mut state = self.inner.lock_state();
        state.callbacks.remove(&handle.0);
        if state.callbacks.is_empty() {
            if let Some(task) = state.task.take() {
                task.abort();
                tracing::debug!(prefixes = ?self.inner.prefixes, "file listener idle");
            }
        }
    }

    /// Period of the re-derive tick; only simple-mode listeners have one.
    pub fn fallback_interval(&self) -> Option<Duration> {
        match &self.inner.mode {
            ListenerMode::Simple { fallback_interval } => *fallback_interval,
            ListenerMode::Entity { .. } => None,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.lock_state().task.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock_state().callbacks.len()
    }

    pub fn route(&self, relative_path: &str) -> Option<ListenerEvent> {
        route_path(&self.inner.prefixes, &self.inner.mode, relative_path)
    }
}

impl ListenerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> Vec<ListenerCallback> {
        self.lock_state().callbacks.values().cloned().collect()
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

/// Pure routing of one relative path for the given prefixes and mode.
pub fn route_path(prefixes: &[String], mode: &ListenerMode, relative_path: &str) -> Option<ListenerEvent> {
    if !prefixes.iter().any(|prefix| relative_path.starts_with(prefix.as_str())) {
        return None;
    }
    match mode {
        ListenerMode::Entity { parser } => parser(relative_path).map(|entity_id| ListenerEvent::Entity {
            entity_id,
            path: relative_path.to_string(),
        }),
        ListenerMode::Simple { .. } => Some(ListenerEvent::Changed),
    }
}

async fn watch_loop(
    inner: Weak<ListenerInner>,
    mut receiver: broadcast::Receiver<String>,
    fallback: Option<Duration>,
) {
    let mut ticker = fallback.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let event = tokio::select! {
            received = receiver.recv() => match received {
                Ok(path) => {
                    let Some(listener) = inner.upgrade() else {
                        break;
                    };
                    match route_path(&listener.prefixes, &listener.mode, &path) {
                        Some(event) => event,
                        None => continue,
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "file listener lagged; requesting full reload");
                    ListenerEvent::Changed
                }
                Err(RecvError::Closed) => break,
            },
            _ = next_tick(&mut ticker) => ListenerEvent::Changed,
        };

        let callbacks = match inner.upgrade() {
            Some(listener) => listener.callbacks(),
            None => break,
        };
        for callback in callbacks {
            callback(event.clone()).await;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::markdown_entity_parser;
    use tokio::sync::mpsc;

    fn recording_callback() -> (ListenerCallback, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let callback: ListenerCallback = Arc::new(move |event: ListenerEvent| -> ListenerFuture {
            let sender = sender.clone();
            Box::pin(async move {
                let _ = sender.send(event);
            })
        });
        (callback, receiver)
    }

    fn entity_listener(hub: &WatchHub) -> FileListener {
        FileListener::new(
            hub.clone(),
            vec!["humans/".to_string()],
            ListenerMode::Entity {
                parser: markdown_entity_parser("humans"),
            },
        )
    }

    #[test]
    fn routing_rejects_foreign_and_unparseable_paths() {
        let listener = entity_listener(&WatchHub::new(8));
        assert_eq!(
            listener.route("humans/h1.md"),
            Some(ListenerEvent::Entity {
                entity_id: "h1".to_string(),
                path: "humans/h1.md".to_string(),
            })
        );
        assert_eq!(listener.route("organizations/o1.md"), None);
        assert_eq!(listener.route("humans/.h1.md.tmp"), None);
    }

    #[tokio::test]
    async fn watching_follows_listener_registration() {
        let hub = WatchHub::new(8);
        let listener = entity_listener(&hub);
        assert!(!listener.is_watching());

        let (first, _first_events) = recording_callback();
        let (second, _second_events) = recording_callback();
        let first = listener.add_listener(first);
        let second = listener.add_listener(second);
        assert!(listener.is_watching());

        listener.del_listener(first);
        assert!(listener.is_watching());
        listener.del_listener(second);
        listener.del_listener(second);
        assert!(!listener.is_watching());
        assert_eq!(listener.listener_count(), 0);
    }

    #[tokio::test]
    async fn every_callback_receives_matching_events() {
        let hub = WatchHub::new(8);
        let listener = entity_listener(&hub);
        let (first, mut first_events) = recording_callback();
        let (second, mut second_events) = recording_callback();
        listener.add_listener(first);
        listener.add_listener(second);

        hub.notify("organizations/o1.md");
        hub.notify("humans/h1.md");

        let expected = ListenerEvent::Entity {
            entity_id: "h1".to_string(),
            path: "humans/h1.md".to_string(),
        };
        assert_eq!(first_events.recv().await.expect("first event"), expected);
        assert_eq!(second_events.recv().await.expect("second event"), expected);
        assert!(first_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn simple_mode_fires_on_fallback_interval() {
        let hub = WatchHub::new(8);
        let listener = FileListener::new(
            hub.clone(),
            vec!["calendars.json".to_string()],
            ListenerMode::Simple {
                fallback_interval: Some(Duration::from_millis(20)),
            },
        );
        let (callback, mut events) = recording_callback();
        listener.add_listener(callback);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("fallback fired in time")
            .expect("fallback event");
        assert_eq!(event, ListenerEvent::Changed);
    }

    #[tokio::test]
    async fn lagged_receivers_request_full_reload() {
        let hub = WatchHub::new(2);
        let listener = entity_listener(&hub);
        let (sender, mut events) = mpsc::unbounded_channel();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let callback_gate = gate.clone();
        let callback: ListenerCallback = Arc::new(move |event: ListenerEvent| -> ListenerFuture {
            let sender = sender.clone();
            let gate = callback_gate.clone();
            Box::pin(async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                let _ = sender.send(event);
            })
        });
        listener.add_listener(callback);

        hub.notify("humans/first.md");
        tokio::task::yield_now().await;
        for index in 0..8 {
            hub.notify(format!("humans/h{index}.md"));
        }
        gate.add_permits(16);

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("events keep flowing")
                .expect("event");
            if event == ListenerEvent::Changed {
                break;
            }
        }
    }
}
