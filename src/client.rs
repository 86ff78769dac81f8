//! Factory and per-entity handles.
//!
//! [`Client`] owns the [`ConnectionPool`] shared by every entity handle it
//! hands out, and caches one handle per distinct queue/topic name so that
//! repeated [`Client::get_queue`]/[`Client::get_topic`] calls for the same
//! name return the same underlying sender/receiver state rather than
//! attaching a fresh set of links each time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{ClientOptions, ReceiverOptions, DEFAULT_SEND_TIMEOUT, SERVICE_BUS_SERVER_TIMEOUT};
use crate::connection_string::{ConnectionString, ConnectionStringError};
use crate::error::ServiceBusError;
use crate::events::{EventSink, EventStream, LinkLifecycleEvent};
use crate::message::ServiceBusMessage;
use crate::pool::ConnectionPool;
use crate::receiver::batch;
use crate::receiver::streaming::MessageListener;
use crate::sender::Sender;

fn dead_letter_path(entity_path: &str) -> String {
    format!("{}/$DeadLetterQueue", entity_path)
}

fn subscription_path(topic_name: &str, subscription_name: &str) -> String {
    format!("{}/Subscriptions/{}", topic_name, subscription_name)
}

/// Top-level entry point: parses a connection string, owns the shared
/// [`ConnectionPool`], and hands out cached per-entity handles.
pub struct Client {
    pool: ConnectionPool,
    queues: parking_lot::Mutex<HashMap<String, Arc<QueueHandleInner>>>,
    topics: parking_lot::Mutex<HashMap<String, Arc<TopicHandleInner>>>,
}

impl Client {
    /// Parses `connection_string` and builds a client whose connections are
    /// tuned by `options`.
    pub fn from_connection_string(
        connection_string: &str,
        options: ClientOptions,
    ) -> Result<Self, ConnectionStringError> {
        let cs = ConnectionString::parse(connection_string)?;
        let container_id = format!("azservicebus-rs-{}", Uuid::new_v4());
        let pool = ConnectionPool::new(&cs, container_id, options.pool);
        Ok(Client {
            pool,
            queues: parking_lot::Mutex::new(HashMap::new()),
            topics: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Returns the cached handle for `queue_name`, creating it on first access.
    pub fn get_queue(&self, queue_name: &str) -> QueueHandle {
        let mut queues = self.queues.lock();
        let inner = queues
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(QueueHandleInner::new(self.pool.clone(), queue_name)))
            .clone();
        QueueHandle(inner)
    }

    /// Returns the cached handle for `topic_name`, creating it on first access.
    pub fn get_topic(&self, topic_name: &str) -> TopicHandle {
        let mut topics = self.topics.lock();
        let inner = topics
            .entry(topic_name.to_string())
            .or_insert_with(|| Arc::new(TopicHandleInner::new(self.pool.clone(), topic_name)))
            .clone();
        TopicHandle(inner)
    }

    /// Tears down the connection pool and every link leased from it. The
    /// client is unusable after this; any cached handle still held by the
    /// caller will fail its next operation.
    pub async fn dispose(&self) {
        self.pool.dispose().await;
    }
}

/// Events a [`QueueHandle`] or [`TopicHandle`] reports about its own sender's
/// link lifecycle, named to match the specification's event vocabulary.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    /// The entity's sender link detached.
    SenderDetached {
        /// Free-text detail from the detach, if any.
        info: Option<String>,
    },
    /// The entity's sender link (re)attached, including the first attach.
    SenderReattached,
}

/// Spawns the background task that translates a sender's raw link-lifecycle
/// events into [`EntityEvent`]s for `sink`. Requires an active Tokio runtime;
/// callers must not invoke this outside one (see `ensure_forwarder` call sites).
fn spawn_sender_event_forwarder(sender: &Sender, sink: Arc<EventSink<EntityEvent>>) {
    let mut stream = sender.events();
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let translated = match event {
                LinkLifecycleEvent::Attached { .. } => EntityEvent::SenderReattached,
                LinkLifecycleEvent::Detached { info, .. } => EntityEvent::SenderDetached { info },
            };
            sink.emit(translated);
        }
    });
}

struct QueueHandleInner {
    pool: ConnectionPool,
    name: String,
    sender: Sender,
    events: Arc<EventSink<EntityEvent>>,
    forwarder_started: AtomicBool,
}

impl QueueHandleInner {
    fn new(pool: ConnectionPool, name: &str) -> Self {
        let sender = Sender::new(pool.clone(), name);
        let events = Arc::new(EventSink::new());
        QueueHandleInner {
            pool,
            name: name.to_string(),
            sender,
            events,
            forwarder_started: AtomicBool::new(false),
        }
    }

    /// Spawns the sender-event forwarder on first use. Deferred out of `new`
    /// so that building a handle never requires an active Tokio runtime.
    fn ensure_forwarder(&self) {
        if self.forwarder_started.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_sender_event_forwarder(&self.sender, self.events.clone());
    }

    fn dead_letter_path(&self) -> String {
        dead_letter_path(&self.name)
    }
}

/// A handle to one queue: its sender plus every receiver operation for both
/// the queue itself and its dead-letter sub-queue.
#[derive(Clone)]
pub struct QueueHandle(Arc<QueueHandleInner>);

impl QueueHandle {
    /// Sends `message`, using [`DEFAULT_SEND_TIMEOUT`](crate::config::DEFAULT_SEND_TIMEOUT) if `timeout` is `None`.
    pub async fn send(
        &self,
        message: &ServiceBusMessage,
        timeout: Option<Duration>,
    ) -> Result<(), ServiceBusError> {
        self.0
            .sender
            .send(message, timeout.unwrap_or(DEFAULT_SEND_TIMEOUT))
            .await
    }

    /// Whether a send could currently be attempted.
    pub async fn can_send(&self) -> bool {
        self.0.sender.can_send().await
    }

    /// Tears down the sender's link without affecting any receiver.
    pub async fn dispose_sender(&self) {
        self.0.sender.dispose().await;
    }

    /// Subscribes to `SENDER_DETACHED`/`SENDER_REATTACHED` events for this queue's sender.
    pub fn sender_events(&self) -> EventStream<EntityEvent> {
        self.0.ensure_forwarder();
        self.0.events.subscribe()
    }

    /// Starts a peek-lock streaming receiver on the queue itself.
    pub fn on_message<H, Fut>(&self, options: ReceiverOptions, handler: H) -> MessageListener
    where
        H: Fn(Arc<ServiceBusMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ServiceBusError>> + Send + 'static,
    {
        MessageListener::start(self.0.pool.clone(), self.0.name.clone(), options, handler)
    }

    /// Starts a peek-lock streaming receiver on the queue's dead-letter sub-queue.
    pub fn on_dead_lettered_message<H, Fut>(
        &self,
        options: ReceiverOptions,
        handler: H,
    ) -> MessageListener
    where
        H: Fn(Arc<ServiceBusMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ServiceBusError>> + Send + 'static,
    {
        MessageListener::start(self.0.pool.clone(), self.0.dead_letter_path(), options, handler)
    }

    /// Pulls up to `max_messages` from the queue, waiting at most `timeout`
    /// (defaults to [`SERVICE_BUS_SERVER_TIMEOUT`](crate::config::SERVICE_BUS_SERVER_TIMEOUT)).
    pub async fn receive_batch(
        &self,
        max_messages: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceBusMessage>, ServiceBusError> {
        batch::receive_batch(
            &self.0.pool,
            &self.0.name,
            max_messages,
            timeout.unwrap_or(SERVICE_BUS_SERVER_TIMEOUT),
        )
        .await
    }

    /// Pulls up to `max_messages` from the queue's dead-letter sub-queue.
    pub async fn receive_dead_lettered_batch(
        &self,
        max_messages: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceBusMessage>, ServiceBusError> {
        batch::receive_batch(
            &self.0.pool,
            &self.0.dead_letter_path(),
            max_messages,
            timeout.unwrap_or(SERVICE_BUS_SERVER_TIMEOUT),
        )
        .await
    }
}

struct TopicHandleInner {
    pool: ConnectionPool,
    name: String,
    sender: Sender,
    events: Arc<EventSink<EntityEvent>>,
    forwarder_started: AtomicBool,
    /// Cached `<topic>/Subscriptions/<sub>` (and its dead-letter sibling)
    /// address strings, keyed by subscription name, so repeated receiver
    /// calls for the same subscription don't reformat the path each time.
    subscription_paths: parking_lot::Mutex<HashMap<String, Arc<(String, String)>>>,
}

impl TopicHandleInner {
    fn new(pool: ConnectionPool, name: &str) -> Self {
        let sender = Sender::new(pool.clone(), name);
        let events = Arc::new(EventSink::new());
        TopicHandleInner {
            pool,
            name: name.to_string(),
            sender,
            events,
            forwarder_started: AtomicBool::new(false),
            subscription_paths: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the sender-event forwarder on first use. Deferred out of `new`
    /// so that building a handle never requires an active Tokio runtime.
    fn ensure_forwarder(&self) {
        if self.forwarder_started.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_sender_event_forwarder(&self.sender, self.events.clone());
    }

    fn paths_for(&self, subscription_name: &str) -> Arc<(String, String)> {
        self.subscription_paths
            .lock()
            .entry(subscription_name.to_string())
            .or_insert_with(|| {
                let main = subscription_path(&self.name, subscription_name);
                let dlq = dead_letter_path(&main);
                Arc::new((main, dlq))
            })
            .clone()
    }
}

/// A handle to one topic: its sender plus, per subscription name, every
/// receiver operation for both the subscription and its dead-letter queue.
#[derive(Clone)]
pub struct TopicHandle(Arc<TopicHandleInner>);

impl TopicHandle {
    /// Sends `message` to the topic.
    pub async fn send(
        &self,
        message: &ServiceBusMessage,
        timeout: Option<Duration>,
    ) -> Result<(), ServiceBusError> {
        self.0
            .sender
            .send(message, timeout.unwrap_or(DEFAULT_SEND_TIMEOUT))
            .await
    }

    /// Whether a send could currently be attempted.
    pub async fn can_send(&self) -> bool {
        self.0.sender.can_send().await
    }

    /// Tears down the sender's link without affecting any receiver.
    pub async fn dispose_sender(&self) {
        self.0.sender.dispose().await;
    }

    /// Subscribes to `SENDER_DETACHED`/`SENDER_REATTACHED` events for this topic's sender.
    pub fn sender_events(&self) -> EventStream<EntityEvent> {
        self.0.ensure_forwarder();
        self.0.events.subscribe()
    }

    /// Starts a peek-lock streaming receiver on `subscription_name`.
    pub fn on_message<H, Fut>(
        &self,
        subscription_name: &str,
        options: ReceiverOptions,
        handler: H,
    ) -> MessageListener
    where
        H: Fn(Arc<ServiceBusMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ServiceBusError>> + Send + 'static,
    {
        let (main, _) = &*self.0.paths_for(subscription_name);
        MessageListener::start(self.0.pool.clone(), main.clone(), options, handler)
    }

    /// Starts a peek-lock streaming receiver on `subscription_name`'s dead-letter queue.
    pub fn on_dead_lettered_message<H, Fut>(
        &self,
        subscription_name: &str,
        options: ReceiverOptions,
        handler: H,
    ) -> MessageListener
    where
        H: Fn(Arc<ServiceBusMessage>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ServiceBusError>> + Send + 'static,
    {
        let (_, dlq) = &*self.0.paths_for(subscription_name);
        MessageListener::start(self.0.pool.clone(), dlq.clone(), options, handler)
    }

    /// Pulls up to `max_messages` from `subscription_name`.
    pub async fn receive_batch(
        &self,
        subscription_name: &str,
        max_messages: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceBusMessage>, ServiceBusError> {
        let (main, _) = &*self.0.paths_for(subscription_name);
        batch::receive_batch(
            &self.0.pool,
            main,
            max_messages,
            timeout.unwrap_or(SERVICE_BUS_SERVER_TIMEOUT),
        )
        .await
    }

    /// Pulls up to `max_messages` from `subscription_name`'s dead-letter queue.
    pub async fn receive_dead_lettered_batch(
        &self,
        subscription_name: &str,
        max_messages: u32,
        timeout: Option<Duration>,
    ) -> Result<Vec<ServiceBusMessage>, ServiceBusError> {
        let (_, dlq) = &*self.0.paths_for(subscription_name);
        batch::receive_batch(
            &self.0.pool,
            dlq,
            max_messages,
            timeout.unwrap_or(SERVICE_BUS_SERVER_TIMEOUT),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CS: &str = "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k";

    #[test]
    fn dead_letter_path_matches_spec_grammar() {
        assert_eq!(dead_letter_path("q1"), "q1/$DeadLetterQueue");
    }

    #[test]
    fn subscription_paths_match_spec_grammar() {
        assert_eq!(subscription_path("t1", "s1"), "t1/Subscriptions/s1");
        assert_eq!(
            dead_letter_path(&subscription_path("t1", "s1")),
            "t1/Subscriptions/s1/$DeadLetterQueue"
        );
    }

    #[test]
    fn get_queue_returns_the_same_cached_handle_for_the_same_name() {
        let client = Client::from_connection_string(CS, ClientOptions::default()).unwrap();
        let a = client.get_queue("q1");
        let b = client.get_queue("q1");
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn get_queue_returns_distinct_handles_for_distinct_names() {
        let client = Client::from_connection_string(CS, ClientOptions::default()).unwrap();
        let a = client.get_queue("q1");
        let b = client.get_queue("q2");
        assert!(!Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn get_topic_caches_subscription_paths_per_name() {
        let client = Client::from_connection_string(CS, ClientOptions::default()).unwrap();
        let topic = client.get_topic("t1");
        let first = topic.0.paths_for("sub1");
        let second = topic.0.paths_for("sub1");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
