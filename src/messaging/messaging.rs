//! Nimbus Push Messaging
//!
//! Topic and token based message delivery for one app. The process-wide
//! instance registry doubles as the delivery hub: [`send`] routes a message
//! to every registered instance subscribed to its target topic, or to the
//! one holding its target registration token, on a worker task.
//!
//! [`send`]: Messaging::send

use async_stream::stream;
use futures::Stream;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::app::App;
use crate::error::MessagingError;
use crate::future::{Future, FutureRegistry, LastResult};
use crate::messaging::types::{Message, MessagingListener};

/// Global map of app names to Messaging instances; also the delivery hub
static MESSAGING_INSTANCES: Lazy<RwLock<HashMap<String, Messaging>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Nimbus Push Messaging instance
///
/// Each app has at most one Messaging instance (singleton pattern). Use
/// [`Messaging::get_instance`] to obtain or create it.
#[derive(Clone)]
pub struct Messaging {
    inner: Arc<MessagingInner>,
}

struct MessagingInner {
    app_name: String,
    token: String,
    listener: StdRwLock<Option<Arc<dyn MessagingListener>>>,
    topics: StdRwLock<HashSet<String>>,
    message_tx: broadcast::Sender<Message>,
    deleted: AtomicBool,
    futures: Arc<FutureRegistry>,
    last: MessagingLastResults,
}

#[derive(Default)]
struct MessagingLastResults {
    subscribe: LastResult<()>,
    unsubscribe: LastResult<()>,
}

impl Messaging {
    /// Get or create the Messaging instance for `app`
    pub async fn get_instance(app: &App) -> Self {
        let mut instances = MESSAGING_INSTANCES.write().await;

        // Check if instance already exists
        if let Some(messaging) = instances.get(app.name()) {
            return messaging.clone();
        }

        // Create broadcast channel for incoming messages (capacity: 16)
        let (message_tx, _) = broadcast::channel(16);

        let messaging = Messaging {
            inner: Arc::new(MessagingInner {
                app_name: app.name().to_string(),
                token: format!("nimbus-token-{}", Uuid::new_v4().simple()),
                listener: StdRwLock::new(None),
                topics: StdRwLock::new(HashSet::new()),
                message_tx,
                deleted: AtomicBool::new(false),
                futures: Arc::new(FutureRegistry::new()),
                last: MessagingLastResults::default(),
            }),
        };

        debug!(app = %app.name(), "created messaging instance");
        instances.insert(app.name().to_string(), messaging.clone());

        messaging
    }

    /// Name of the app this instance belongs to
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Registration token of this instance
    ///
    /// Tokens identify an instance as a direct-send target; they are minted
    /// at instance creation and stay stable for its lifetime.
    pub fn token(&self) -> Result<String, MessagingError> {
        if self.inner.deleted.load(Ordering::SeqCst) {
            return Err(MessagingError::NoRegistrationToken);
        }
        Ok(self.inner.token.clone())
    }

    /// Install `listener`, replacing any previous one
    ///
    /// The registration token is delivered to the new listener before this
    /// returns; messages arrive on a worker task afterwards.
    pub fn set_listener(&self, listener: Arc<dyn MessagingListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&listener));

        if !self.inner.deleted.load(Ordering::SeqCst) {
            listener.on_token_received(&self.inner.token);
        }
    }

    /// Subscribe this instance to a topic
    ///
    /// `topic` is a plain name matching `[a-zA-Z0-9-_.~%]+`; a leading
    /// `/topics/` prefix is accepted and stripped.
    pub fn subscribe(&self, topic: impl Into<String>) -> Future<()> {
        let topic = topic.into();
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.apply_subscribe(&topic) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.subscribe.set(&future);
        future
    }

    /// Remove this instance's subscription to a topic
    ///
    /// Unsubscribing from a topic the instance never joined succeeds.
    pub fn unsubscribe(&self, topic: impl Into<String>) -> Future<()> {
        let topic = topic.into();
        let future = self.inner.futures.alloc::<()>();
        let handle = future.handle();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            match inner.apply_unsubscribe(&topic) {
                Ok(()) => inner.futures.complete(handle, ()),
                Err(err) => inner.futures.fail(handle, err.code(), err.to_string()),
            }
        });
        self.inner.last.unsubscribe.set(&future);
        future
    }

    /// Send a message through the hub
    ///
    /// [`Message::to`] must name a `/topics/NAME` path or a registration
    /// token. Routing and delivery happen on a worker task; an empty
    /// [`Message::message_id`] is filled with a fresh id, returned through
    /// the delivered copies only.
    pub fn send(&self, message: Message) -> Result<(), MessagingError> {
        // Validate the recipient (error case first)
        if message.to.is_empty() {
            return Err(MessagingError::MissingRecipient);
        }
        if self.inner.deleted.load(Ordering::SeqCst) {
            return Err(MessagingError::NotInitialized);
        }

        let mut message = message;
        if message.message_id.is_empty() {
            message.message_id = Uuid::new_v4().to_string();
        }

        tokio::spawn(async move {
            let instances = MESSAGING_INSTANCES.read().await;
            let targets: Vec<Messaging> = match message.to.strip_prefix("/topics/") {
                Some(topic) => instances
                    .values()
                    .filter(|m| m.inner.subscribed(topic))
                    .cloned()
                    .collect(),
                None => instances
                    .values()
                    .filter(|m| m.inner.token == message.to)
                    .cloned()
                    .collect(),
            };
            drop(instances);

            let mut message = message;
            if message.to.starts_with("/topics/") {
                message.from = message.to.clone();
            }
            debug!(
                to = %message.to,
                targets = targets.len(),
                "routing message"
            );
            for target in targets {
                target.inner.deliver(message.clone());
            }
        });
        Ok(())
    }

    /// Subscribe to messages delivered to this instance
    ///
    /// The stream yields every message the hub routes here, whether or not a
    /// listener is installed.
    pub fn messages(&self) -> Pin<Box<dyn Stream<Item = Message> + Send>> {
        let mut rx = self.inner.message_tx.subscribe();

        Box::pin(stream! {
            loop {
                let message = match rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Ok(m) => m,
                };
                yield message;
            }
        })
    }

    /// Detach the listener and drop every topic subscription
    ///
    /// The instance stays usable; [`set_listener`](Self::set_listener) and
    /// [`subscribe`](Self::subscribe) reattach it.
    pub fn terminate(&self) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!(app = %self.inner.app_name, "messaging terminated");
    }

    /// Future of the most recent [`subscribe`](Self::subscribe) call
    pub fn subscribe_last_result(&self) -> Future<()> {
        self.inner.last.subscribe.get()
    }

    /// Future of the most recent [`unsubscribe`](Self::unsubscribe) call
    pub fn unsubscribe_last_result(&self) -> Future<()> {
        self.inner.last.unsubscribe.get()
    }
}

impl std::fmt::Debug for Messaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messaging")
            .field("app_name", &self.inner.app_name)
            .field("token", &self.inner.token)
            .finish()
    }
}

impl MessagingInner {
    fn ensure_active(&self) -> Result<(), MessagingError> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(MessagingError::NotInitialized);
        }
        Ok(())
    }

    fn apply_subscribe(&self, topic: &str) -> Result<(), MessagingError> {
        self.ensure_active()?;
        let name = normalize_topic(topic)?;
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        debug!(app = %self.app_name, topic = name, "subscribed");
        Ok(())
    }

    fn apply_unsubscribe(&self, topic: &str) -> Result<(), MessagingError> {
        self.ensure_active()?;
        let name = normalize_topic(topic)?;
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        debug!(app = %self.app_name, topic = name, "unsubscribed");
        Ok(())
    }

    fn subscribed(&self, topic: &str) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
    }

    fn deliver(&self, message: Message) {
        // Stream subscribers first; the send only fails with no receivers.
        let _ = self.message_tx.send(message.clone());

        let listener = self
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener.on_message(&message);
        }
    }
}

/// Strip an optional `/topics/` prefix and check the topic name grammar
fn normalize_topic(topic: &str) -> Result<&str, MessagingError> {
    let name = topic.strip_prefix("/topics/").unwrap_or(topic);
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '%'));
    if !valid {
        return Err(MessagingError::InvalidTopicName(topic.to_string()));
    }
    Ok(name)
}

/// Tear down the Messaging instance created for `app_name`
///
/// Called by [`App::delete_app`](crate::App::delete_app). The instance
/// leaves the hub, so no further messages reach it, and later operations
/// fail.
pub(crate) async fn purge_instance(app_name: &str) {
    let removed = MESSAGING_INSTANCES.write().await.remove(app_name);
    if let Some(messaging) = removed {
        messaging.inner.deleted.store(true, Ordering::SeqCst);
        *messaging
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        messaging
            .inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!(app = %app_name, "purged messaging instance");
    }
}
