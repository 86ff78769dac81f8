//! A hand-rolled client for the broker's `$management` request/response node.
//!
//! `fe2o3-amqp-management`'s own [`MgmtClient`] ties `send_request` and
//! `recv_response` to the same call: it sends, then immediately waits for the
//! next delivery on the receiver link, assuming request and response arrive
//! in lockstep. That assumption breaks here: a request is only considered
//! in flight once its *send* settles (accepted/rejected), and from that point
//! it races against the response arriving and against its own timeout — all
//! while a completely different call might already have a request in flight
//! on the same receiver link. So instead of reusing that client, this module
//! attaches its own sender+receiver pair and keeps a correlation map of
//! in-flight requests, with one background task draining the receiver link
//! and dispatching responses (or termination) to whichever call is waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp_types::definitions;
use fe2o3_amqp_types::messaging::{
    message::Body, ApplicationProperties, Message, MessageId, Properties,
};
use fe2o3_amqp_types::primitives::{OrderedMap, SimpleValue, Value};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::config::AMQP_REQUEST_TIMEOUT;
use crate::error::{InternalError, LinkError, ServiceBusError};
use crate::events::{EventSink, EventStream, LinkLifecycleEvent};
use crate::lock_token::LockToken;
use crate::message::message_id_to_string;
use crate::pool::ConnectionLease;

struct ManagementResponse {
    status: u16,
    error_condition: Option<String>,
    tracking_id: Option<String>,
}

type PendingResolver = oneshot::Sender<Result<ManagementResponse, ServiceBusError>>;

struct Inner {
    _session: AsyncMutex<SessionHandle<()>>,
    _lease: ConnectionLease,
    sender: AsyncMutex<Sender>,
    client_node_addr: String,
    pending: parking_lot::Mutex<HashMap<String, PendingResolver>>,
    next_req_id: AtomicU64,
    events: EventSink<LinkLifecycleEvent>,
    dispatcher: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    receiver_attached: AtomicBool,
}

/// Client for one entity's `$management` node: request+response links,
/// correlation tracking, per-request timeouts, and termination of in-flight
/// requests when the response link detaches.
#[derive(Clone)]
pub struct ManagementClient(Arc<Inner>);

impl ManagementClient {
    /// Attaches a management client addressed at `<entity_path>/$management`
    /// over its own session on `lease`.
    pub async fn attach(lease: ConnectionLease, entity_path: &str) -> Result<Self, ServiceBusError> {
        let mut session = lease
            .begin_session()
            .await
            .map_err(|e| LinkError::Detach(Some(e.to_string())))?;

        let mgmt_address = format!("{}/$management", entity_path);
        let client_node_addr = format!("client-node:{}", Uuid::new_v4());
        let sender_name = format!("requestSender${}", Uuid::new_v4());
        let receiver_name = format!("responseReceiver${}", Uuid::new_v4());

        let sender = Sender::builder()
            .name(sender_name)
            .target(Some(mgmt_address.as_str()))
            .attach(&mut session)
            .await
            .map_err(|e| LinkError::Detach(Some(e.to_string())))?;

        let receiver = Receiver::builder()
            .name(receiver_name)
            .source(Some(mgmt_address.as_str()))
            .target(Some(client_node_addr.as_str()))
            .attach(&mut session)
            .await
            .map_err(|e| LinkError::Detach(Some(e.to_string())))?;

        let events: EventSink<LinkLifecycleEvent> = EventSink::new();
        events.emit(LinkLifecycleEvent::Attached {
            name: "responseReceiver".into(),
            path: mgmt_address.clone(),
        });

        let inner = Arc::new(Inner {
            _session: AsyncMutex::new(session),
            _lease: lease,
            sender: AsyncMutex::new(sender),
            client_node_addr,
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(0),
            events,
            dispatcher: AsyncMutex::new(None),
            receiver_attached: AtomicBool::new(true),
        });

        let dispatcher_inner = inner.clone();
        let handle = tokio::spawn(async move {
            Self::dispatch_loop(dispatcher_inner, receiver, mgmt_address).await;
        });
        *inner.dispatcher.lock().await = Some(handle);

        Ok(ManagementClient(inner))
    }

    /// Subscribes to this client's link lifecycle events.
    pub fn events(&self) -> EventStream<LinkLifecycleEvent> {
        self.0.events.subscribe()
    }

    async fn dispatch_loop(inner: Arc<Inner>, mut receiver: Receiver, path: String) {
        loop {
            match receiver.recv::<Body<Value>>().await {
                Ok(delivery) => {
                    let _ = receiver.accept(&delivery).await;
                    let message = delivery.into_message();
                    Self::dispatch_response(&inner, message);
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(path = %path, "management response link detached");
                    #[cfg(feature = "log")]
                    log::warn!("management response link detached: path={path}");
                    inner.receiver_attached.store(false, Ordering::SeqCst);
                    Self::terminate_all_pending(&inner);
                    inner.events.emit(LinkLifecycleEvent::Detached {
                        name: "responseReceiver".into(),
                        path,
                        info: None,
                    });
                    return;
                }
            }
        }
    }

    fn dispatch_response(inner: &Arc<Inner>, message: Message<Body<Value>>) {
        let Some(properties) = message.properties.as_ref() else {
            return;
        };
        let Some(correlation_id) = properties.correlation_id.clone() else {
            return;
        };
        let correlation_id = message_id_to_string(correlation_id);

        let resolver = inner.pending.lock().remove(&correlation_id);
        let Some(resolver) = resolver else {
            #[cfg(feature = "tracing")]
            tracing::debug!(correlation_id = %correlation_id, "received response with unrecognized correlation id");
            #[cfg(feature = "log")]
            log::debug!("received response with unrecognized correlation id: correlation_id={correlation_id}");
            return;
        };

        let application_properties = message
            .application_properties
            .as_ref()
            .map(|p| &p.0)
            .cloned()
            .unwrap_or_default();
        let status = application_properties
            .get("statusCode")
            .and_then(simple_value_to_u16)
            .unwrap_or(200);
        let error_condition = application_properties
            .get("statusDescription")
            .and_then(simple_value_to_string);
        let tracking_id = application_properties
            .get("trackingId")
            .and_then(simple_value_to_string);

        let _ = resolver.send(Ok(ManagementResponse {
            status,
            error_condition,
            tracking_id,
        }));
    }

    fn terminate_all_pending(inner: &Arc<Inner>) {
        let pending: Vec<_> = inner.pending.lock().drain().collect();
        for (_, resolver) in pending {
            let _ = resolver.send(Err(InternalError::RequestTerminated.into()));
        }
    }

    /// Whether a request can currently be sent: both links must be attached.
    /// This implementation has no separate attached/detached tracking beyond
    /// the dispatcher loop's lifetime, so it reports `true` until the
    /// dispatcher has observed a detach.
    pub fn can_send(&self) -> bool {
        !self.0.dispatcher.try_lock().map(|g| g.is_none()).unwrap_or(false)
    }

    /// Whether the response receiver link is still attached. Once the
    /// dispatcher loop observes a detach it clears this and it never comes
    /// back; a fresh `ManagementClient` must be attached instead.
    fn receiver_attached(&self) -> bool {
        self.0.receiver_attached.load(Ordering::SeqCst)
    }

    async fn call(
        &self,
        operation: &'static str,
        body: Value,
        extra_properties: Vec<(&'static str, SimpleValue)>,
    ) -> Result<ManagementResponse, ServiceBusError> {
        if !self.can_send() || !self.receiver_attached() {
            return Err(InternalError::RequestFailure {
                status: 503,
                error_condition: None,
                tracking_id: None,
            }
            .into());
        }

        let req_id = self.0.next_req_id.fetch_add(1, Ordering::SeqCst);
        let correlation_id = format!("{}-{}", Uuid::new_v4(), req_id);

        let (tx, rx) = oneshot::channel();
        self.0.pending.lock().insert(correlation_id.clone(), tx);

        let mut application_properties = BTreeMap::new();
        application_properties.insert("operation".to_string(), SimpleValue::from(operation));
        application_properties.insert(
            "com.microsoft:server-timeout".to_string(),
            SimpleValue::from(AMQP_REQUEST_TIMEOUT.as_millis() as u32),
        );
        for (key, value) in extra_properties {
            application_properties.insert(key.to_string(), value);
        }

        let properties = Properties {
            message_id: Some(MessageId::String(correlation_id.clone())),
            reply_to: Some(self.0.client_node_addr.clone()),
            ..Properties::new()
        };

        // `.value(body)` sets `Body::Value(AmqpValue(body))`, i.e. the
        // `amqp-value` body section with descriptor `0x77` the `$management`
        // node protocol requires for request/response bodies.
        let message = Message::builder()
            .value(body)
            .properties(properties)
            .application_properties(ApplicationProperties(application_properties))
            .build();

        // Race the send-ack against the response arriving: the dispatcher
        // loop already has `tx` installed in `pending`, so a response that
        // beats the send-ack home (an observed broker behavior) is handled
        // correctly regardless of which branch below fires first.
        let inner = self.0.clone();
        let send_fut = async move {
            let mut sender = inner.sender.lock().await;
            sender.send(message).await
        };
        tokio::pin!(send_fut);

        let timeout = tokio::time::sleep(AMQP_REQUEST_TIMEOUT);
        tokio::pin!(timeout);

        let mut awaiting_send_ack = true;
        loop {
            tokio::select! {
                send_result = &mut send_fut, if awaiting_send_ack => {
                    awaiting_send_ack = false;
                    if let Err(err) = send_result {
                        self.0.pending.lock().remove(&correlation_id);
                        return Err(LinkError::Detach(Some(err.to_string())).into());
                    }
                }
                result = &mut rx => {
                    return match result {
                        Ok(Ok(response)) => {
                            if (200..300).contains(&response.status) {
                                Ok(response)
                            } else {
                                Err(InternalError::RequestFailure {
                                    status: response.status,
                                    error_condition: response.error_condition,
                                    tracking_id: response.tracking_id,
                                }.into())
                            }
                        }
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(InternalError::RequestTerminated.into()),
                    };
                }
                _ = &mut timeout => {
                    self.0.pending.lock().remove(&correlation_id);
                    return Err(InternalError::RequestTimeout.into());
                }
            }
        }
    }

    /// Requests the broker renew a peek-locked message's lock, returning
    /// nothing on success (the new `lockedUntilUtc` is applied by the caller
    /// from the message's own re-delivery state, per the broker's contract).
    pub async fn renew_lock(&self, token: LockToken) -> Result<(), ServiceBusError> {
        let reordered = token.to_reordered_bytes();
        let uuid = Uuid::from_bytes(reordered);
        let mut map = indexmap::IndexMap::new();
        map.insert(
            Value::String("lock-tokens".to_string()),
            Value::Array(vec![Value::Uuid(uuid)].into()),
        );

        self.call(
            "com.microsoft:renew-lock",
            Value::Map(OrderedMap::from(map)),
            Vec::new(),
        )
        .await?;
        Ok(())
    }

    /// Detaches both links and ends the session, terminating any requests
    /// still in flight. Safe to call more than once.
    pub async fn dispose(&self) {
        if let Some(handle) = self.0.dispatcher.lock().await.take() {
            handle.abort();
        }
        Self::terminate_all_pending(&self.0);
        let mut session = self.0._session.lock().await;
        let _ = session.close().await;
    }
}

fn simple_value_to_u16(value: &SimpleValue) -> Option<u16> {
    match value {
        SimpleValue::UInt(v) => Some(*v as u16),
        SimpleValue::Int(v) => Some(*v as u16),
        SimpleValue::UShort(v) => Some(*v),
        SimpleValue::Short(v) => Some(*v as u16),
        _ => None,
    }
}

fn simple_value_to_string(value: &SimpleValue) -> Option<String> {
    match value {
        SimpleValue::String(s) => Some(s.clone()),
        SimpleValue::Symbol(s) => Some(s.0.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_lock_body_reorders_token_bytes() {
        let token = LockToken([
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ]);
        let reordered = token.to_reordered_bytes();
        assert_eq!(
            reordered,
            [
                0x03, 0x02, 0x01, 0x00, 0x05, 0x04, 0x07, 0x06, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
                0x0d, 0x0e, 0x0f,
            ]
        );
    }

    #[test]
    fn status_in_2xx_range_is_considered_success() {
        assert!((200..300).contains(&200u16));
        assert!((200..300).contains(&299u16));
        assert!(!(200..300).contains(&503u16));
    }
}
