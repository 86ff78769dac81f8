//! `ServiceBusMessage`: the application-facing wrapper around an AMQP
//! message, covering both the outbound construction path and the
//! inbound peek-locked delivery path, plus the settlement primitives
//! that move a received message through accept/reject/modify.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fe2o3_amqp::link::Delivery;
use fe2o3_amqp_types::messaging::{
    message::Body, ApplicationProperties, Message, MessageAnnotations, MessageId, Properties,
};
use fe2o3_amqp_types::primitives::{SimpleValue, Symbol, Timestamp, Value};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::credit::CreditManager;
use crate::error::{LinkError, MessageError, ServiceBusError};
use crate::lock_token::LockToken;

/// `messageAnnotations` keys the broker uses for fields that don't have a
/// dedicated slot in the AMQP `properties` section. These travel in the
/// `message-annotations` section of the wire message, not
/// `application-properties`.
mod annotation_keys {
    pub const PARTITION_KEY: &str = "x-opt-partition-key";
    pub const SCHEDULED_ENQUEUE_TIME: &str = "x-opt-scheduled-enqueue-time";
    pub const LOCKED_UNTIL: &str = "x-opt-locked-until";
    pub const ENQUEUED_SEQUENCE_NUMBER: &str = "x-opt-enqueue-sequence-number";
    pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";
}

/// Where a received message currently stands with respect to settlement.
///
/// A message starts `Active`. A call to `complete`/`abandon`/`dead_letter`
/// with no delay moves it straight to `Settled` (or `SettleFailed` if the
/// disposition round-trip itself errored); a call with a delay moves it
/// to `Settling` until the delayed disposition actually fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// Not a received message (built locally for sending), or not yet acted on.
    None,
    /// Received and not yet settled.
    Active,
    /// A delayed settlement has been scheduled but has not fired yet.
    Settling,
    /// Settlement completed successfully.
    Settled,
    /// A settlement attempt was made and failed.
    SettleFailed,
}

/// The three dispositions a peek-locked message can be settled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Complete,
    Abandon,
    DeadLetter,
}

/// State shared between a `ServiceBusMessage` and any delayed-settlement
/// timer spawned on its behalf.
struct Inner {
    state: Mutex<ProcessingState>,
}

/// An application message: either constructed locally for sending, or
/// received from a peek-lock receiver and pending settlement.
pub struct ServiceBusMessage {
    /// The message body, as an opaque byte payload.
    pub body: Vec<u8>,
    /// Arbitrary application-defined properties.
    pub properties: BTreeMap<String, String>,
    /// The `content-type` of the body, if set.
    pub content_type: Option<String>,
    /// Correlates this message with another, e.g. a request/response pair.
    pub correlation_id: Option<String>,
    /// Application-defined identifier for this message. Defaults to a
    /// fresh v4 UUID if not set before sending.
    pub message_id: String,
    /// The subject/label of the message.
    pub label: Option<String>,
    /// The address a reply to this message should be sent to.
    pub reply_to: Option<String>,
    /// The session a reply to this message belongs to.
    pub reply_to_session_id: Option<String>,
    /// The partition-routing key.
    pub partition_key: Option<String>,
    /// The session this message belongs to.
    pub session_id: Option<String>,
    /// When set, the broker holds the message back until this time.
    pub scheduled_enqueue_time_utc: Option<Timestamp>,
    /// How long the broker keeps the message before it expires.
    pub time_to_live: Option<Duration>,
    /// The logical destination address.
    pub to: Option<String>,

    /// How many times the broker has delivered this message. Inbound only.
    pub delivery_count: u32,
    /// The sequence number the message was enqueued at. Inbound only.
    pub enqueued_sequence_number: Option<i64>,
    /// When the broker enqueued the message. Inbound only.
    pub enqueued_time_utc: Option<Timestamp>,
    /// When the current peek-lock expires. Inbound only.
    pub locked_until_utc: Option<Timestamp>,
    /// When the message itself expires. Inbound only.
    pub expires_at_utc: Option<Timestamp>,
    /// The broker-assigned sequence number. Inbound only.
    pub sequence_number: Option<i64>,
    /// The peek-lock token, present only for peek-locked deliveries.
    pub lock_token: Option<LockToken>,

    inner: Arc<Inner>,
    delivery: Option<Delivery<Body<Value>>>,
    credit_manager: Option<Arc<CreditManager>>,
}

impl ServiceBusMessage {
    /// Builds a new outbound message carrying `body`, with a freshly
    /// generated message ID.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        ServiceBusMessage {
            body: body.into(),
            properties: BTreeMap::new(),
            content_type: None,
            correlation_id: None,
            message_id: Uuid::new_v4().to_string(),
            label: None,
            reply_to: None,
            reply_to_session_id: None,
            partition_key: None,
            session_id: None,
            scheduled_enqueue_time_utc: None,
            time_to_live: None,
            to: None,
            delivery_count: 0,
            enqueued_sequence_number: None,
            enqueued_time_utc: None,
            locked_until_utc: None,
            expires_at_utc: None,
            sequence_number: None,
            lock_token: None,
            inner: Arc::new(Inner {
                state: Mutex::new(ProcessingState::None),
            }),
            delivery: None,
            credit_manager: None,
        }
    }

    /// The current processing state of a received message.
    pub fn processing_state(&self) -> ProcessingState {
        *self.inner.state.lock()
    }

    /// Builds the outbound wire message for `Sender::send`.
    pub(crate) fn to_outbound(&self) -> Message<Body<Value>> {
        let mut application_properties = BTreeMap::new();
        for (k, v) in &self.properties {
            application_properties.insert(k.clone(), SimpleValue::from(v.clone()));
        }

        let mut message_annotations = BTreeMap::new();
        if let Some(key) = &self.partition_key {
            message_annotations.insert(
                Symbol::from(annotation_keys::PARTITION_KEY),
                Value::String(key.clone()),
            );
        }
        if let Some(scheduled) = &self.scheduled_enqueue_time_utc {
            message_annotations.insert(
                Symbol::from(annotation_keys::SCHEDULED_ENQUEUE_TIME),
                Value::Long(scheduled.milliseconds()),
            );
        }

        let properties = Properties {
            message_id: Some(MessageId::String(self.message_id.clone())),
            user_id: None,
            to: self.to.clone(),
            subject: self.label.clone(),
            reply_to: self.reply_to.clone(),
            correlation_id: self.correlation_id.clone().map(MessageId::String),
            content_type: self.content_type.clone().map(Into::into),
            content_encoding: None,
            absolute_expiry_time: None,
            creation_time: None,
            group_id: self.session_id.clone(),
            group_sequence: None,
            reply_to_group_id: self.reply_to_session_id.clone(),
        };

        let header = self.time_to_live.map(|ttl| fe2o3_amqp_types::messaging::Header {
            ttl: Some(ttl.as_millis() as u32),
            ..Default::default()
        });

        Message::builder()
            .data(self.body.clone())
            .properties(properties)
            .application_properties(ApplicationProperties(application_properties))
            .message_annotations(MessageAnnotations(message_annotations))
            .header(header)
            .build()
    }

    /// Builds a `ServiceBusMessage` from an inbound delivery.
    ///
    /// `initially_settled` is `true` for a receive-and-delete or batch
    /// delivery (the broker already considers it settled; the returned
    /// message starts in [`ProcessingState::Settled`] and
    /// `complete`/`abandon`/`dead_letter` will fail on it). `credit_manager`
    /// is `None` for a transient batch receiver, which has no ongoing credit
    /// policy to maintain.
    pub(crate) fn from_delivery(
        delivery: Delivery<Body<Value>>,
        initially_settled: bool,
        credit_manager: Option<Arc<CreditManager>>,
    ) -> Self {
        let lock_token = LockToken::from_delivery_tag(delivery.delivery_tag());
        let message = delivery.message();
        let properties = message.properties.as_ref();
        let application_properties = message
            .application_properties
            .as_ref()
            .map(|p| &p.0)
            .cloned()
            .unwrap_or_default();
        let message_annotations = message
            .message_annotations
            .as_ref()
            .map(|a| &a.0)
            .cloned()
            .unwrap_or_default();

        let body = message
            .body
            .try_as_data()
            .map(|data| data.as_ref().to_vec())
            .unwrap_or_default();

        let string_props: BTreeMap<String, String> = application_properties
            .iter()
            .map(|(k, v)| (k.clone(), simple_value_to_string(v)))
            .collect();

        let partition_key = message_annotations
            .get(&Symbol::from(annotation_keys::PARTITION_KEY))
            .map(value_to_string);
        let enqueued_sequence_number = message_annotations
            .get(&Symbol::from(annotation_keys::ENQUEUED_SEQUENCE_NUMBER))
            .and_then(value_to_i64);
        let sequence_number = message_annotations
            .get(&Symbol::from(annotation_keys::SEQUENCE_NUMBER))
            .and_then(value_to_i64);
        let locked_until_utc = message_annotations
            .get(&Symbol::from(annotation_keys::LOCKED_UNTIL))
            .and_then(value_to_i64)
            .map(Timestamp::from_milliseconds);

        let header = message.header.as_ref();

        ServiceBusMessage {
            body,
            properties: string_props,
            content_type: properties.and_then(|p| p.content_type.clone()).map(Into::into),
            correlation_id: properties
                .and_then(|p| p.correlation_id.clone())
                .map(message_id_to_string),
            message_id: properties
                .and_then(|p| p.message_id.clone())
                .map(message_id_to_string)
                .unwrap_or_default(),
            label: properties.and_then(|p| p.subject.clone()),
            reply_to: properties.and_then(|p| p.reply_to.clone()),
            reply_to_session_id: properties.and_then(|p| p.reply_to_group_id.clone()),
            partition_key,
            session_id: properties.and_then(|p| p.group_id.clone()),
            scheduled_enqueue_time_utc: None,
            time_to_live: header.and_then(|h| h.ttl).map(|ms| Duration::from_millis(ms as u64)),
            to: properties.and_then(|p| p.to.clone()),
            delivery_count: header.map(|h| h.delivery_count).unwrap_or(0),
            enqueued_sequence_number,
            enqueued_time_utc: properties.and_then(|p| p.creation_time),
            locked_until_utc,
            expires_at_utc: properties.and_then(|p| p.absolute_expiry_time),
            sequence_number,
            lock_token,
            inner: Arc::new(Inner {
                state: Mutex::new(if initially_settled {
                    ProcessingState::Settled
                } else {
                    ProcessingState::Active
                }),
            }),
            delivery: Some(delivery),
            credit_manager,
        }
    }

    /// Accepts the message: the broker will not redeliver it.
    ///
    /// If `delay` is set, the accept is deferred: the credit this message
    /// holds is returned to the pool immediately (so the receiver keeps
    /// making progress) but the actual disposition frame is sent only once
    /// the delay elapses.
    pub async fn complete(&self, delay: Option<Duration>) -> Result<(), ServiceBusError> {
        self.settle(Settlement::Complete, delay).await
    }

    /// Releases the message back to the broker for immediate redelivery.
    pub async fn abandon(&self, delay: Option<Duration>) -> Result<(), ServiceBusError> {
        self.settle(Settlement::Abandon, delay).await
    }

    /// Rejects the message into the entity's dead-letter sub-queue.
    pub async fn dead_letter(&self, delay: Option<Duration>) -> Result<(), ServiceBusError> {
        self.settle(Settlement::DeadLetter, delay).await
    }

    async fn settle(
        &self,
        disposition: Settlement,
        delay: Option<Duration>,
    ) -> Result<(), ServiceBusError> {
        let Some(delivery) = &self.delivery else {
            return Err(MessageError::SettleFailure {
                state: "not a received message",
            }
            .into());
        };
        let Some(credit_manager) = &self.credit_manager else {
            return Err(LinkError::CreditManagerMissing.into());
        };
        let Some(token) = self.lock_token else {
            return Err(MessageError::SettleFailure {
                state: "no lock token",
            }
            .into());
        };

        {
            let state = *self.inner.state.lock();
            if state != ProcessingState::Active {
                return Err(MessageError::SettleFailure {
                    state: processing_state_name(state),
                }
                .into());
            }
        }

        if let Some(delay) = delay {
            *self.inner.state.lock() = ProcessingState::Settling;
            credit_manager.schedule_message_settle(token).await;
            tokio::time::sleep(delay).await;
            let result = Self::apply_disposition(disposition, delivery, credit_manager).await;
            *self.inner.state.lock() = result_state(&result);
            credit_manager.settle_message(token).await;
            return result;
        }

        let result = Self::apply_disposition(disposition, delivery, credit_manager).await;
        *self.inner.state.lock() = result_state(&result);
        credit_manager.settle_message(token).await;
        result
    }

    async fn apply_disposition(
        disposition: Settlement,
        delivery: &Delivery<Body<Value>>,
        credit_manager: &CreditManager,
    ) -> Result<(), ServiceBusError> {
        match disposition {
            Settlement::Complete => credit_manager.accept(delivery).await,
            Settlement::Abandon => credit_manager.release(delivery).await,
            Settlement::DeadLetter => credit_manager.dead_letter(delivery, None).await,
        }
    }

    /// Requests a renewal of this message's peek-lock, re-raising the
    /// management client's `Internal.*` errors as their `Message.*`
    /// equivalents.
    pub async fn renew_lock(
        &self,
        management: &crate::management::ManagementClient,
    ) -> Result<(), ServiceBusError> {
        let Some(token) = self.lock_token else {
            return Err(MessageError::SettleFailure {
                state: "no lock token",
            }
            .into());
        };

        management.renew_lock(token).await.map_err(|err| {
            use crate::error::{InternalError, ServiceBusErrorKind};
            match &err.kind {
                ServiceBusErrorKind::Internal(InternalError::RequestTimeout) => {
                    MessageError::LockRenewalTimeout.into()
                }
                ServiceBusErrorKind::Internal(InternalError::RequestFailure { .. }) => {
                    MessageError::LockRenewalFailure(err.to_string()).into()
                }
                _ => err,
            }
        })
    }
}

fn processing_state_name(state: ProcessingState) -> &'static str {
    match state {
        ProcessingState::None => "None",
        ProcessingState::Active => "Active",
        ProcessingState::Settling => "Settling",
        ProcessingState::Settled => "Settled",
        ProcessingState::SettleFailed => "SettleFailed",
    }
}

fn result_state(result: &Result<(), ServiceBusError>) -> ProcessingState {
    match result {
        Ok(()) => ProcessingState::Settled,
        Err(_) => ProcessingState::SettleFailed,
    }
}

pub(crate) fn message_id_to_string(id: MessageId) -> String {
    match id {
        MessageId::Ulong(v) => v.to_string(),
        MessageId::Uuid(v) => v.to_string(),
        MessageId::Binary(v) => String::from_utf8_lossy(&v).into_owned(),
        MessageId::String(v) => v,
    }
}

fn simple_value_to_string(value: &SimpleValue) -> String {
    match value {
        SimpleValue::String(s) => s.clone(),
        SimpleValue::Symbol(s) => s.0.clone(),
        other => format!("{:?}", other),
    }
}

fn simple_value_to_i64(value: &SimpleValue) -> Option<i64> {
    match value {
        SimpleValue::Long(v) => Some(*v),
        SimpleValue::Int(v) => Some(*v as i64),
        SimpleValue::ULong(v) => Some(*v as i64),
        SimpleValue::UInt(v) => Some(*v as i64),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Symbol(s) => s.0.clone(),
        other => format!("{:?}", other),
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Long(v) => Some(*v),
        Value::Int(v) => Some(*v as i64),
        Value::ULong(v) => Some(*v as i64),
        Value::UInt(v) => Some(*v as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_defaults_to_a_fresh_uuid_message_id() {
        let msg = ServiceBusMessage::new(b"hello".to_vec());
        assert!(Uuid::parse_str(&msg.message_id).is_ok());
        assert_eq!(msg.processing_state(), ProcessingState::None);
    }

    #[test]
    fn two_new_messages_get_distinct_message_ids() {
        let a = ServiceBusMessage::new(b"a".to_vec());
        let b = ServiceBusMessage::new(b"b".to_vec());
        assert_ne!(a.message_id, b.message_id);
    }

    #[tokio::test]
    async fn settling_a_locally_built_message_fails() {
        let msg = ServiceBusMessage::new(b"hello".to_vec());
        let err = msg.complete(None).await.unwrap_err();
        assert_eq!(err.name(), "Message.SettleFailure");
    }
}
