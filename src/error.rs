//! Error taxonomy for the Service Bus core.
//!
//! Every error produced by this crate is tagged with a hierarchical name
//! (`Link.Detach`, `Send.Timeout`, `Amqp.NotFound`, ...) so that callers can
//! match on the kind of failure the way the broker's own clients do, rather
//! than on an opaque string.

use fe2o3_amqp_types::definitions::AmqpError as WireAmqpError;
use thiserror::Error;

/// Top-level error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ServiceBusError {
    /// The classified error.
    pub kind: ServiceBusErrorKind,
}

impl ServiceBusError {
    /// The dotted tag used throughout the specification and in logs, e.g. `"Send.Timeout"`.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl<K> From<K> for ServiceBusError
where
    K: Into<ServiceBusErrorKind>,
{
    fn from(kind: K) -> Self {
        ServiceBusError { kind: kind.into() }
    }
}

/// The classified error kind. See the module docs for the naming convention.
#[derive(Debug, Error)]
pub enum ServiceBusErrorKind {
    /// `Link.*`
    #[error(transparent)]
    Link(#[from] LinkError),

    /// `Message.*`
    #[error(transparent)]
    Message(#[from] MessageError),

    /// `Internal.*`
    #[error(transparent)]
    Internal(#[from] InternalError),

    /// `Send.*`
    #[error(transparent)]
    Send(#[from] SendErrorKind),

    /// `Amqp.*`, mapped from the wire condition carried by a transport error.
    #[error("{condition:?}: {}", description.as_deref().unwrap_or(""))]
    Amqp {
        /// The AMQP error condition reported by the peer.
        condition: WireAmqpError,
        /// The free-text description attached to the condition, if any.
        description: Option<String>,
    },

    /// An error shape that could not be classified at all; falls through to
    /// [`InternalError::Unknown`] in the specification's own terms but is kept
    /// distinct here so that a caller can tell "we understood this failure and
    /// it genuinely has no more specific cause" apart from the `Amqp` variants.
    #[error("unclassified error: {0}")]
    Unknown(String),
}

impl ServiceBusErrorKind {
    /// The dotted tag used throughout the specification and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceBusErrorKind::Link(e) => e.name(),
            ServiceBusErrorKind::Message(e) => e.name(),
            ServiceBusErrorKind::Internal(e) => e.name(),
            ServiceBusErrorKind::Send(e) => e.name(),
            ServiceBusErrorKind::Amqp { condition, .. } => amqp_condition_name(condition),
            ServiceBusErrorKind::Unknown(_) => "Internal.Unknown",
        }
    }
}

/// `Link.*` — failures tied to the state of an AMQP link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link detached, carrying whatever error information the peer sent (if any).
    #[error("link detached: {0:?}")]
    Detach(Option<String>),

    /// An operation was attempted against a link that does not exist (e.g. a credit
    /// manager with no bound receiver).
    #[error("link not found")]
    NotFound,

    /// A settlement method was invoked on a message whose credit manager reference
    /// is gone.
    #[error("credit manager is not attached to a receiver link")]
    CreditManagerMissing,
}

impl LinkError {
    fn name(&self) -> &'static str {
        match self {
            LinkError::Detach(_) => "Link.Detach",
            LinkError::NotFound => "Link.NotFound",
            LinkError::CreditManagerMissing => "Link.CreditManagerMissing",
        }
    }
}

/// `Message.*` — failures while settling or renewing the lock on a brokered message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// `renewLock` did not receive a response within the management request timeout.
    #[error("lock renewal timed out")]
    LockRenewalTimeout,

    /// `renewLock` failed for a reason other than a timeout.
    #[error("lock renewal failed: {0}")]
    LockRenewalFailure(String),

    /// A settlement method (`complete`/`abandon`/`deadLetter`) was called while the
    /// message was not in a settleable state.
    #[error("cannot settle message in state {state}")]
    SettleFailure {
        /// Name of the `processingState` the message was in when settlement was attempted.
        state: &'static str,
    },
}

impl MessageError {
    fn name(&self) -> &'static str {
        match self {
            MessageError::LockRenewalTimeout => "Message.LockRenewalTimeout",
            MessageError::LockRenewalFailure(_) => "Message.LockRenewalFailure",
            MessageError::SettleFailure { .. } => "Message.SettleFailure",
        }
    }
}

/// `Internal.*` — failures internal to the management request/response plumbing.
#[derive(Debug, Error)]
pub enum InternalError {
    /// Catch-all for conditions that don't fit any other `Internal.*` tag.
    #[error("unknown internal error")]
    Unknown,

    /// A management request exceeded `amqpRequestTimeout` (15s) waiting for a response.
    #[error("management request timed out")]
    RequestTimeout,

    /// A management request failed with a non-2xx status.
    #[error("management request failed with status {status}")]
    RequestFailure {
        /// HTTP-style status code reported in the response (e.g. 503, 504).
        status: u16,
        /// The AMQP error condition attached to the failure, if any.
        error_condition: Option<String>,
        /// The broker's tracking id for the failed request, if any.
        tracking_id: Option<String>,
    },

    /// The response receiver link detached while the request was still in flight.
    #[error("management request terminated by link detach")]
    RequestTerminated,

    /// A management response arrived whose correlation id matched no pending request.
    #[error("received a management response with an unrecognized correlation id")]
    OrphanedResponse,
}

impl InternalError {
    fn name(&self) -> &'static str {
        match self {
            InternalError::Unknown => "Internal.Unknown",
            InternalError::RequestTimeout => "Internal.RequestTimeout",
            InternalError::RequestFailure { .. } => "Internal.RequestFailure",
            InternalError::RequestTerminated => "Internal.RequestTerminated",
            InternalError::OrphanedResponse => "Internal.OrphanedResponse",
        }
    }
}

/// `Send.*` — failures specific to [`crate::sender::Sender::send`].
#[derive(Debug, Error)]
pub enum SendErrorKind {
    /// The send future did not resolve within the caller-supplied timeout.
    #[error("send timed out")]
    Timeout,

    /// The broker returned a `rejected` disposition for the delivery.
    #[error("message was rejected by the broker")]
    Rejected,

    /// The sender has already been disposed.
    #[error("sender has been disposed")]
    Disposed,
}

impl SendErrorKind {
    fn name(&self) -> &'static str {
        match self {
            SendErrorKind::Timeout => "Send.Timeout",
            SendErrorKind::Rejected => "Send.Rejected",
            SendErrorKind::Disposed => "Send.Disposed",
        }
    }
}

fn amqp_condition_name(condition: &WireAmqpError) -> &'static str {
    match condition {
        WireAmqpError::InternalError => "Amqp.InternalError",
        WireAmqpError::NotFound => "Amqp.NotFound",
        WireAmqpError::UnauthorizedAccess => "Amqp.UnauthorizedAccess",
        WireAmqpError::DecodeError => "Amqp.DecodeError",
        WireAmqpError::ResourceLimitExceeded => "Amqp.ResourceLimitExceeded",
        WireAmqpError::NotAllowed => "Amqp.NotAllowed",
        WireAmqpError::InvalidField => "Amqp.InvalidField",
        WireAmqpError::NotImplemented => "Amqp.NotImplemented",
        WireAmqpError::ResourceLocked => "Amqp.ResourceLocked",
        WireAmqpError::PreconditionFailed => "Amqp.PreconditionFailed",
        WireAmqpError::ResourceDeleted => "Amqp.ResourceDeleted",
        WireAmqpError::IllegalState => "Amqp.IllegalState",
        WireAmqpError::FrameSizeTooSmall => "Amqp.FrameSizeTooSmall",
    }
}

/// Maps a raw transport-level AMQP error condition onto this crate's error taxonomy.
///
/// Any condition the transport might report is one of [`WireAmqpError`]'s variants, so
/// this mapping is total; there is no `Amqp.Unknown` case to fall into in practice, but
/// callers that receive an error shape the transport doesn't expose as a typed condition
/// at all (a raw detach with no error, a dropped channel, ...) should fall back to
/// [`InternalError::Unknown`] instead of calling this function.
pub fn map_amqp_condition(condition: WireAmqpError, description: Option<String>) -> ServiceBusError {
    ServiceBusErrorKind::Amqp {
        condition,
        description,
    }
    .into()
}

/// Classifies a transport-level error from `fe2o3-amqp`'s `Sender`/`Receiver`
/// (`SendError`, `RecvError`, ...) onto this crate's taxonomy.
///
/// The concrete transport error types don't expose their wire condition
/// through a dedicated accessor, so this walks the `std::error::Error`
/// source chain looking for a [`WireAmqpError`] and routes it through
/// [`map_amqp_condition`] when found. Anything that doesn't carry a
/// classifiable condition (a raw detach with no error, a dropped channel,
/// ...) falls back to `Link.Detach`.
pub fn classify_transport_error(err: &(dyn std::error::Error + 'static)) -> ServiceBusError {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cause {
        if let Some(condition) = e.downcast_ref::<WireAmqpError>() {
            return map_amqp_condition(condition.clone(), Some(err.to_string()));
        }
        cause = e.source();
    }
    LinkError::Detach(Some(err.to_string())).into()
}
