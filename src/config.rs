//! Defaults and option builders shared by every component.
//!
//! These mirror the constants carried in the specification; nothing here is
//! guessed, each field documents the default verbatim from the spec.

use std::time::Duration;

/// Per-request timeout for a management-node RPC (lock renewal, ...). Default 15s.
pub const AMQP_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Assumed end-to-end delivery timeout used to pace lock renewal. Default 30s.
pub const SERVICE_BUS_DELIVERY_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default deadline for a batch receive call. Default 60s.
pub const SERVICE_BUS_SERVER_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Fraction of [`SERVICE_BUS_DELIVERY_TIMEOUT`] that elapses before the next
/// lock renewal is scheduled. Default 0.75.
pub const RENEW_THRESHOLD: f64 = 0.75;

/// Delay before a detached streaming receiver attempts to reattach. Default 5s.
pub const REATTACH_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default deadline past which a peek-locked message is no longer renewed. Default 5min.
pub const AUTO_RENEW_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Default number of in-flight handler invocations per streaming receiver.
pub const MAX_CONCURRENT_CALLS: u32 = 1;

/// Default per-connection link budget.
pub const HANDLE_MAX: u32 = 255;

/// Delay before an idle connection is torn down by the pool. Default 10min.
pub const AMQP_CLIENT_CLEANUP_DELAY: Duration = Duration::from_millis(600_000);

/// Default per-call send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Receive mode for a streaming or batch receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// The broker holds an exclusive lock on each delivered message until it is
    /// settled or the lock expires.
    PeekLock,
    /// Delivery is itself the settlement; the broker never expects a disposition.
    ReceiveAndDelete,
}

impl Default for ReceiveMode {
    fn default() -> Self {
        ReceiveMode::PeekLock
    }
}

/// An `autoRenewTimeout` value. `Disabled` turns off lock renewal entirely
/// (`= 0` in the spec); `Infinite` renews forever until the message settles
/// (`= Infinity` in the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRenewTimeout {
    /// No lock renewal is scheduled at all.
    Disabled,
    /// Renew for up to the given duration after the message was received.
    After(Duration),
    /// Keep renewing indefinitely until the message settles.
    Infinite,
}

impl Default for AutoRenewTimeout {
    fn default() -> Self {
        AutoRenewTimeout::After(AUTO_RENEW_TIMEOUT)
    }
}

/// Options controlling a streaming receiver's behavior, passed to
/// [`crate::receiver::streaming::MessageListener::start`].
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Peek-lock vs. receive-and-delete.
    pub receive_mode: ReceiveMode,
    /// Whether a message is completed automatically when the handler returns
    /// without error. Default `true`.
    pub auto_complete: bool,
    /// How long to keep renewing a message's lock. Default 5 minutes.
    pub auto_renew_timeout: AutoRenewTimeout,
    /// Upper bound on concurrently in-flight handler invocations, and therefore
    /// the receiver link's initial credit quantum. Default 1.
    pub max_concurrent_calls: u32,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            receive_mode: ReceiveMode::default(),
            auto_complete: true,
            auto_renew_timeout: AutoRenewTimeout::default(),
            max_concurrent_calls: MAX_CONCURRENT_CALLS,
        }
    }
}

impl ReceiverOptions {
    /// The link's initial credit quantum: equal to `max_concurrent_calls`.
    pub fn initial_credit(&self) -> u32 {
        self.max_concurrent_calls
    }

    /// The credit-refresh threshold: `ceil(max_concurrent_calls / 2)`.
    pub fn refresh_threshold(&self) -> u32 {
        self.max_concurrent_calls.div_ceil(2).max(1)
    }
}

/// Options for the connection pool shared by every entity handle under one [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of links leased against a single underlying connection.
    pub handle_max: u32,
    /// How long an idle (zero-lease) connection lingers before being torn down.
    pub idle_cleanup_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            handle_max: HANDLE_MAX,
            idle_cleanup_delay: AMQP_CLIENT_CLEANUP_DELAY,
        }
    }
}

/// Top-level client options.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Connection pool tuning.
    pub pool: PoolOptions,
}
