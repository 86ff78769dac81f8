//! Receiver implementations: a long-lived streaming receiver (`on_message`)
//! with lock renewal and automatic reattach, and a transient batch receiver.

pub mod batch;
pub mod streaming;

use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::link::Receiver as LinkReceiver;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp_types::definitions::ReceiverSettleMode;
use uuid::Uuid;

use crate::error::{LinkError, ServiceBusError};
use crate::pool::{ConnectionLease, ConnectionPool};

/// Leases a connection, begins a session on it, and attaches a receiver link
/// at `source` with the given settle mode and manual credit mode (credit
/// itself is granted separately, by a [`crate::credit::CreditManager`] or
/// directly by the caller for a transient batch receiver).
///
/// `auto_accept` controls whether the transport itself settles a delivery on
/// receipt (used by the batch receiver's `autoSettle` policy) or leaves
/// settlement to the caller (the peek-lock streaming path).
pub(crate) async fn attach_receiver(
    pool: &ConnectionPool,
    num_links: u32,
    source: &str,
    settle_mode: ReceiverSettleMode,
    auto_accept: bool,
) -> Result<(ConnectionLease, SessionHandle<()>, LinkReceiver), ServiceBusError> {
    let lease = pool
        .lease(num_links)
        .await
        .map_err(|e| LinkError::Detach(Some(e.to_string())))?;
    let mut session = lease
        .begin_session()
        .await
        .map_err(|e| LinkError::Detach(Some(e.to_string())))?;

    let name = format!("receiver-{}", Uuid::new_v4());
    let receiver = LinkReceiver::builder()
        .name(name)
        .source(Some(source))
        .receiver_settle_mode(settle_mode)
        .credit_mode(CreditMode::Manual)
        .auto_accept(auto_accept)
        .attach(&mut session)
        .await
        .map_err(|e| LinkError::Detach(Some(e.to_string())))?;

    Ok((lease, session, receiver))
}
