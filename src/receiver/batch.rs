//! One-shot batch receive: pulls up to `n` messages or returns early at a
//! deadline, auto-settling each message on delivery.
//!
//! Unlike the streaming receiver this opens a transient receiver link for
//! the single call and tears it down unconditionally afterward. This is a
//! known inefficiency under high call rates (a future version could share
//! a long-lived receiver instead), documented here rather than silently
//! worked around.

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SequenceNo};
use fe2o3_amqp_types::messaging::message::Body;
use fe2o3_amqp_types::primitives::Value;

use crate::error::{classify_transport_error, LinkError, ServiceBusError};
use crate::message::ServiceBusMessage;
use crate::pool::ConnectionPool;

use super::attach_receiver;

/// Pulls up to `max_messages` from `entity_path`, auto-settled on delivery
/// (`rcvSettleMode = autoSettle`), returning early once `timeout` elapses.
///
/// A link detach before any deadline or count is reached fails the whole
/// call; whatever was collected up to a timeout or a full batch is returned
/// successfully.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(pool)))]
pub async fn receive_batch(
    pool: &ConnectionPool,
    entity_path: &str,
    max_messages: u32,
    timeout: std::time::Duration,
) -> Result<Vec<ServiceBusMessage>, ServiceBusError> {
    let (_lease, mut session, mut receiver) = attach_receiver(
        pool,
        1,
        entity_path,
        ReceiverSettleMode::First,
        true,
    )
    .await?;

    if max_messages > 0 {
        receiver
            .set_credit(max_messages as SequenceNo)
            .await
            .map_err(|e| LinkError::Detach(Some(e.to_string())))?;
    }

    let mut messages = Vec::with_capacity(max_messages as usize);
    let sleep = tokio::time::sleep(timeout);
    tokio::pin!(sleep);

    let outcome = loop {
        if messages.len() as u32 >= max_messages {
            break Ok(());
        }

        tokio::select! {
            delivery = receiver.recv::<Body<Value>>() => {
                match delivery {
                    Ok(delivery) => {
                        messages.push(ServiceBusMessage::from_delivery(delivery, true, None));
                    }
                    Err(err) => break Err(classify_transport_error(&err)),
                }
            }
            _ = &mut sleep => break Ok(()),
        }
    };

    let _ = receiver.close().await;
    let _ = session.close().await;

    outcome.map(|()| messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;
    use crate::connection_string::ConnectionString;
    use std::time::Duration;

    fn test_pool() -> ConnectionPool {
        let cs = ConnectionString::parse(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=n;SharedAccessKey=k",
        )
        .unwrap();
        ConnectionPool::new(&cs, "test-container".into(), PoolOptions::default())
    }

    #[tokio::test]
    async fn receive_batch_against_unreachable_namespace_fails_fast_at_link_attach() {
        // No live broker in a unit test: attaching the transient link fails
        // before either the count or the timeout is ever observed. This
        // exercises the error path of `attach_receiver` itself, not the
        // batch-collection loop (which needs a real transport).
        let pool = test_pool();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            receive_batch(&pool, "q1", 5, Duration::from_secs(15)),
        )
        .await;
        // Either the connection attempt itself errors quickly, or our own
        // timeout wrapper fires first (no network in this sandbox); both are
        // acceptable outcomes for a test with no broker available.
        assert!(result.is_err() || result.unwrap().is_err());
    }
}
