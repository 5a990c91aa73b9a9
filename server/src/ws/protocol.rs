use tokio::sync::mpsc;

use super::hub::HubHandle;
use super::message::{Message, MessageType};
use super::UserId;

/// Inbound frame problems that terminate the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("outbound queue full, peer is not keeping up")]
    SlowConsumer,
}

/// Per-connection values the read path needs to dispatch a frame.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub user_id: UserId,
    pub hub: HubHandle,
    /// Own outbound queue, for replies that bypass the hub.
    pub outbound: mpsc::WeakSender<String>,
    pub max_message_size: usize,
}

/// Handle one inbound text frame.
/// Decodes the JSON envelope, stamps it, and dispatches on its type.
/// Malformed frames and unknown types are logged and dropped.
/// Waits while the hub's command queue is full.
pub async fn handle_text_frame(text: &str, ctx: &ConnectionContext) -> Result<(), FrameError> {
    if text.len() > ctx.max_message_size {
        return Err(FrameError::TooLarge {
            size: text.len(),
            limit: ctx.max_message_size,
        });
    }

    let mut msg = match Message::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                error = %e,
                "Failed to decode message frame"
            );
            return Ok(());
        }
    };

    msg.stamp(ctx.user_id);
    dispatch(msg, text, ctx).await
}

async fn dispatch(msg: Message, raw: &str, ctx: &ConnectionContext) -> Result<(), FrameError> {
    match msg.kind {
        MessageType::NewDirect | MessageType::ReadReceipt => ctx.hub.route_direct(msg).await,
        MessageType::NewGroup => ctx.hub.route_group(msg).await,
        MessageType::Typing => match msg.encode() {
            // Re-encoded after stamping so the sender id cannot be spoofed.
            Ok(frame) => ctx.hub.broadcast(frame).await,
            Err(e) => tracing::error!(error = %e, "Failed to encode typing event"),
        },
        MessageType::Ping => return send_pong(ctx),
        MessageType::Pong
        | MessageType::UserJoined
        | MessageType::UserLeft
        | MessageType::Unknown => {
            tracing::debug!(
                user_id = %ctx.user_id,
                kind = msg.kind.as_str(),
                "Unhandled message type: {}",
                raw.chars().take(100).collect::<String>()
            );
        }
    }
    Ok(())
}

/// A full queue here is treated like a full queue in the hub: the peer is
/// too slow and the connection ends.
fn send_pong(ctx: &ConnectionContext) -> Result<(), FrameError> {
    let Some(outbound) = ctx.outbound.upgrade() else {
        // Already unregistered; the write pump is shutting down.
        return Ok(());
    };
    let frame = match Message::pong().encode() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode pong");
            return Ok(());
        }
    };
    match outbound.try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(user_id = %ctx.user_id, "Outbound queue full, dropping slow client");
            Err(FrameError::SlowConsumer)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
    }
}
