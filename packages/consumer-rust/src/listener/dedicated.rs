//! Listener decorator that opens its own channel.

use std::sync::Arc;

use async_trait::async_trait;
use carrot_core::{Channel, Connection};
use tracing::{debug, warn};

use super::{Closer, ListenError, Listener};
use crate::handler::BoxHandler;

/// Runs the wrapped listener on a fresh channel opened from the connection,
/// ignoring the channel it was given. The fresh channel is closed again if
/// the wrapped listener fails to start.
#[derive(Debug, Clone)]
pub struct Dedicated<L> {
    inner: L,
}

/// Wraps `listener` so it listens on a dedicated channel.
pub fn use_dedicated_channel<L: Listener>(listener: L) -> Dedicated<L> {
    Dedicated { inner: listener }
}

impl<L> Dedicated<L> {
    pub fn into_inner(self) -> L {
        self.inner
    }
}

#[async_trait]
impl<L: Listener> Listener for Dedicated<L> {
    async fn listen(
        &self,
        conn: Arc<dyn Connection>,
        _channel: Arc<dyn Channel>,
        handler: BoxHandler,
    ) -> Result<Arc<dyn Closer>, ListenError> {
        let channel = conn.channel().await.map_err(ListenError::OpenChannel)?;
        debug!("opened dedicated channel");

        match self.inner.listen(conn, Arc::clone(&channel), handler).await {
            Ok(closer) => Ok(closer),
            Err(err) => {
                // Nobody else holds a closer for this channel.
                if let Err(close_err) = channel.close().await {
                    warn!(error = %close_err, "failed to close dedicated channel");
                }
                Err(err)
            }
        }
    }
}
