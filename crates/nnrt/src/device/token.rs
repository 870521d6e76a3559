use std::sync::Arc;

use super::Context;
use crate::status::Result;

/// Completion handle for an asynchronous transfer.
///
/// Completion is only guaranteed after [`CompletionToken::synchronize`]
/// returns. Dropping a pending token synchronizes its context so staging
/// memory held by the token outlives the transfer.
pub struct CompletionToken {
    context: Option<Arc<dyn Context>>,
    staging: Option<Vec<u8>>,
}

impl CompletionToken {
    pub fn completed() -> Self {
        CompletionToken {
            context: None,
            staging: None,
        }
    }

    pub fn pending(context: Arc<dyn Context>, staging: Option<Vec<u8>>) -> Self {
        CompletionToken {
            context: Some(context),
            staging,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.context.is_some()
    }

    pub fn synchronize(mut self) -> Result<()> {
        let result = match self.context.take() {
            Some(context) => context.synchronize(),
            None => Ok(()),
        };
        self.staging = None;
        result
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            if let Err(err) = context.synchronize() {
                tracing::warn!(error = %err, "synchronize on dropped completion token failed");
            }
        }
    }
}

/// An asynchronous device-to-host download.
pub struct PendingRead {
    // Dropped before `data`, so the transfer finishes before the buffer is freed.
    token: CompletionToken,
    data: Vec<u8>,
}

impl PendingRead {
    pub fn ready(data: Vec<u8>) -> Self {
        PendingRead {
            token: CompletionToken::completed(),
            data,
        }
    }

    pub fn pending(context: Arc<dyn Context>, data: Vec<u8>) -> Self {
        PendingRead {
            token: CompletionToken::pending(context, None),
            data,
        }
    }

    pub fn wait(self) -> Result<Vec<u8>> {
        let PendingRead { token, data } = self;
        token.synchronize()?;
        Ok(data)
    }
}
