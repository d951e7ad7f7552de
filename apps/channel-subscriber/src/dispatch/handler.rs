//! Application callbacks for delivered payloads.

use crate::error::HandlerError;

/// Receives the payload of every delivered event that carries one.
///
/// Called from the transport's delivery path one event at a time; a slow
/// handler holds back delivery for its channel.
pub trait MessageHandler: Send {
    fn handle(&mut self, payload: &[u8]) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&[u8]) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        self(payload)
    }
}

/// Logs each payload as (lossy) UTF-8 text.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn handle(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        tracing::info!(
            len = payload.len(),
            message = %String::from_utf8_lossy(payload),
            "message received"
        );
        Ok(())
    }
}
