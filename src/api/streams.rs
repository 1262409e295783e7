//! Active stream registry backing `DELETE /api/chat/abort`.
//!
//! Each chat stream registers its cancellation token under the client's
//! `request_id`. Abort only ever cancels the stream registered under the id
//! the caller presents; there is no fallback that could reach another
//! caller's stream. Entries deregister through an RAII handle on every exit
//! path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Default, Clone)]
pub struct StreamRegistry {
    by_id: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream; the returned handle removes it on drop. A second
    /// stream under the same id replaces the first entry.
    pub fn register(&self, request_id: String, token: CancellationToken) -> StreamRegistration {
        self.by_id
            .lock()
            .expect("stream registry poisoned")
            .insert(request_id.clone(), token);
        StreamRegistration {
            registry: self.clone(),
            request_id,
        }
    }

    /// Cancel the stream registered under `request_id`. Returns whether a
    /// stream was cancelled.
    pub fn abort(&self, request_id: &str) -> bool {
        match self
            .by_id
            .lock()
            .expect("stream registry poisoned")
            .get(request_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.by_id.lock().expect("stream registry poisoned").len()
    }

    fn remove(&self, request_id: &str) {
        self.by_id
            .lock()
            .expect("stream registry poisoned")
            .remove(request_id);
    }
}

/// RAII deregistration for one stream.
pub struct StreamRegistration {
    registry: StreamRegistry,
    request_id: String,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}
