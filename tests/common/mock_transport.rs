//! Mock transport implementation for gateway integration testing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mnemosyne_core::gateway::{GatewayEvent, GatewayEventType, Transport, TransportError};

/// A transport that records every frame and can be told to fail.
#[derive(Default)]
pub struct MockTransport {
    frames: Mutex<Vec<String>>,
    should_fail: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent sends fail as if the peer went away.
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Decode and remove everything sent so far.
    pub fn take_events(&self) -> Vec<GatewayEvent> {
        let frames = std::mem::take(&mut *self.frames.lock().unwrap());
        frames
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("gateway sent invalid JSON"))
            .collect()
    }

    pub fn take_of_type(&self, event_type: GatewayEventType) -> Vec<GatewayEvent> {
        self.take_events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.frames.lock().unwrap().push(text);
        Ok(())
    }
}
