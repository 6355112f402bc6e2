//! Guest-negotiated message buffers
//!
//! The guest reserves one topic region and one payload region in its own
//! memory and announces them once via `eea_set_message_buffers`. Inbound
//! messages and direct triggers are copied into these regions before the
//! matching export is called.

use tracing::{debug, error};

use super::codec::{self, Encoded};
use super::memory::{GuestSlice, MemoryView};
use super::types::{EeaError, EeaResult};

/// Topic and payload regions announced by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageBuffers {
    pub topic: GuestSlice,
    pub payload: GuestSlice,
}

impl MessageBuffers {
    pub fn new(topic: GuestSlice, payload: GuestSlice) -> Self {
        Self { topic, payload }
    }

    /// Copy a topic/payload pair into the regions
    ///
    /// Both regions are bounds-checked before anything is written. Values
    /// larger than their region are truncated and the returned counts say how
    /// much was copied.
    pub fn write(
        &self,
        view: &mut MemoryView<'_>,
        topic: &str,
        payload: &str,
    ) -> EeaResult<(Encoded, Encoded)> {
        view.check(self.topic.ptr, self.topic.len)?;
        view.check(self.payload.ptr, self.payload.len)?;

        let topic = codec::encode_string(view, topic, self.topic.ptr, self.topic.len)?;
        let payload = codec::encode_string(view, payload, self.payload.ptr, self.payload.len)?;
        Ok((topic, payload))
    }
}

/// Set-once holder for a single instance's [`MessageBuffers`]
#[derive(Debug, Default)]
pub struct BufferRegistry {
    buffers: Option<MessageBuffers>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the guest's regions; a second negotiation is rejected
    pub fn negotiate(&mut self, buffers: MessageBuffers) -> EeaResult<()> {
        if let Some(existing) = self.buffers {
            error!(
                ?existing,
                requested = ?buffers,
                "Message buffers were already set; ignoring renegotiation"
            );
            return Err(EeaError::InvalidState(
                "message buffers already negotiated".to_string(),
            ));
        }

        debug!(
            topic_ptr = buffers.topic.ptr.0,
            topic_capacity = buffers.topic.len,
            payload_ptr = buffers.payload.ptr.0,
            payload_capacity = buffers.payload.len,
            "Message buffers negotiated"
        );
        self.buffers = Some(buffers);
        Ok(())
    }

    pub fn get(&self) -> EeaResult<MessageBuffers> {
        self.buffers.ok_or(EeaError::BuffersNotNegotiated)
    }

    pub fn is_negotiated(&self) -> bool {
        self.buffers.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestPtr;

    fn buffers() -> MessageBuffers {
        MessageBuffers::new(
            GuestSlice::new(GuestPtr::new(0), 8),
            GuestSlice::new(GuestPtr::new(16), 16),
        )
    }

    #[test]
    fn test_negotiate_once() {
        let mut registry = BufferRegistry::new();
        assert!(matches!(registry.get(), Err(EeaError::BuffersNotNegotiated)));

        registry.negotiate(buffers()).unwrap();
        assert!(registry.is_negotiated());

        let other = MessageBuffers::new(
            GuestSlice::new(GuestPtr::new(100), 1),
            GuestSlice::new(GuestPtr::new(200), 1),
        );
        assert!(registry.negotiate(other).is_err());
        assert_eq!(registry.get().unwrap(), buffers());
    }

    #[test]
    fn test_write_truncates_to_regions() {
        let mut mem = vec![0u8; 64];
        let mut view = MemoryView::new(&mut mem);

        let (topic, payload) = buffers()
            .write(&mut view, "a/very/long/topic", "{\"ok\":true}")
            .unwrap();
        assert_eq!(topic.written, 8);
        assert!(topic.is_truncated());
        assert_eq!(payload.written, 11);
        assert_eq!(&mem[0..8], b"a/very/l");
        assert_eq!(&mem[8..16], &[0u8; 8]);
        assert_eq!(&mem[16..27], b"{\"ok\":true}");
    }

    #[test]
    fn test_write_checks_both_regions_first() {
        let mut mem = vec![0u8; 20];
        let mut view = MemoryView::new(&mut mem);

        // Payload region runs past the end of memory
        assert!(buffers().write(&mut view, "t", "p").is_err());
        assert_eq!(mem[0], 0);
    }
}
