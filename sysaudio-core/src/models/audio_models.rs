use serde::{Deserialize, Serialize};

/// Identifier of an OS audio object (tap, aggregate device, stream).
///
/// `ObjectId::UNKNOWN` (0) never refers to a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const UNKNOWN: ObjectId = ObjectId(0);

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a registered producer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryId(pub u64);

/// The OS objects backing one acquired capture source.
///
/// Not `Clone`: exactly one owner releases it, through
/// [`SourceManager::release`](crate::source::manager::SourceManager::release),
/// which empties the handle so a second release does nothing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CaptureHandle {
    pub(crate) tap: Option<ObjectId>,
    pub(crate) compound: Option<ObjectId>,
}

impl CaptureHandle {
    pub fn tap(&self) -> Option<ObjectId> {
        self.tap
    }

    /// The readable device/stream object that delivers buffers.
    pub fn compound(&self) -> Option<ObjectId> {
        self.compound
    }

    pub fn is_released(&self) -> bool {
        self.tap.is_none() && self.compound.is_none()
    }
}

/// A transient view of one delivered buffer.
///
/// The bytes are only valid for the duration of the callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct AudioBuffer<'a> {
    bytes: &'a [u8],
    frame_count: u32,
}

impl<'a> AudioBuffer<'a> {
    pub fn new(bytes: &'a [u8], frame_count: u32) -> Self {
        Self { bytes, frame_count }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Frame count as reported by the delivering runtime.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Counters kept by the producer callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub buffers_received: u64,
    pub buffers_written: u64,
    pub buffers_failed: u64,
    pub frames_written: u64,
    /// Invocations that arrived after the recorder stopped and were ignored.
    pub late_buffers: u64,
}
