use core::fmt;

/// Stable, unique identity of a connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnectionId(pub u32);

/// Per-connection tag of one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OperationContext(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionQueueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RequestQueueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SegmentId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Reserved tag for completions the engine does not route (e.g. the
/// completion of a cancel request itself).
pub const UNROUTED_TAG: u64 = u64::MAX;

/// Packs a connection id and an operation context into one kernel tag.
///
/// Layout: Connection (High 32) | Context (Low 32). Connection `u32::MAX`
/// is never issued, so a real tag never collides with [`UNROUTED_TAG`].
#[inline]
pub fn encode_tag(connection: ConnectionId, context: OperationContext) -> u64 {
    ((connection.0 as u64) << 32) | context.0 as u64
}

#[inline]
pub fn decode_tag(tag: u64) -> Option<(ConnectionId, OperationContext)> {
    if tag == UNROUTED_TAG {
        return None;
    }
    Some((
        ConnectionId((tag >> 32) as u32),
        OperationContext((tag & 0xFFFF_FFFF) as u32),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Receive,
    Send,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Receive => f.write_str("receive"),
            OperationKind::Send => f.write_str("send"),
        }
    }
}

/// A slice of a registered buffer, as handed to the provider.
///
/// `ptr` points into pinned memory that stays mapped until the arena is
/// destroyed; `length` is the number of bytes the operation may touch.
#[derive(Debug, Clone, Copy)]
pub struct SegmentDescriptor {
    pub buffer: BufferId,
    pub segment: SegmentId,
    pub offset: u32,
    pub length: u32,
    pub ptr: *mut u8,
}

// Safety: the descriptor is an address plus metadata; the arena guarantees
// exclusive ownership of the region by one in-flight operation.
unsafe impl Send for SegmentDescriptor {}
unsafe impl Sync for SegmentDescriptor {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    /// The operation was cancelled before it transferred anything.
    Cancelled,
    /// Transport-level failure with its native code.
    Failed(i32),
}

/// One kernel completion, consumed only by the reactor owning its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionResult {
    pub connection: ConnectionId,
    pub context: OperationContext,
    pub bytes_transferred: u32,
    pub status: CompletionStatus,
}

impl CompletionResult {
    pub const EMPTY: Self = Self {
        connection: ConnectionId(0),
        context: OperationContext(0),
        bytes_transferred: 0,
        status: CompletionStatus::Success,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_carries_connection_and_context() {
        let tag = encode_tag(ConnectionId(7), OperationContext(0xDEAD_BEEF));
        assert_eq!(
            decode_tag(tag),
            Some((ConnectionId(7), OperationContext(0xDEAD_BEEF)))
        );
        assert_eq!(decode_tag(UNROUTED_TAG), None);
    }
}
