// Collaborator Interfaces
//
// Everything the core consumes from the rest of the driver. Implementations
// live with the chip driver and the embedding kernel; the core only moves
// handles between them.
//
// Ownership rules:
// - A mapping handle has exactly one owner at any time: a hardware
//   descriptor, a completion ring slot, or the code about to unmap it
// - Handles are never cloned; `unmap` consumes them
// - A completion refused by the ring goes back into its descriptor, where
//   `NicOps::reclaim_completed` finds it during overflow recovery

use crate::error::{DispatchError, MapError, SendError};

pub type InterfaceId = u8;
pub type DescriptorIndex = u16;

/// Pins buffers for bus-master transfers.
pub trait MappingSubsystem {
    type Handle;
    /// Region passed through the deferred-release queue.
    type Region;

    fn map_for_transfer(&mut self, buffer: &[u8]) -> Result<Self::Handle, MapError>;
    fn unmap(&mut self, handle: Self::Handle);
    fn release_region(&mut self, region: Self::Region);
}

pub trait ProtocolDispatch {
    fn dispatch(&mut self, frame: &[u8], source: InterfaceId) -> Result<(), DispatchError>;
}

/// A frame pulled from the adapter by `NicOps::receive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Length on the wire. May exceed the buffer it was copied into.
    pub len: usize,
    pub interface: InterfaceId,
}

/// Completed descriptor that still owned its mapping.
#[derive(Debug)]
pub struct OrphanedDescriptor<H> {
    pub interface: InterfaceId,
    pub descriptor: DescriptorIndex,
    pub mapping: H,
}

/// Hardware send/receive operations.
pub trait NicOps {
    type Mapping;

    /// Hand a mapped frame to the transmitter. On failure the mapping comes
    /// back inside the error.
    fn send(&mut self, frame: &[u8], mapping: Self::Mapping) -> Result<(), SendError<Self::Mapping>>;

    /// Consume the next pending frame, copying at most `buf.len()` bytes of
    /// it. The reported length is always the full frame length, so a frame
    /// longer than `buf` is recognisable as cut short.
    fn receive(&mut self, buf: &mut [u8]) -> Option<ReceivedFrame>;

    /// Next descriptor the hardware reports complete that still holds a
    /// mapping. Moves the mapping out of the descriptor.
    fn reclaim_completed(&mut self) -> Option<OrphanedDescriptor<Self::Mapping>>;
}
