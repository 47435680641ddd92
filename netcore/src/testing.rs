// Test doubles for the collaborator traits.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{DispatchError, HwError, MapError, SendError};
use crate::hal::{InterfaceId, MappingSubsystem, NicOps, OrphanedDescriptor, ProtocolDispatch, ReceivedFrame};

/// Mapping handle that is deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle(pub u32);

#[derive(Debug, Default)]
pub struct RecordingMapper {
    pub next: u32,
    pub mapped: u32,
    pub unmapped: Vec<u32>,
    pub regions: Vec<u32>,
    pub fail_next_map: bool,
}

impl MappingSubsystem for RecordingMapper {
    type Handle = Handle;
    type Region = u32;

    fn map_for_transfer(&mut self, _buffer: &[u8]) -> Result<Handle, MapError> {
        if core::mem::take(&mut self.fail_next_map) {
            return Err(MapError::Exhausted);
        }
        self.next += 1;
        self.mapped += 1;
        Ok(Handle(self.next))
    }

    fn unmap(&mut self, handle: Handle) {
        self.unmapped.push(handle.0);
    }

    fn release_region(&mut self, region: u32) {
        self.regions.push(region);
    }
}

#[derive(Debug, Default)]
pub struct RecordingDispatch {
    pub frames: Vec<(Vec<u8>, InterfaceId)>,
    pub reject: bool,
}

impl ProtocolDispatch for RecordingDispatch {
    fn dispatch(&mut self, frame: &[u8], source: InterfaceId) -> Result<(), DispatchError> {
        if self.reject {
            return Err(DispatchError::NoHandler);
        }
        self.frames.push((frame.to_vec(), source));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockNic {
    pub sent: Vec<(Vec<u8>, u32)>,
    pub fail_sends: bool,
    pub rx: VecDeque<(Vec<u8>, InterfaceId)>,
    pub orphans: VecDeque<OrphanedDescriptor<Handle>>,
}

impl NicOps for MockNic {
    type Mapping = Handle;

    fn send(&mut self, frame: &[u8], mapping: Handle) -> Result<(), SendError<Handle>> {
        if self.fail_sends {
            return Err(SendError {
                kind: HwError::Busy,
                mapping,
            });
        }
        self.sent.push((frame.to_vec(), mapping.0));
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Option<ReceivedFrame> {
        let (frame, interface) = self.rx.pop_front()?;
        let stored = frame.len().min(buf.len());
        buf[..stored].copy_from_slice(&frame[..stored]);
        Some(ReceivedFrame {
            len: frame.len(),
            interface,
        })
    }

    fn reclaim_completed(&mut self) -> Option<OrphanedDescriptor<Handle>> {
        self.orphans.pop_front()
    }
}
