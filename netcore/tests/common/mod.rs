#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use netcore::{
    DispatchError, HwError, InterfaceId, MapError, MappingSubsystem, NicOps, OrphanedDescriptor, ProtocolDispatch,
    ReceivedFrame, SendError,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mapping handle that cannot be duplicated.
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping(pub u32);

#[derive(Debug, Default)]
pub struct Mapper {
    next: u32,
    pub unmapped: Vec<u32>,
    pub regions: Vec<u32>,
}

impl MappingSubsystem for Mapper {
    type Handle = Mapping;
    type Region = u32;

    fn map_for_transfer(&mut self, _buffer: &[u8]) -> Result<Mapping, MapError> {
        self.next += 1;
        Ok(Mapping(self.next))
    }

    fn unmap(&mut self, handle: Mapping) {
        self.unmapped.push(handle.0);
    }

    fn release_region(&mut self, region: u32) {
        self.regions.push(region);
    }
}

/// Completed descriptors still holding a mapping, shared between the
/// simulated interrupt and the adapter model.
pub type DescriptorStore = Arc<Mutex<VecDeque<OrphanedDescriptor<Mapping>>>>;

#[derive(Debug, Default)]
pub struct Adapter {
    pub sent: Vec<Vec<u8>>,
    pub rx: VecDeque<(Vec<u8>, InterfaceId)>,
    pub descriptors: DescriptorStore,
    pub fail_sends: bool,
}

impl NicOps for Adapter {
    type Mapping = Mapping;

    fn send(&mut self, frame: &[u8], mapping: Mapping) -> Result<(), SendError<Mapping>> {
        if self.fail_sends {
            return Err(SendError {
                kind: HwError::LinkDown,
                mapping,
            });
        }
        self.sent.push(frame.to_vec());
        // The adapter completes instantly; park the mapping on the descriptor.
        self.descriptors.lock().unwrap().push_back(OrphanedDescriptor {
            interface: 0,
            descriptor: self.sent.len() as u16,
            mapping,
        });
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

    fn reclaim_completed(&mut self) -> Option<OrphanedDescriptor<Mapping>> {
        self.descriptors.lock().unwrap().pop_front()
    }
}

#[derive(Debug, Default)]
pub struct Stack {
    pub frames: Vec<(Vec<u8>, InterfaceId)>,
}

impl ProtocolDispatch for Stack {
    fn dispatch(&mut self, frame: &[u8], source: InterfaceId) -> Result<(), DispatchError> {
        self.frames.push((frame.to_vec(), source));
        Ok(())
    }
}
