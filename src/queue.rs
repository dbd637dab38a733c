/* Bounded FIFO of outgoing command frames.
 *
 * Producers (event handling, D-Bus method calls, the periodic tick) and the
 * consumer (the dispatcher) may run in different contexts, so the ring is
 * guarded by a mutex. Enqueue never blocks: a full queue drops the frame. */

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::CommandError;
use crate::protocol::{CommandKind, Frame, LOCAL_COMMAND_BASE};

pub const DEFAULT_CAPACITY: usize = 128;

pub struct CommandQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl CommandQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /* Validate and append a frame. Malformed opcodes and overflow are logged
     * and reported, never fatal. */
    pub fn enqueue(&self, frame: Frame) -> Result<(), CommandError> {
        let opcode = frame.opcode();
        let kind = match frame.command_kind() {
            Some(kind) => kind,
            None => {
                let err = if opcode >= LOCAL_COMMAND_BASE {
                    CommandError::InvalidLocalCommand(opcode)
                } else if opcode <= crate::protocol::DEVICE_COMMAND_MAX {
                    CommandError::InvalidDeviceCommand(opcode)
                } else {
                    CommandError::NotACommand(opcode)
                };
                warn!("Rejected command: {err}");
                return Err(err);
            }
        };

        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            let err = CommandError::QueueFull {
                opcode,
                capacity: self.capacity,
            };
            warn!("{err}");
            return Err(err);
        }
        frames.push_back(frame);
        trace!("Queued {:?} ({} pending)", kind, frames.len());
        Ok(())
    }

    pub fn dequeue(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /* Drop everything still waiting. */
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}
