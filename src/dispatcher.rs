/* Command dispatcher.
 *
 * Drains the command queue subject to two gates: the local DELAY deadline
 * and transport readiness. Local frames never reach the transport; DELAY is
 * consumed here, everything else local goes back to the engine. A device
 * frame the transport refuses is held and re-offered on the next step. */

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::protocol::{CommandKind, Frame, LocalCommand};
use crate::queue::CommandQueue;
use crate::transport::ReportSink;

pub const DEFAULT_BUDGET: usize = 8;

/* Result of one dispatch step. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /* A DELAY deadline is still in the future. */
    Deferred,
    /* Transport is not accepting frames. */
    NotReady,
    /* Nothing queued. */
    Idle,
    /* A device frame went out. */
    Sent,
    /* The transport refused the frame; it is held for the next step. */
    Retry,
    /* A DELAY frame was consumed. */
    Delayed,
    /* A local frame the engine must act on. */
    Local(Frame),
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    delay_until: Option<Instant>,
    pending: Option<Frame>,
    sent: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /* Run a single step of the dispatch state machine. */
    pub fn step(
        &mut self,
        now: Instant,
        queue: &CommandQueue,
        sink: &mut dyn ReportSink,
    ) -> DispatchOutcome {
        if let Some(until) = self.delay_until {
            if now < until {
                return DispatchOutcome::Deferred;
            }
            self.delay_until = None;
        }

        if !sink.is_ready() {
            return DispatchOutcome::NotReady;
        }

        let frame = match self.pending.take() {
            Some(frame) => frame,
            None => match queue.dequeue() {
                Some(frame) => frame,
                None => return DispatchOutcome::Idle,
            },
        };

        match frame.command_kind() {
            Some(CommandKind::Local(LocalCommand::Delay)) => {
                let ms = frame.u16_le(1);
                self.delay_until = Some(now + Duration::from_millis(u64::from(ms)));
                trace!("DELAY {ms} ms");
                DispatchOutcome::Delayed
            }
            Some(CommandKind::Local(_)) => DispatchOutcome::Local(frame),
            /* Enqueue validated the opcode, so anything else is device-bound. */
            _ => {
                if !sink.try_send(&frame) {
                    debug!("Transport refused opcode {}, holding", frame.opcode());
                    self.pending = Some(frame);
                    return DispatchOutcome::Retry;
                }
                self.sent += 1;
                sink.arm_receive();
                DispatchOutcome::Sent
            }
        }
    }

    /* Keep stepping while frames flow, up to `budget` steps. Local frames
     * are collected in order for the engine to execute. */
    pub fn dispatch(
        &mut self,
        now: Instant,
        queue: &CommandQueue,
        sink: &mut dyn ReportSink,
        budget: usize,
        local: &mut Vec<Frame>,
    ) -> DispatchOutcome {
        let mut last = DispatchOutcome::Idle;
        for _ in 0..budget.max(1) {
            last = self.step(now, queue, sink);
            match last {
                DispatchOutcome::Sent => {}
                DispatchOutcome::Local(frame) => local.push(frame),
                /* A fresh DELAY gates everything after it, even this tick. */
                DispatchOutcome::Delayed => {}
                _ => break,
            }
        }
        last
    }

    pub fn is_delayed(&self, now: Instant) -> bool {
        self.delay_until.is_some_and(|until| now < until)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /* Frames handed to the transport since creation. */
    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    /* Forget the delay deadline and any held frame. */
    pub fn reset(&mut self) {
        self.delay_until = None;
        self.pending = None;
    }
}
