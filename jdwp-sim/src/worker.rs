// Worker threads
//
// Each worker interprets `demo.Counter.run` in a loop and reports a stop to
// the agent whenever the simulated runtime says so. Reporting blocks while
// the debugger keeps the thread suspended.

use crate::program::{self, Op, COUNTER_OBJECT};
use crate::vm::{frame_infos, Checkpoint, Frame, SimulatedVm, Unwind};
use jdwp_agent::types::ThreadId;
use jdwp_agent::{DebuggerContext, StopEvent};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

pub struct Worker {
    pub vm: Arc<SimulatedVm>,
    pub ctx: Arc<DebuggerContext>,
    pub thread: ThreadId,
    pub iterations: u64,
    /// Pause between two instructions
    pub pace: Duration,
    /// This worker reports the program's classes as prepared
    pub loads_classes: bool,
}

impl Worker {
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("sim-worker-{:#x}", self.thread))
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("Worker {:#x} started", self.thread);
        self.ctx.handle_thread_start(self.thread);
        if self.loads_classes {
            for class in program::classes() {
                self.ctx.handle_class_prepare(self.thread, &class);
            }
        }

        let mut count = 0;
        for _ in 0..self.iterations {
            if self.vm.requested_exit().is_some() {
                break;
            }
            self.run_once(&mut count);
        }

        self.vm.finish(self.thread);
        self.ctx.handle_thread_death(self.thread);
        info!("Worker {:#x} finished after count {}", self.thread, count);
    }

    /// One call of `run()`, from entry to return
    fn run_once(&self, count: &mut i32) {
        let mut stack = vec![Frame {
            method: program::RUN_METHOD,
            index: 0,
        }];

        while let Some(top) = stack.last().copied() {
            let Some(instruction) = program::instruction(top.method, top.index) else {
                // Fell off the end of a method
                return_from(&mut stack);
                continue;
            };

            let checkpoint = self.vm.checkpoint(self.thread, &stack, instruction.op, *count);
            if checkpoint.must_stop() {
                let suspended_only = checkpoint.suspend_requested;
                self.report(&stack, instruction.line, checkpoint);

                match self.vm.take_unwind(self.thread) {
                    Some(Unwind::Return) => {
                        debug!("Worker {:#x} returns early", self.thread);
                        return_from(&mut stack);
                        continue;
                    }
                    Some(Unwind::PopTo(depth)) => {
                        debug!("Worker {:#x} pops to depth {}", self.thread, depth);
                        stack.truncate(depth);
                        continue;
                    }
                    None => {}
                }
                if suspended_only {
                    continue;
                }
            }

            if !self.pace.is_zero() {
                std::thread::sleep(self.pace);
            }

            match instruction.op {
                Op::Line | Op::Throw { .. } => advance(&mut stack),
                Op::Increment(_) => {
                    *count += 1;
                    advance(&mut stack);
                }
                Op::Call(method) => stack.push(Frame { method, index: 0 }),
                Op::Return => return_from(&mut stack),
            }
        }
    }

    fn report(&self, stack: &[Frame], line: i32, checkpoint: Checkpoint) {
        let Some(top) = stack.last() else {
            return;
        };
        self.ctx.handle_stop(StopEvent {
            thread: self.thread,
            class: program::counter_class(),
            location: program::location(top.method, top.index),
            line: Some(line),
            this_object: Some(COUNTER_OBJECT),
            frames: frame_infos(self.thread, stack),
            hits: checkpoint.hits,
            stepped: checkpoint.stepped,
        });
    }
}

fn advance(stack: &mut [Frame]) {
    if let Some(frame) = stack.last_mut() {
        frame.index += 1;
    }
}

fn return_from(stack: &mut Vec<Frame>) {
    stack.pop();
    advance(stack);
}
