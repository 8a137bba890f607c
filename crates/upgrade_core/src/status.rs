//! Status events pushed to an observer and the renderer that displays them.

use std::collections::HashSet;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::step::{Status, Step, Substep};

/// One status change of one substep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub step: Step,
    pub substep: Substep,
    pub status: Status,
}

/// Push side of the observer stream.
pub type StatusSender = tokio::sync::mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = tokio::sync::mpsc::UnboundedReceiver<StatusEvent>;

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Renders status events for a terminal.
///
/// Delivery is at-least-once, so a `running` line is redrawn in place each
/// time it arrives while a terminal status is printed only the first time it
/// is seen for a substep.
pub struct StatusRenderer<W: Write> {
    out: W,
    finished: HashSet<(Step, Substep)>,
    line_open: bool,
}

impl<W: Write> StatusRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            finished: HashSet::new(),
            line_open: false,
        }
    }

    pub fn render(&mut self, event: &StatusEvent) -> io::Result<()> {
        let key = (event.step, event.substep);
        match event.status {
            Status::Running => {
                if self.finished.contains(&key) {
                    return Ok(());
                }
                write!(
                    self.out,
                    "\r{}...  [IN PROGRESS]",
                    event.substep.description()
                )?;
                self.line_open = true;
            }
            Status::Complete | Status::Failed => {
                if !self.finished.insert(key) {
                    return Ok(());
                }
                let label = if event.status == Status::Complete {
                    "COMPLETE"
                } else {
                    "FAILED"
                };
                write!(
                    self.out,
                    "\r{}...  [{label}]\n",
                    event.substep.description()
                )?;
                self.line_open = false;
            }
            Status::Pending | Status::Unknown => return Ok(()),
        }
        self.out.flush()
    }

    /// Terminate a dangling in-place line, if any.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.line_open {
            writeln!(self.out)?;
            self.line_open = false;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
