/*!
 * Calibration and homing sequences.
 *
 * A [`Procedure`] is a short list of steps. Each step optionally sends a
 * request and then waits for a specific completion: an acknowledgement or a
 * confirmed value. Any negative acknowledgement, step timeout or loss of the
 * motor aborts the sequence at the current step; nothing is retried.
 */
use tokio::sync::oneshot;

use motorlink_core::event::ProcedureKind;
use motorlink_core::types::{Attr, MotorMode, Value};

use crate::codec::{AckTarget, Command, CommandKind, Request, Response};
use crate::error::{DeviceError, Result};

/// What ends a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A positive acknowledgement of the target
    Ack(AckTarget),
    /// Any confirmed value of the attribute
    Value(Attr),
}

/// One step of a procedure
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Step name used in failure reports
    pub name: &'static str,
    /// Request sent when the step begins
    pub request: Option<Request>,
    /// What completes the step
    pub completion: Completion,
}

/// Result of feeding an event into a procedure
#[derive(Debug)]
pub enum Progress {
    /// Not relevant to the current step
    Pending,
    /// Moved on to the next step, which sends this request
    Advance(Option<Request>),
    /// The last step completed
    Completed,
    /// The sequence failed at the current step
    Aborted(DeviceError),
}

/// A running procedure
#[derive(Debug)]
pub struct Procedure {
    kind: ProcedureKind,
    steps: Vec<Step>,
    current: usize,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// Waits for a procedure to end
#[derive(Debug)]
pub struct ProcedureHandle {
    kind: ProcedureKind,
    done: oneshot::Receiver<Result<()>>,
}

impl ProcedureHandle {
    /// Which procedure this is
    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// Wait for the procedure to complete or abort
    pub async fn wait(self) -> Result<()> {
        let kind = self.kind;
        self.done.await.map_err(|_| DeviceError::SequenceAborted {
            kind,
            step: "unknown",
            reason: "procedure was dropped".to_string(),
        })?
    }
}

impl Procedure {
    fn new(kind: ProcedureKind, steps: Vec<Step>) -> (Self, ProcedureHandle) {
        let (tx, rx) = oneshot::channel();
        let procedure = Self {
            kind,
            steps,
            current: 0,
            done: Some(tx),
        };
        (procedure, ProcedureHandle { kind, done: rx })
    }

    /// Encoder calibration: enable calibration, start it, wait for the angle
    pub fn calibration() -> (Self, ProcedureHandle) {
        Self::new(
            ProcedureKind::Calibration,
            vec![
                Step {
                    name: "configure",
                    request: Some(Request::Write {
                        attr: Attr::CalibrationSwitch,
                        value: Value::Integer(1),
                    }),
                    completion: Completion::Ack(AckTarget::Attr(Attr::CalibrationSwitch)),
                },
                Step {
                    name: "start",
                    request: Some(Request::Command(Command::StartCalibration)),
                    completion: Completion::Ack(AckTarget::Command(CommandKind::StartCalibration)),
                },
                Step {
                    name: "await completion",
                    request: None,
                    completion: Completion::Value(Attr::CalibrationAngle),
                },
            ],
        )
    }

    /// Homing: switch to homing mode, start the given strategy, wait for the
    /// homing position
    pub fn homing(operation_mode: u8) -> (Self, ProcedureHandle) {
        Self::new(
            ProcedureKind::Homing,
            vec![
                Step {
                    name: "configure",
                    request: Some(Request::Write {
                        attr: Attr::ModeId,
                        value: Value::from(MotorMode::Homing),
                    }),
                    completion: Completion::Ack(AckTarget::Attr(Attr::ModeId)),
                },
                Step {
                    name: "start",
                    request: Some(Request::Command(Command::SetHomingOperationMode(
                        operation_mode,
                    ))),
                    completion: Completion::Ack(AckTarget::Command(
                        CommandKind::SetHomingOperationMode,
                    )),
                },
                Step {
                    name: "await completion",
                    request: None,
                    completion: Completion::Value(Attr::PosHoming),
                },
            ],
        )
    }

    /// Which procedure this is
    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// Name of the current step
    pub fn current_step(&self) -> &'static str {
        self.steps.get(self.current).map_or("done", |s| s.name)
    }

    /// Request of the first step
    pub fn first_request(&self) -> Option<Request> {
        self.steps.first().and_then(|s| s.request.clone())
    }

    fn abort(&self, reason: impl Into<String>) -> Progress {
        Progress::Aborted(DeviceError::SequenceAborted {
            kind: self.kind,
            step: self.current_step(),
            reason: reason.into(),
        })
    }

    fn advance(&mut self) -> Progress {
        self.current += 1;
        match self.steps.get(self.current) {
            Some(step) => Progress::Advance(step.request.clone()),
            None => Progress::Completed,
        }
    }

    /// Feed a response; `attr_of` resolves attribute wire codes
    pub fn on_response(
        &mut self,
        response: &Response,
        attr_of: impl Fn(u8) -> Option<Attr>,
    ) -> Progress {
        let Some(step) = self.steps.get(self.current) else {
            return Progress::Pending;
        };
        match (step.completion, response) {
            (Completion::Ack(expected), Response::Ack { target, ok }) if expected == *target => {
                if *ok {
                    self.advance()
                } else {
                    self.abort("device rejected the request")
                }
            }
            (Completion::Value(expected), Response::Value { code, .. })
                if attr_of(*code) == Some(expected) =>
            {
                self.advance()
            }
            _ => Progress::Pending,
        }
    }

    /// The current step ran out of time
    pub fn on_timeout(&self) -> Progress {
        self.abort("step timed out")
    }

    /// The motor went offline
    pub fn on_offline(&self) -> Progress {
        self.abort("device went offline")
    }

    /// The request of the current step could not be sent
    pub fn on_send_failure(&self, error: &DeviceError) -> Progress {
        self.abort(format!("send failed: {}", error))
    }

    /// Report the outcome to the waiting handle
    pub fn finish(mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}
