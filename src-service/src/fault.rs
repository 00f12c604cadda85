//! Deterministic fault injection.
//!
//! A fault point runs a script of space-separated commands, consuming one
//! step per invocation:
//!
//! * `skip` - no fault this time
//! * `usleep=<µs>` - sleep, then carry on with the next command in the same
//!   invocation
//! * `gerror` - fail this invocation
//! * `abort` - crash the process
//!
//! With `pre_attach="skip abort"` the first attach succeeds and the second
//! crashes the producer. Scripts are read from the environment variable named
//! after the point, but only when built with the `fault-injection` feature.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Point in the attach handler, after the attachment is registered and
/// before the reply is sent.
pub const PRE_ATTACH: &str = "pre_attach";

/// Point in the capture thread, once per frame.
pub const CAPTURE_FRAME: &str = "capture_frame";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Skip,
    Sleep(Duration),
    Error,
    Abort,
}

/// What the caller should do after an injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultAction {
    Continue,
    Fail(String),
    Abort,
}

/// A single step taken from the script.
enum Step {
    Sleep(Duration),
    Done(FaultAction),
}

#[derive(Debug)]
pub struct FaultPoint {
    name: &'static str,
    commands: Mutex<VecDeque<Command>>,
}

fn parse_script(name: &str, script: &str) -> VecDeque<Command> {
    let mut commands = VecDeque::new();
    for word in script.split_whitespace() {
        let command = match word {
            "skip" => Command::Skip,
            "gerror" => Command::Error,
            "abort" => Command::Abort,
            _ => match word.strip_prefix("usleep=").map(str::parse::<u64>) {
                Some(Ok(us)) => Command::Sleep(Duration::from_micros(us)),
                _ => {
                    // Everything from here on is ignored
                    warn!(point = name, "Ignoring invalid fault script: {}", word);
                    break;
                }
            },
        };
        commands.push_back(command);
    }
    commands
}

impl FaultPoint {
    /// A point that never injects anything.
    pub fn disabled(name: &'static str) -> Self {
        Self::from_script(name, "")
    }

    pub fn from_script(name: &'static str, script: &str) -> Self {
        Self {
            name,
            commands: Mutex::new(parse_script(name, script)),
        }
    }

    /// Read the script from the environment variable called `name`.
    #[cfg(feature = "fault-injection")]
    pub fn from_env(name: &'static str) -> Self {
        let script = std::env::var(name).unwrap_or_default();
        if !script.is_empty() {
            warn!(point = name, script = %script, "Fault injection enabled");
        }
        Self::from_script(name, &script)
    }

    #[cfg(not(feature = "fault-injection"))]
    pub fn from_env(name: &'static str) -> Self {
        Self::disabled(name)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn next_step(&self) -> Step {
        let mut commands = self
            .commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match commands.front() {
            None => Step::Done(FaultAction::Continue),
            // Stays at the head so every later invocation aborts too
            Some(Command::Abort) => {
                warn!(point = self.name, "Injecting abort");
                Step::Done(FaultAction::Abort)
            }
            Some(_) => match commands.pop_front() {
                Some(Command::Sleep(duration)) => {
                    warn!(point = self.name, ?duration, "Injecting sleep");
                    Step::Sleep(duration)
                }
                Some(Command::Error) => {
                    warn!(point = self.name, "Injecting error");
                    Step::Done(FaultAction::Fail(format!("Fault injected from {}", self.name)))
                }
                _ => Step::Done(FaultAction::Continue),
            },
        }
    }

    /// Run the point from a blocking thread.
    pub fn inject(&self) -> FaultAction {
        loop {
            match self.next_step() {
                Step::Sleep(duration) => std::thread::sleep(duration),
                Step::Done(action) => return action,
            }
        }
    }

    /// Run the point from async code.
    pub async fn inject_async(&self) -> FaultAction {
        loop {
            match self.next_step() {
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::Done(action) => return action,
            }
        }
    }
}
