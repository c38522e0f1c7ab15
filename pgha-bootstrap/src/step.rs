use cmd_lib::*;
use std::fmt;
use std::io::Error;

/// What a failed step means for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the run. Nothing done so far is rolled back.
    Fatal,
    /// Log a warning and keep going, e.g. stopping a service that was never installed.
    Tolerated,
}

/// One external command together with its declared failure policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub description: String,
    pub program: String,
    pub args: Vec<String>,
    pub policy: FailurePolicy,
}

impl Step {
    pub fn new(description: impl Into<String>, program: &str) -> Self {
        Self {
            description: description.into(),
            program: program.to_string(),
            args: Vec::new(),
            policy: FailurePolicy::Fatal,
        }
    }

    /// A read-only query; the description is only used in error messages.
    pub fn query(program: &str, args: &[&str]) -> Self {
        Self::new(format!("query `{program}`"), program).args(args)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args
            .extend(args.iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn tolerated(mut self) -> Self {
        self.policy = FailurePolicy::Tolerated;
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push_str(&format!("{arg:?}"));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Executes steps. `execute`, `capture` and `probe` do the raw work; `run`
/// applies the step's failure policy on top of `execute`.
pub trait Runner {
    fn execute(&mut self, step: &Step) -> CmdResult;

    fn capture(&mut self, step: &Step) -> FunResult;

    /// Existence checks: a failing command means "absent", never an error.
    fn probe(&mut self, step: &Step) -> bool {
        self.capture(step).is_ok()
    }

    fn run(&mut self, step: &Step) -> CmdResult {
        info!("{}", step.description);
        match self.execute(step) {
            Ok(()) => Ok(()),
            Err(e) => match step.policy {
                FailurePolicy::Tolerated => {
                    warn!("`{step}` failed, ignoring: {e}");
                    Ok(())
                }
                FailurePolicy::Fatal => Err(Error::other(format!(
                    "{} (`{step}`) failed: {e}",
                    step.description
                ))),
            },
        }
    }

    fn run_all(&mut self, steps: &[Step]) -> CmdResult {
        for step in steps {
            self.run(step)?;
        }
        Ok(())
    }

    fn output(&mut self, step: &Step) -> FunResult {
        self.capture(step)
            .map_err(|e| Error::other(format!("`{step}` failed: {e}")))
    }
}

/// Runs steps on the local machine through `cmd_lib`.
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn execute(&mut self, step: &Step) -> CmdResult {
        let program = &step.program;
        let args = &step.args;
        run_cmd!($program $[args])
    }

    fn capture(&mut self, step: &Step) -> FunResult {
        let program = &step.program;
        let args = &step.args;
        run_fun!($program $[args])
    }

    fn probe(&mut self, step: &Step) -> bool {
        let program = &step.program;
        let args = &step.args;
        run_cmd!($program $[args] &>/dev/null).is_ok()
    }
}
