use crate::error::Error;
use shutdown::{ShutdownEvent, StopSignal};
use std::{future::Future, io::Write, time::Duration};
use tokio::{
    signal::unix::SignalKind,
    task::{JoinError, JoinSet},
};

/// The notice printed once when the first interrupt starts draining.
const FORCE_EXIT_NOTICE: &str = "Shutting down, a second interrupt forces immediate exit";

/// State of a session, which only ever advances forward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum State {
    /// Tasks are being launched.
    Starting,
    /// Tasks are running.
    Running,
    /// The stop signal has fired and tasks are given the grace period to finish.
    Draining,
    /// Terminal state.
    Stopped,
}

/// How a session reached `State::Stopped`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Stopped {
    /// An interrupt arrived while starting, before any task was launched.
    Interrupted,
    /// No task was left running when the grace period elapsed.
    Completed,
    /// The grace period elapsed with tasks still running.
    GraceElapsed,
    /// A second interrupt cut the grace period short.
    /// Tasks may still be running, the caller is expected to exit the process.
    Forced,
}

type TaskOutput = (&'static str, Result<(), Error>);

/// Owns the shared stop signal of a session and supervises its tasks.
///
/// The first interrupt, or a task failure, fires the stop signal and starts the grace
/// period. The session is stopped once the grace period has elapsed, or earlier if a
/// second interrupt arrives.
pub struct Lifecycle<E, W = std::io::Stderr> {
    interrupts: E,
    interrupts_open: bool,
    interrupts_received: u32,
    grace: Duration,
    stop: StopSignal,
    state: State,
    notified: bool,
    notice: W,
    tasks: JoinSet<TaskOutput>,
}

impl<E: ShutdownEvent> Lifecycle<E> {
    /// Returns a new `Self` printing its notice to stderr.
    /// # Arguments
    /// * `interrupts` - the source of process interrupts
    /// * `grace` - how long tasks may take to finish after the stop signal
    pub fn new(interrupts: E, grace: Duration) -> Self {
        Self {
            interrupts,
            interrupts_open: true,
            interrupts_received: 0,
            grace,
            stop: StopSignal::new(),
            state: State::Starting,
            notified: false,
            notice: std::io::stderr(),
            tasks: JoinSet::new(),
        }
    }
}

impl<E: ShutdownEvent, W: Write> Lifecycle<E, W> {
    /// Modify and return `Self` printing its notice to the given writer.
    pub fn with_notice<N: Write>(self, notice: N) -> Lifecycle<E, N> {
        Lifecycle {
            interrupts: self.interrupts,
            interrupts_open: self.interrupts_open,
            interrupts_received: self.interrupts_received,
            grace: self.grace,
            stop: self.stop,
            state: self.state,
            notified: self.notified,
            notice,
            tasks: self.tasks,
        }
    }
    /// The stop signal every task must observe.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }
    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Run a starting step, such as resolving the target, unless an interrupt comes first.
    /// An interrupt fires the stop signal and stops the session before anything is
    /// launched, in which case `None` is returned.
    pub async fn starting<F: Future>(&mut self, step: F) -> Option<F::Output> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                biased;
                signal = self.interrupts.wait(), if self.interrupts_open => match signal {
                    Some(signal) => {
                        self.interrupted(signal);
                        self.advance(State::Draining);
                        self.stop.stop();
                        self.advance(State::Stopped);
                        return None;
                    }
                    None => self.interrupts_open = false,
                },
                output = &mut step => return Some(output),
            }
        }
    }

    /// Launch a named task.
    /// An error returned by the task is fatal: it drives the same shutdown as an interrupt.
    pub fn launch<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        debug_assert_eq!(self.state, State::Starting, "tasks are launched while starting");
        tracing::debug!(task = name, "launching task");
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Supervise the launched tasks until the session is stopped.
    /// A fatal task error is returned once stopped, unless the stop was forced.
    pub async fn supervise(mut self) -> Result<Stopped, Error> {
        let mut tasks = std::mem::take(&mut self.tasks);
        let mut failure = None;
        self.advance(State::Running);

        let stopped = self.stop.wait();
        tokio::pin!(stopped);
        while !tasks.is_empty() {
            tokio::select! {
                signal = self.interrupts.wait(), if self.interrupts_open => match signal {
                    Some(signal) => {
                        self.interrupted(signal);
                        break;
                    }
                    None => self.interrupts_open = false,
                },
                _ = &mut stopped => {
                    tracing::debug!("stop signal fired");
                    break;
                }
                Some(joined) = tasks.join_next() => {
                    if let Some(error) = Self::joined(joined) {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }

        self.drain();
        let grace = tokio::time::sleep(self.grace);
        tokio::pin!(grace);
        let outcome = loop {
            tokio::select! {
                _ = &mut grace => match tasks.len() {
                    0 => break Stopped::Completed,
                    remaining => {
                        tracing::warn!(grace = ?self.grace, remaining, "grace period elapsed");
                        break Stopped::GraceElapsed;
                    }
                },
                signal = self.interrupts.wait(), if self.interrupts_open => match signal {
                    Some(signal) => {
                        self.interrupted(signal);
                        break Stopped::Forced;
                    }
                    None => self.interrupts_open = false,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(error) = Self::joined(joined) {
                        failure.get_or_insert(error);
                    }
                }
            }
        };
        // whatever is left is not waited for, nor aborted
        tasks.detach_all();
        self.advance(State::Stopped);

        match (outcome, failure) {
            (Stopped::Forced, _) => Ok(Stopped::Forced),
            (_, Some(error)) => Err(error),
            (outcome, None) => Ok(outcome),
        }
    }

    /// Advance the state machine, which never goes backwards.
    fn advance(&mut self, next: State) {
        if next <= self.state {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn interrupted(&mut self, signal: SignalKind) {
        self.interrupts_received += 1;
        tracing::info!(?signal, count = self.interrupts_received, state = ?self.state, "interrupted");
    }

    /// Enter `Draining`: fire the stop signal and print the notice, both exactly once.
    fn drain(&mut self) {
        self.advance(State::Draining);
        self.stop.stop();
        if !self.notified {
            self.notified = true;
            writeln!(self.notice, "{FORCE_EXIT_NOTICE}").ok();
        }
    }

    fn joined(joined: Result<TaskOutput, JoinError>) -> Option<Error> {
        match joined {
            Ok((name, Ok(()))) => {
                tracing::debug!(task = name, "task finished");
                None
            }
            Ok((name, Err(error))) => {
                tracing::error!(task = name, %error, "task failed");
                Some(error)
            }
            Err(source) => {
                tracing::error!(error = %source, "task did not complete");
                Some(Error::Task { source })
            }
        }
    }
}
