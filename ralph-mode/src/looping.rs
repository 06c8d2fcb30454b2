//! Driver for `ralph-mode run`: feed the prompt to an agent until the loop ends.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::controller::LoopController;
use crate::core::decision::{AllowReason, ExitDecision};
use crate::error::LoopResult;
use crate::intercept::ExitInterceptor;
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::connectivity::ConnectivityProbe;
use crate::outage::{OutageGuard, WaitNotifier};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The completion promise ended a single-prompt loop.
    Completed,
    /// Every batch task finished.
    BatchComplete,
    /// `max_iterations` was reached.
    LimitReached,
    /// The loop was finished or disabled by someone else.
    Inactive,
    /// The interceptor could not read the loop and allowed the exit.
    Unavailable { message: Option<String> },
}

/// Summary of a `run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub cycles: u32,
    pub stop: LoopStop,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// One finished agent cycle, passed to the progress callback.
#[derive(Debug)]
pub struct CycleReport<'a> {
    pub cycle: u32,
    pub run: &'a AgentRun,
    pub decision: &'a ExitDecision,
}

/// Run agent cycles until the interceptor allows an exit.
///
/// Each cycle waits for connectivity, runs the agent on the current prompt,
/// and hands its output to the exit interceptor exactly like the hook does.
#[instrument(skip_all)]
pub fn run_loop<A, P, N, F>(
    controller: &LoopController,
    agent: &A,
    guard: &OutageGuard<'_, P, N>,
    settings: &RunSettings,
    mut on_cycle: F,
) -> LoopResult<LoopOutcome>
where
    A: Agent,
    P: ConnectivityProbe,
    N: WaitNotifier,
    F: FnMut(&CycleReport<'_>),
{
    let interceptor = ExitInterceptor::new(controller);
    let workdir = controller.store().paths().root().to_path_buf();
    let mut prompt = controller.current_prompt()?;
    let mut cycles = 0u32;
    loop {
        let (run, decision) = guard.run_cycle(|| {
            let run = agent.run(&AgentRequest {
                workdir: workdir.clone(),
                prompt: prompt.clone(),
                timeout: settings.timeout,
                output_limit_bytes: settings.output_limit_bytes,
            })?;
            let decision = interceptor.intercept(Some(&run.output));
            Ok((run, decision))
        })?;
        cycles += 1;
        on_cycle(&CycleReport {
            cycle: cycles,
            run: &run,
            decision: &decision,
        });

        let stop = match decision {
            // The block carries the prompt for the granted cycle, including
            // the final one after which the loop is already inactive.
            ExitDecision::Block { prompt: next, .. } => {
                debug!(cycles, "cycle blocked; continuing");
                prompt = next;
                continue;
            }
            ExitDecision::Allow { reason, message } => match reason {
                AllowReason::Completed => LoopStop::Completed,
                AllowReason::BatchComplete => LoopStop::BatchComplete,
                AllowReason::LimitReached => LoopStop::LimitReached,
                AllowReason::Inactive | AllowReason::NoLoop => LoopStop::Inactive,
                AllowReason::Corrupted => LoopStop::Unavailable { message },
            },
        };
        return Ok(LoopOutcome { cycles, stop });
    }
}
