//! Exit interception: decide whether an agent may end its session.
//!
//! Each exit attempt is one atomic read-modify-write under the state lock, so
//! concurrent attempts are serialized and each granted cycle moves the global
//! counter by exactly one. Anything that prevents a reliable decision (missing
//! or corrupted state, I/O failure, lock timeout) allows the exit: the agent
//! must never be trapped by a broken loop.

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::controller::{CompleteOutcome, LoopController};
use crate::core::cycle::{CycleOutcome, advance_cycle, cycle_history, start_task_cycle};
use crate::core::decision::{AllowReason, ExitDecision, TaskPosition, iteration_banner};
use crate::core::task_queue::TaskQueue;
use crate::core::types::{HistoryEntry, HistoryEvent, LoopState};
use crate::error::LoopResult;
use crate::io::state_store::Loaded;

pub struct ExitInterceptor<'a> {
    controller: &'a LoopController,
}

impl<'a> ExitInterceptor<'a> {
    pub fn new(controller: &'a LoopController) -> Self {
        Self { controller }
    }

    /// Decide one exit attempt. `agent_output` is the agent's final message,
    /// scanned for the completion promise.
    #[instrument(skip_all, fields(has_output = agent_output.is_some()))]
    pub fn intercept(&self, agent_output: Option<&str>) -> ExitDecision {
        match self.decide(agent_output) {
            Ok(decision) => decision,
            Err(err) => {
                warn!(err = %err, "exit decision failed; allowing exit");
                ExitDecision::allow(
                    AllowReason::Corrupted,
                    Some(format!("⚠️ Ralph loop unavailable ({err}); allowing exit")),
                )
            }
        }
    }

    fn decide(&self, agent_output: Option<&str>) -> LoopResult<ExitDecision> {
        let decision = self.controller.store().with_existing_lock(|store| {
            let mut state = match store.load()? {
                Loaded::Missing => return Ok(ExitDecision::allow(AllowReason::NoLoop, None)),
                Loaded::Corrupted { reason } => {
                    warn!(reason = %reason, "loop state corrupted; allowing exit");
                    return Ok(ExitDecision::allow(
                        AllowReason::Corrupted,
                        Some(format!(
                            "⚠️ Ralph loop state is corrupted ({reason}); allowing exit. \
                             Run `ralph-mode disable` to reset."
                        )),
                    ));
                }
                Loaded::Present(state) => state,
            };
            if !state.active {
                return Ok(inactive_decision(&state));
            }

            let mut queue = self.controller.load_queue(&state)?;
            let previous_task = state.current_task_id.clone();
            let now = Utc::now();
            let mut history = Vec::new();
            let mut task_completed = false;
            let mut refused = false;

            if let Some(output) = agent_output {
                let (outcome, entries) =
                    self.controller
                        .apply_completion(&mut state, queue.as_mut(), output, now);
                history.extend(entries);
                match outcome {
                    CompleteOutcome::Completed { iteration } => {
                        store.save(&state)?;
                        store.append_history_all(&history)?;
                        return Ok(ExitDecision::allow(
                            AllowReason::Completed,
                            Some(format!(
                                "✅ Ralph loop complete: promise detected at iteration {iteration}"
                            )),
                        ));
                    }
                    CompleteOutcome::BatchCompleted { task_id } => {
                        store.save(&state)?;
                        store.append_history_all(&history)?;
                        return Ok(ExitDecision::allow(
                            AllowReason::BatchComplete,
                            Some(format!(
                                "✅ Ralph batch complete: last task {task_id} finished"
                            )),
                        ));
                    }
                    CompleteOutcome::TaskCompleted { .. } => task_completed = true,
                    CompleteOutcome::NoObservableChange => refused = true,
                    CompleteOutcome::NotComplete | CompleteOutcome::AlreadyFinished => {}
                }
            }

            let outcome = if task_completed
                && let Some(queue) = queue.as_ref()
            {
                start_task_cycle(&mut state, queue, now)
            } else {
                advance_cycle(&mut state, queue.as_mut(), now)
            };
            match &outcome {
                CycleOutcome::TaskAdvanced { task_id, .. } if task_completed => {
                    history.push(
                        HistoryEntry::new(HistoryEvent::Iterate, outcome.iteration(), now)
                            .with_notes(format!("now on task {task_id}")),
                    );
                }
                CycleOutcome::TaskAdvanced { .. } => {
                    self.controller.refresh_baseline(&mut state);
                    history.extend(cycle_history(&outcome, previous_task.as_deref(), now));
                }
                _ => history.extend(cycle_history(&outcome, previous_task.as_deref(), now)),
            }

            // Read the prompt before committing so a failure leaves state untouched.
            let prompt = if outcome.granted() {
                Some(self.controller.prompt_for(queue.as_ref())?)
            } else {
                None
            };
            store.save(&state)?;
            store.append_history_all(&history)?;

            let decision = match prompt {
                Some(prompt) => ExitDecision::Block {
                    prompt,
                    banner: block_banner(&state, queue.as_ref(), refused),
                },
                None => limit_decision(&outcome),
            };
            debug!(?outcome, block = decision.is_block(), "exit decided");
            Ok(decision)
        })?;
        Ok(decision.unwrap_or(ExitDecision::allow(AllowReason::NoLoop, None)))
    }
}

fn block_banner(state: &LoopState, queue: Option<&TaskQueue>, refused: bool) -> String {
    let position = queue.map(|queue| TaskPosition {
        task: queue.current(),
        number: queue.position() + 1,
        total: queue.len(),
    });
    let mut banner = iteration_banner(state, position);
    if !state.active {
        banner.push_str(" | final iteration");
    }
    if refused {
        banner.push_str(" | completion refused: no observable change in the workspace");
    }
    banner
}

fn inactive_decision(state: &LoopState) -> ExitDecision {
    if state.limit_reached() {
        return ExitDecision::allow(
            AllowReason::LimitReached,
            Some(format!(
                "🛑 Ralph loop: max iterations ({}) reached",
                state.max_iterations
            )),
        );
    }
    ExitDecision::allow(AllowReason::Inactive, None)
}

fn limit_decision(outcome: &CycleOutcome) -> ExitDecision {
    match outcome {
        CycleOutcome::BatchComplete { .. } => {
            info!("batch finished on task budget");
            ExitDecision::allow(
                AllowReason::BatchComplete,
                Some("✅ Ralph batch finished: last task used its iteration budget".to_string()),
            )
        }
        _ => {
            info!(iteration = outcome.iteration(), "iteration limit reached");
            ExitDecision::allow(
                AllowReason::LimitReached,
                Some(format!(
                    "🛑 Ralph loop: max iterations reached at iteration {}",
                    outcome.iteration()
                )),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TempWorkspace, task};
    use std::fs;

    #[test]
    fn no_loop_allows_silently() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        let decision = ExitInterceptor::new(&controller).intercept(None);
        assert_eq!(decision, ExitDecision::allow(AllowReason::NoLoop, None));
        assert!(!controller.store().paths().state_dir.exists());
    }

    #[test]
    fn busy_lock_fails_open() {
        let ws = TempWorkspace::new();
        ws.controller().enable("work", 0, None).expect("enable");
        let impatient = LoopController::new(crate::io::state_store::StateStore::new(
            ws.paths(),
            std::time::Duration::from_millis(50),
        ));

        let held = crate::io::lock::StateLock::acquire(
            &ws.paths().lock_path,
            std::time::Duration::from_millis(100),
        )
        .expect("hold lock");
        let decision = ExitInterceptor::new(&impatient).intercept(Some("output"));
        drop(held);

        assert!(!decision.is_block());
        assert!(matches!(
            decision,
            ExitDecision::Allow {
                reason: AllowReason::Corrupted,
                ..
            }
        ));
        assert_eq!(impatient.store().load_required().expect("state").iteration, 1);
    }

    #[test]
    fn blocks_with_unchanged_prompt_and_counts_iterations() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller
            .enable("Make the tests pass", 0, Some("DONE".to_string()))
            .expect("enable");
        let interceptor = ExitInterceptor::new(&controller);

        for expected in 2..=4 {
            match interceptor.intercept(Some("still working")) {
                ExitDecision::Block { prompt, banner } => {
                    assert_eq!(prompt, "Make the tests pass");
                    assert!(banner.starts_with(&format!("🔄 Ralph iteration {expected}/∞")));
                    assert!(banner.contains("<promise>DONE</promise>"));
                }
                other => panic!("expected block, got {other:?}"),
            }
        }
        assert_eq!(controller.store().load_required().expect("load").iteration, 4);
    }

    #[test]
    fn max_iterations_grants_final_cycle_then_allows() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 3, None).expect("enable");
        let interceptor = ExitInterceptor::new(&controller);

        assert!(interceptor.intercept(None).is_block());
        let last = interceptor.intercept(None);
        match &last {
            ExitDecision::Block { banner, .. } => assert!(banner.contains("final iteration")),
            other => panic!("expected block, got {other:?}"),
        }
        let state = controller.store().load_required().expect("load");
        assert_eq!(state.iteration, 3);
        assert!(!state.active);

        match interceptor.intercept(None) {
            ExitDecision::Allow { reason, .. } => assert_eq!(reason, AllowReason::LimitReached),
            other => panic!("expected allow, got {other:?}"),
        }
        assert_eq!(controller.store().load_required().expect("load").iteration, 3);
    }

    #[test]
    fn limit_of_one_allows_first_exit() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 1, None).expect("enable");
        match ExitInterceptor::new(&controller).intercept(None) {
            ExitDecision::Allow { reason, .. } => assert_eq!(reason, AllowReason::LimitReached),
            other => panic!("expected allow, got {other:?}"),
        }
        assert!(!controller.store().load_required().expect("load").active);
    }

    #[test]
    fn promise_in_output_allows_and_finishes() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller
            .enable("work", 0, Some("DONE".to_string()))
            .expect("enable");
        let decision =
            ExitInterceptor::new(&controller).intercept(Some("finished <promise>DONE</promise>"));
        match decision {
            ExitDecision::Allow { reason, .. } => assert_eq!(reason, AllowReason::Completed),
            other => panic!("expected allow, got {other:?}"),
        }
        let state = controller.store().load_required().expect("load");
        assert!(!state.active);
        assert_eq!(state.iteration, 1);
    }

    #[test]
    fn batch_promise_moves_to_next_task_and_blocks() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller
            .batch_init(vec![task("A"), task("B")], 5, 0, Some("DONE".to_string()))
            .expect("batch-init");
        let interceptor = ExitInterceptor::new(&controller);

        match interceptor.intercept(Some("<promise>DONE</promise>")) {
            ExitDecision::Block { prompt, banner } => {
                assert_eq!(prompt, "B prompt");
                assert!(banner.contains("task 2/2 B"));
            }
            other => panic!("expected block, got {other:?}"),
        }
        let state = controller.store().load_required().expect("load");
        assert_eq!(state.iteration, 2);
        assert_eq!(state.batch.as_ref().map(|b| b.task_iteration), Some(1));

        match interceptor.intercept(Some("<promise>DONE</promise>")) {
            ExitDecision::Allow { reason, .. } => assert_eq!(reason, AllowReason::BatchComplete),
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[test]
    fn task_budget_advances_queue_then_finishes_batch() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller
            .batch_init(vec![task("A"), task("B")], 2, 0, None)
            .expect("batch-init");
        let interceptor = ExitInterceptor::new(&controller);

        let prompts: Vec<_> = (0..3)
            .map(|_| match interceptor.intercept(None) {
                ExitDecision::Block { prompt, .. } => prompt,
                other => panic!("expected block, got {other:?}"),
            })
            .collect();
        assert_eq!(prompts, vec!["A prompt", "B prompt", "B prompt"]);

        match interceptor.intercept(None) {
            ExitDecision::Allow { reason, .. } => assert_eq!(reason, AllowReason::BatchComplete),
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[test]
    fn corrupted_state_fails_open_with_message() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 0, None).expect("enable");
        fs::write(&controller.store().paths().state_path, "not json").expect("corrupt");

        match ExitInterceptor::new(&controller).intercept(None) {
            ExitDecision::Allow { reason, message } => {
                assert_eq!(reason, AllowReason::Corrupted);
                assert!(message.expect("message").contains("corrupted"));
            }
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[test]
    fn missing_prompt_fails_open_without_counting() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 0, None).expect("enable");
        fs::remove_file(&controller.store().paths().prompt_path).expect("remove prompt");

        let decision = ExitInterceptor::new(&controller).intercept(None);
        assert!(!decision.is_block());
        assert_eq!(controller.store().load_required().expect("load").iteration, 1);
    }

    #[test]
    fn disabled_loop_allows() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 0, None).expect("enable");
        controller.disable().expect("disable");
        assert_eq!(
            ExitInterceptor::new(&controller).intercept(None),
            ExitDecision::allow(AllowReason::NoLoop, None)
        );
    }
}
