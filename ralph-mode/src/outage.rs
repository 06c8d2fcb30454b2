//! Connectivity outage guard for the `run` driver.
//!
//! Before each agent cycle the guard asks a [`ConnectivityProbe`] whether the
//! backend is reachable. While it is not, the guard polls on a fixed interval
//! and reports each wait through a [`WaitNotifier`]. Waiting never touches the
//! iteration counter and never produces an exit decision.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::types::{HistoryEntry, HistoryEvent};
use crate::error::LoopResult;
use crate::io::connectivity::ConnectivityProbe;
use crate::io::state_store::{Loaded, StateStore};

/// One failed connectivity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageWait {
    /// 1-based count of failed checks in this outage.
    pub check: u32,
    pub waited: Duration,
    pub retry_in: Duration,
}

/// A finished outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutageSummary {
    pub checks: u32,
    pub waited: Duration,
}

/// Receives outage progress (user-visible waiting notices).
pub trait WaitNotifier {
    fn waiting(&self, wait: &OutageWait);
    fn resumed(&self, summary: &OutageSummary);
}

/// Prints waiting notices to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrNotifier;

impl WaitNotifier for StderrNotifier {
    fn waiting(&self, wait: &OutageWait) {
        warn!(check = wait.check, waited_secs = wait.waited.as_secs(), "connectivity lost");
        eprintln!(
            "⏸ connectivity unavailable (check {}, offline {}s); retrying in {}s",
            wait.check,
            wait.waited.as_secs(),
            wait.retry_in.as_secs()
        );
    }

    fn resumed(&self, summary: &OutageSummary) {
        info!(checks = summary.checks, "connectivity restored");
        eprintln!(
            "▶ connectivity restored after {}s; resuming",
            summary.waited.as_secs()
        );
    }
}

pub struct OutageGuard<'a, P, N> {
    store: &'a StateStore,
    probe: P,
    notifier: N,
    poll_interval: Duration,
    max_wait: Option<Duration>,
}

impl<'a, P: ConnectivityProbe, N: WaitNotifier> OutageGuard<'a, P, N> {
    pub fn new(store: &'a StateStore, probe: P, notifier: N, poll_interval: Duration) -> Self {
        Self {
            store,
            probe,
            notifier,
            poll_interval,
            max_wait: None,
        }
    }

    /// Give up once offline for `max_wait`; zero waits indefinitely.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = (!max_wait.is_zero()).then_some(max_wait);
        self
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Block until the probe reports online.
    ///
    /// Returns `None` when connectivity was already available.
    #[instrument(skip_all)]
    pub fn await_connectivity(&self) -> LoopResult<Option<OutageSummary>> {
        if self.probe.is_online() {
            return Ok(None);
        }
        let start = Instant::now();
        let mut check = 1;
        loop {
            let waited = start.elapsed();
            if let Some(max_wait) = self.max_wait
                && waited >= max_wait
            {
                warn!(waited_secs = waited.as_secs(), "outage exceeded max wait");
                return Err(anyhow!(
                    "connectivity still unavailable after {}s",
                    waited.as_secs()
                )
                .into());
            }
            self.notifier.waiting(&OutageWait {
                check,
                waited,
                retry_in: self.poll_interval,
            });
            if check == 1 {
                self.record(HistoryEvent::OutageWait, "connectivity lost".to_string());
            }
            thread::sleep(self.poll_interval);
            check += 1;

            if self.probe.is_online() {
                let summary = OutageSummary {
                    checks: check,
                    waited: start.elapsed(),
                };
                self.notifier.resumed(&summary);
                self.record(
                    HistoryEvent::OutageResumed,
                    format!("offline for {}s", summary.waited.as_secs()),
                );
                return Ok(Some(summary));
            }
        }
    }

    /// Run `cycle` once connectivity is available.
    pub fn run_cycle<T>(&self, cycle: impl FnOnce() -> LoopResult<T>) -> LoopResult<T> {
        self.await_connectivity()?;
        cycle()
    }

    /// Outage history belongs to a live loop only.
    fn record(&self, event: HistoryEvent, notes: String) {
        let iteration = match self.store.load() {
            Ok(Loaded::Present(state)) => state.iteration,
            Ok(_) => return,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "skipping outage history");
                return;
            }
        };
        let entry = HistoryEntry::new(event, iteration, Utc::now()).with_notes(notes);
        if let Err(err) = self.store.append_history(&entry) {
            warn!(err = %format!("{err:#}"), "failed to append outage history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingNotifier, ScriptedProbe, TempWorkspace};

    #[test]
    fn online_probe_passes_straight_through() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        let guard = OutageGuard::new(
            controller.store(),
            ScriptedProbe::new([true]),
            RecordingNotifier::default(),
            Duration::from_millis(1),
        );
        assert_eq!(guard.await_connectivity().expect("await"), None);
        assert!(guard.notifier().waits().is_empty());
    }

    #[test]
    fn waits_without_counting_iterations() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        controller.enable("work", 0, None).expect("enable");
        let guard = OutageGuard::new(
            controller.store(),
            ScriptedProbe::new([false, false, false, true]),
            RecordingNotifier::default(),
            Duration::from_millis(1),
        );

        let value = guard.run_cycle(|| Ok(42)).expect("cycle");
        assert_eq!(value, 42);

        let checks: Vec<_> = guard.notifier().waits().iter().map(|w| w.check).collect();
        assert_eq!(checks, vec![1, 2, 3]);
        assert_eq!(guard.notifier().resumed_count(), 1);
        assert_eq!(controller.store().load_required().expect("load").iteration, 1);

        let events: Vec<_> = controller
            .history()
            .expect("history")
            .iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(
            events,
            vec![
                HistoryEvent::Started,
                HistoryEvent::OutageWait,
                HistoryEvent::OutageResumed
            ]
        );
    }

    #[test]
    fn gives_up_after_max_wait() {
        let ws = TempWorkspace::new();
        let controller = ws.controller();
        let guard = OutageGuard::new(
            controller.store(),
            ScriptedProbe::new([false]),
            RecordingNotifier::default(),
            Duration::from_millis(5),
        )
        .with_max_wait(Duration::from_millis(20));

        let err = guard.run_cycle(|| Ok(())).unwrap_err();
        assert!(err.to_string().contains("connectivity still unavailable"));
        assert!(!controller.store().paths().history_path.exists());
    }
}
