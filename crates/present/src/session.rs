//! Detection entry point for hosts.

use core::time::Duration;
use std::{
    sync::Arc,
    thread,
    time::Instant,
};

use tracing::{debug, error, warn};

use crate::{
    backend::{Backend, lifecycle},
    config::DetectConfig,
    detect::{
        RendererDetector,
        state::{DetectOutcome, Phase, Run, Shared},
    },
    overlay::Overlay,
    platform::Platform,
};

/// Result of [`DetectionSession::detect`], resolved by the probing loop.
pub struct PendingDetection {
    run: Arc<Run>,
    shared: Arc<Shared>,
}

impl PendingDetection {
    fn new(run: Arc<Run>, shared: Arc<Shared>) -> Self {
        run.join();
        Self { run, shared }
    }

    /// Block until the run resolves.
    pub fn wait(&self) -> DetectOutcome {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = self.run.outcome() {
                return outcome;
            }

            self.shared.cond.wait(&mut state);
        }
    }

    /// Block until the run resolves or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DetectOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = self.run.outcome() {
                return Some(outcome);
            }

            if self
                .shared
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return self.run.outcome();
            }
        }
    }

    /// Outcome if the run already resolved.
    pub fn try_outcome(&self) -> Option<DetectOutcome> {
        self.run.outcome()
    }
}

impl Drop for PendingDetection {
    fn drop(&mut self) {
        self.run.leave();
    }
}

/// Runtime graphics api detection of one process.
///
/// Concurrent [`DetectionSession::detect`] calls share one probing loop.
pub struct DetectionSession {
    detector: Arc<RendererDetector>,
}

impl DetectionSession {
    pub fn new(platform: Platform, overlay: Arc<dyn Overlay>, config: DetectConfig) -> Self {
        Self {
            detector: Arc::new(RendererDetector::new(platform, overlay, config)),
        }
    }

    #[inline]
    pub fn config(&self) -> &DetectConfig {
        self.detector.config()
    }

    /// Detect with the configured default timeout.
    pub fn detect_default(&self) -> PendingDetection {
        self.detect(self.config().timeout)
    }

    /// Start detection or join the running one.
    ///
    /// Resolves right away with a live confirmed backend. A run ended by timeout or
    /// cancellation is restarted from idle.
    #[tracing::instrument(skip(self))]
    pub fn detect(&self, timeout: Duration) -> PendingDetection {
        let shared = self.detector.shared();
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();

        match state.phase {
            Phase::Confirmed => {
                if let Some(backend) = state.backend.clone().filter(|backend| backend.is_attached())
                {
                    debug!("{} already confirmed", backend.name());
                    let run = Arc::new(Run::resolved(DetectOutcome::Confirmed(backend)));
                    return PendingDetection::new(run, shared.clone());
                }

                debug!("confirmed backend was detached, restarting");
            }

            Phase::Probing => {
                if let Some(run) = state.run.clone() {
                    if deadline > state.deadline {
                        state.deadline = deadline;
                        shared.cond.notify_all();
                    }

                    debug!("joining running detection");
                    return PendingDetection::new(run, shared.clone());
                }
            }

            Phase::Idle | Phase::TimedOut | Phase::Cancelled => {}
        }

        // a loop of the last run may still be removing its probes
        if state.loops > 0
            && shared
                .cond
                .wait_while_for(&mut state, |state| state.loops > 0, self.config().cancel_timeout)
                .timed_out()
        {
            warn!("previous probing loop is still running");
        }

        let run = state.restart(&self.config().candidates, deadline);
        state.loops += 1;
        let pending = PendingDetection::new(run.clone(), shared.clone());
        drop(state);

        let detector = self.detector.clone();
        let spawned = thread::Builder::new()
            .name("asdf-present-detect".into())
            .spawn({
                let run = run.clone();
                move || {
                    lifecycle::contain("probing loop", || detector.run(&run));
                    detector.finish(&run);
                }
            });

        if let Err(err) = spawned {
            error!("failed to spawn probing thread. err: {err}");
            self.detector.finish(&run);
        }

        pending
    }

    /// Stop a running detection.
    ///
    /// Joined callers resolve to [`DetectOutcome::Cancelled`]. Returns `false` if the probing
    /// loop did not exit within the cancel timeout.
    #[tracing::instrument(skip(self))]
    pub fn cancel(&self) -> bool {
        let shared = self.detector.shared();
        let mut state = shared.state.lock();

        if state.phase == Phase::Probing {
            debug!("cancelling detection");
            state.phase = Phase::Cancelled;
            if let Some(run) = &state.run {
                run.resolve(DetectOutcome::Cancelled);
            }
            shared.cond.notify_all();
        }

        let timeout = self.config().cancel_timeout;
        let stopped = !shared
            .cond
            .wait_while_for(&mut state, |state| state.loops > 0, timeout)
            .timed_out();

        if !stopped {
            warn!("probing loop did not stop within {timeout:?}");
        }
        stopped
    }

    /// Cancel detection and detach the confirmed backend.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        self.cancel();

        let backend = {
            let mut state = self.detector.shared().state.lock();
            state.phase = Phase::Idle;
            state.run = None;
            state.backend.take()
        };

        if let Some(backend) = backend {
            backend.detach();
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.detector.shared().state.lock().phase
    }

    /// Backend of the last confirmation, if still attached.
    pub fn backend(&self) -> Option<Arc<Backend>> {
        let state = self.detector.shared().state.lock();
        if state.phase != Phase::Confirmed {
            return None;
        }

        state
            .backend
            .clone()
            .filter(|backend| backend.is_attached())
    }

    /// Number of callers waiting on the running detection.
    pub fn joined(&self) -> usize {
        let state = self.detector.shared().state.lock();
        match (state.phase, &state.run) {
            (Phase::Probing, Some(run)) => run.joined(),
            _ => 0,
        }
    }

    /// Number of probe hooks installed right now.
    pub fn probe_hook_count(&self) -> usize {
        self.detector.probe_hook_count()
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        self.cancel();
    }
}
