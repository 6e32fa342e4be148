//! Detection state shared by the probing loop, probe hooks and callers.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};

use asdf_present_hook::FnPtr;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::{
    backend::{Backend, vulkan::Capture},
    dispatch::InFlight,
    module::ModuleHandle,
    types::{Api, CandidateKind},
};

/// Phase of a detection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    Confirmed,
    TimedOut,
    Cancelled,
}

/// Terminal outcome of a detection run.
#[derive(Debug, Clone)]
pub enum DetectOutcome {
    /// Backend of the confirmed api, attached to the host.
    Confirmed(Arc<Backend>),
    /// No candidate confirmed before the deadline.
    TimedOut,
    Cancelled,
}

impl DetectOutcome {
    pub fn backend(&self) -> Option<&Arc<Backend>> {
        match self {
            DetectOutcome::Confirmed(backend) => Some(backend),
            _ => None,
        }
    }
}

/// One probing loop run, joined by every `detect` call made while it runs.
#[derive(Debug, Default)]
pub(crate) struct Run {
    outcome: OnceCell<DetectOutcome>,
    joined: AtomicUsize,
}

impl Run {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(outcome: DetectOutcome) -> Self {
        let run = Self::new();
        let _ = run.outcome.set(outcome);
        run
    }

    /// Set the outcome once. Callers must hold the state lock and notify afterwards.
    pub fn resolve(&self, outcome: DetectOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    #[inline]
    pub fn outcome(&self) -> Option<DetectOutcome> {
        self.outcome.get().cloned()
    }

    #[inline]
    pub fn join(&self) {
        self.joined.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn leave(&self) {
        self.joined.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn joined(&self) -> usize {
        self.joined.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProbeStatus {
    /// Not probed for the current module load.
    Pending,
    /// Probe hooks installed on `targets`.
    Installed {
        module: ModuleHandle,
        targets: Vec<FnPtr>,
    },
    /// Skipped until the module is loaded under another handle.
    Exhausted(ModuleHandle),
}

#[derive(Debug)]
pub(crate) struct Probe {
    pub kind: CandidateKind,
    pub status: ProbeStatus,
}

#[derive(Debug)]
pub(crate) struct DetectionState {
    pub phase: Phase,
    pub run: Option<Arc<Run>>,
    pub deadline: Instant,
    /// Probing loops still running, including ones exiting after cancellation.
    pub loops: usize,
    pub backend: Option<Arc<Backend>>,

    pub probes: Vec<Probe>,
    /// First confirmation reported by a probe, not adopted yet.
    pub confirmation: Option<(CandidateKind, Api)>,
    /// Candidates a probe asked to give up on.
    pub exhausted: Vec<CandidateKind>,
}

impl DetectionState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            run: None,
            deadline: Instant::now(),
            loops: 0,
            backend: None,

            probes: Vec::new(),
            confirmation: None,
            exhausted: Vec::new(),
        }
    }

    /// `true` if `run` is the run this state is probing for.
    pub fn is_probing(&self, run: &Arc<Run>) -> bool {
        self.phase == Phase::Probing
            && self
                .run
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, run))
    }

    /// Start a new run from idle.
    pub fn restart(&mut self, candidates: &[CandidateKind], deadline: Instant) -> Arc<Run> {
        let run = Arc::new(Run::new());

        self.phase = Phase::Probing;
        self.run = Some(run.clone());
        self.deadline = deadline;
        self.backend = None;
        self.probes = candidates
            .iter()
            .map(|&kind| Probe {
                kind,
                status: ProbeStatus::Pending,
            })
            .collect();
        self.confirmation = None;
        self.exhausted.clear();

        run
    }

    pub fn probe_mut(&mut self, kind: CandidateKind) -> Option<&mut Probe> {
        self.probes.iter_mut().find(|probe| probe.kind == kind)
    }
}

/// State shared with probe hooks.
pub(crate) struct Shared {
    pub state: Mutex<DetectionState>,
    pub cond: Condvar,
    /// Probe replacements currently running.
    pub in_flight: InFlight,
    /// Owner of the Vulkan capture hooks installed with the Vulkan probe.
    pub capture: Arc<Capture>,
    pub min_gl_version: (u32, u32),
}

impl Shared {
    pub fn new(min_gl_version: (u32, u32)) -> Self {
        Self {
            state: Mutex::new(DetectionState::new()),
            cond: Condvar::new(),
            in_flight: InFlight::new(),
            capture: Arc::default(),
            min_gl_version,
        }
    }

    /// Report a confirmed api. Only the first confirmation of a run is kept.
    pub fn confirm(&self, kind: CandidateKind, api: Api) {
        let mut state = self.state.lock();
        if state.phase != Phase::Probing || state.confirmation.is_some() {
            return;
        }

        debug!("{kind} probe confirmed {api}");
        state.confirmation = Some((kind, api));
        self.cond.notify_all();
    }

    /// Ask the probing loop to give up on `kind` for its current module load.
    pub fn exhaust(&self, kind: CandidateKind) {
        let mut state = self.state.lock();
        if state.phase != Phase::Probing || state.exhausted.contains(&kind) {
            return;
        }

        debug!("{kind} probe exhausted");
        state.exhausted.push(kind);
        self.cond.notify_all();
    }
}
