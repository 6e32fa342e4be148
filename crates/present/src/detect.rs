//! Runtime graphics api detection.
//!
//! Every tick the probing loop installs probe hooks on the candidates whose module is loaded.
//! The first probe confirming a live frame wins: every probe is removed and the backend of the
//! confirmed api is attached.

pub(crate) mod probe;
pub(crate) mod state;

use std::{sync::Arc, time::Instant};

use asdf_present_hook::{FnPtr, HookSet};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{Backend, lifecycle, vulkan},
    config::DetectConfig,
    dispatch,
    module::{self, ModuleHandle},
    overlay::Overlay,
    platform::Platform,
    types::{Api, CandidateKind},
};
use state::{DetectOutcome, Phase, ProbeStatus, Run, Shared};

/// Work of one tick, collected under the state lock and run without it.
#[derive(Debug, Default)]
struct Plan {
    install: Vec<(CandidateKind, ModuleHandle)>,
    retire: Vec<(CandidateKind, Vec<FnPtr>)>,
}

pub(crate) struct RendererDetector {
    platform: Platform,
    overlay: Arc<dyn Overlay>,
    config: DetectConfig,
    hooks: HookSet,
    shared: Arc<Shared>,
}

impl RendererDetector {
    pub fn new(platform: Platform, overlay: Arc<dyn Overlay>, config: DetectConfig) -> Self {
        Self {
            hooks: HookSet::new(platform.patcher.clone()),
            shared: Arc::new(Shared::new(config.min_gl_version)),
            platform,
            overlay,
            config,
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[inline]
    pub fn config(&self) -> &DetectConfig {
        &self.config
    }

    /// Number of probe hooks currently installed.
    pub fn probe_hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Run the probing loop of `run` until it resolves. Called on the detection thread.
    #[tracing::instrument(skip_all)]
    pub fn run(&self, run: &Arc<Run>) {
        debug!("probing loop started");

        loop {
            let loaded = self.loaded_modules();

            let plan = {
                let mut state = self.shared.state.lock();
                if !state.is_probing(run) {
                    debug!("run is no longer probing");
                    break;
                }

                if let Some(confirmation) = state.confirmation.take() {
                    drop(state);
                    if self.adopt(run, confirmation) {
                        break;
                    }

                    continue;
                }

                if Instant::now() >= state.deadline {
                    info!("no graphics api confirmed before deadline");
                    state.phase = Phase::TimedOut;
                    run.resolve(DetectOutcome::TimedOut);
                    self.shared.cond.notify_all();
                    break;
                }

                let exhausted = std::mem::take(&mut state.exhausted);
                let mut plan = Plan::default();
                for probe in state.probes.iter_mut() {
                    let current = loaded
                        .iter()
                        .find(|(kind, _)| *kind == probe.kind)
                        .and_then(|(_, handle)| *handle);

                    match &mut probe.status {
                        ProbeStatus::Pending => {
                            if let Some(handle) = current {
                                plan.install.push((probe.kind, handle));
                            }
                        }

                        ProbeStatus::Installed { module, targets }
                            if exhausted.contains(&probe.kind) =>
                        {
                            let module = *module;
                            plan.retire.push((probe.kind, std::mem::take(targets)));
                            probe.status = ProbeStatus::Exhausted(module);
                        }

                        ProbeStatus::Exhausted(module) => {
                            if let Some(handle) = current.filter(|handle| handle != module) {
                                debug!("{} module reloaded", probe.kind);
                                probe.status = ProbeStatus::Pending;
                                plan.install.push((probe.kind, handle));
                            }
                        }

                        _ => {}
                    }
                }

                plan
            };

            self.retire(plan.retire);
            let results = plan
                .install
                .into_iter()
                .map(|(kind, handle)| {
                    let res =
                        probe::install(kind, handle, &self.hooks, &self.shared, &self.platform);
                    (kind, handle, res)
                })
                .collect::<Vec<_>>();

            let mut state = self.shared.state.lock();
            for (kind, handle, res) in results {
                let Some(probe) = state.probe_mut(kind) else {
                    continue;
                };

                probe.status = match res {
                    Ok(targets) => ProbeStatus::Installed {
                        module: handle,
                        targets,
                    },
                    Err(err) => {
                        warn!("{kind} probe setup failed. err: {err}");
                        ProbeStatus::Exhausted(handle)
                    }
                };
            }

            if !state.is_probing(run) {
                break;
            }

            if state.confirmation.is_some() || !state.exhausted.is_empty() {
                continue;
            }

            let remaining = state.deadline.saturating_duration_since(Instant::now());
            self.shared
                .cond
                .wait_for(&mut state, self.config.tick.min(remaining));
        }
    }

    /// Clean up after [`RendererDetector::run`] returned, even by panic.
    pub fn finish(&self, run: &Arc<Run>) {
        self.remove_probes();

        let mut state = self.shared.state.lock();
        for probe in state.probes.iter_mut() {
            if let ProbeStatus::Installed { .. } = probe.status {
                probe.status = ProbeStatus::Pending;
            }
        }

        if state.is_probing(run) {
            error!("probing loop exited without outcome");
            state.phase = Phase::TimedOut;
        }
        run.resolve(DetectOutcome::TimedOut);

        state.loops -= 1;
        self.shared.cond.notify_all();
        debug!("probing loop exited");
    }

    fn loaded_modules(&self) -> Vec<(CandidateKind, Option<ModuleHandle>)> {
        self.config
            .candidates
            .iter()
            .map(|&kind| {
                let handle = module::first_loaded(&*self.platform.modules, kind.modules())
                    .map(|(_, handle)| handle);
                (kind, handle)
            })
            .collect()
    }

    fn drain(&self, capture: bool) {
        let own = usize::from(lifecycle::is_rendering());
        if !self.shared.in_flight.drain_to(own, self.config.drain_timeout) {
            warn!("probe hooks still running after removal");
        }

        if capture {
            vulkan::drain_capture(&self.shared.capture, self.config.drain_timeout);
        }
    }

    /// Remove the probes of candidates given up on.
    fn retire(&self, retire: Vec<(CandidateKind, Vec<FnPtr>)>) {
        if retire.is_empty() {
            return;
        }

        let mut capture = false;
        for (kind, _) in &retire {
            for slot in probe::slots(*kind) {
                slot.disarm_owned(&self.shared);
            }

            if *kind == CandidateKind::Vulkan {
                vulkan::disarm_capture(&self.shared.capture);
                capture = true;
            }
        }

        self.hooks.batch(|hooks| {
            for (kind, targets) in &retire {
                for target in targets {
                    if hooks.remove(*target).is_none() {
                        warn!("{kind} probe on {target:?} could not be removed");
                    }
                }
            }
        });

        self.drain(capture);
    }

    /// Remove every probe hook of this detector.
    ///
    /// Slots armed by another detector since are left alone.
    fn remove_probes(&self) {
        vulkan::disarm_capture(&self.shared.capture);
        let removed = dispatch::teardown(
            &probe::SLOTS,
            &self.shared,
            &self.hooks,
            &self.shared.in_flight,
            usize::from(lifecycle::is_rendering()),
            self.config.drain_timeout,
        );
        vulkan::drain_capture(&self.shared.capture, self.config.drain_timeout);

        if !removed {
            warn!("probe hooks could not be removed cleanly");
        }
    }

    /// Attach the backend of a confirmation. Returns `true` if the run is over.
    #[tracing::instrument(skip(self, run))]
    fn adopt(&self, run: &Arc<Run>, (kind, api): (CandidateKind, Api)) -> bool {
        info!("{api} confirmed");
        self.remove_probes();

        let confirmed_module = {
            let mut state = self.shared.state.lock();
            let mut confirmed_module = None;
            for probe in state.probes.iter_mut() {
                if let ProbeStatus::Installed { module, .. } = probe.status {
                    if probe.kind == kind {
                        confirmed_module = Some(module);
                    }
                    probe.status = ProbeStatus::Pending;
                }
            }

            if !state.is_probing(run) {
                return true;
            }

            confirmed_module
        };

        let backend = Arc::new(Backend::new(
            api,
            self.platform.clone(),
            self.overlay.clone(),
            self.config.drain_timeout,
        ));

        match backend.attach() {
            Ok(()) => {
                let mut state = self.shared.state.lock();
                if !state.is_probing(run) {
                    drop(state);
                    debug!("run ended while attaching");
                    backend.detach();
                    return true;
                }

                info!("{} backend attached", backend.name());
                state.phase = Phase::Confirmed;
                state.backend = Some(backend.clone());
                run.resolve(DetectOutcome::Confirmed(backend));
                self.shared.cond.notify_all();
                true
            }

            Err(err) => {
                error!("{api} backend attach failed, probing continues. err: {err}");

                let mut state = self.shared.state.lock();
                if let (Some(probe), Some(module)) = (state.probe_mut(kind), confirmed_module) {
                    probe.status = ProbeStatus::Exhausted(module);
                }

                false
            }
        }
    }
}

impl Drop for RendererDetector {
    fn drop(&mut self) {
        // the probing loop removed its probes on exit
        if !self.hooks.is_empty() {
            self.remove_probes();
        }
    }
}
