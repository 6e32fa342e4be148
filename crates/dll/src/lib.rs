//! Injectable dll detecting the graphics api of its host process.
//!
//! Loading the dll starts one detection session on a background thread. The confirmed backend
//! stays attached until the dll is unloaded.

#![cfg(windows)]
#![windows_subsystem = "windows"]

#[cfg(debug_assertions)]
mod dbg;

use core::ffi::c_void;
use std::{sync::Arc, thread};

use asdf_present::{DetectConfig, DetectOutcome, DetectionSession, FrameContext, Platform};
use once_cell::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};
use windows::Win32::{
    Foundation::HINSTANCE,
    System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH},
};

/// Log filter directives, `tracing_subscriber::EnvFilter` syntax.
pub const ENV_LOG: &str = "ASDF_PRESENT_LOG";

static SESSION: OnceCell<DetectionSession> = OnceCell::new();

fn trace_frame(cx: &FrameContext<'_>) {
    trace!("frame {:?}", cx.target());
}

fn session() -> &'static DetectionSession {
    SESSION.get_or_init(|| {
        let config = DetectConfig::from_env();
        debug!("detect config: {:?}", config);

        DetectionSession::new(
            Platform::native(),
            Arc::new(trace_frame),
            config,
        )
    })
}

#[tracing::instrument]
fn detect() {
    match session().detect_default().wait() {
        DetectOutcome::Confirmed(backend) => info!("{} backend attached", backend.name()),
        DetectOutcome::TimedOut => warn!("no graphics api detected"),
        DetectOutcome::Cancelled => debug!("detection cancelled"),
    }
}

#[cfg(debug_assertions)]
fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, filter::LevelFilter};

    use crate::dbg::DebuggerOutput;

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::TRACE.into())
        .with_env_var(ENV_LOG)
        .from_env_lossy();

    _ = tracing_subscriber::fmt::fmt()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_env_filter(filter)
        .with_writer(DebuggerOutput::new("[asdf-present] "))
        .try_init();
}

#[unsafe(no_mangle)]
#[allow(non_snake_case, unused_variables)]
/// # Safety
/// Can be called by loader only. Must not be called manually.
pub unsafe extern "system" fn DllMain(
    dll_module: HINSTANCE,
    fdw_reason: u32,
    reserved: *mut c_void,
) -> bool {
    match fdw_reason {
        DLL_PROCESS_ATTACH => {
            // setup tracing first
            #[cfg(debug_assertions)]
            setup_tracing();

            let spawned = thread::Builder::new()
                .name("asdf-present".into())
                .spawn(detect);
            if let Err(err) = spawned {
                error!("cannot spawn detection thread. err: {err}");
                return false;
            }
        }

        // FreeLibrary, not process exit
        DLL_PROCESS_DETACH if reserved.is_null() => {
            if let Some(session) = SESSION.get() {
                debug!("unloading");
                session.shutdown();
            }
        }

        _ => {}
    }

    true
}
