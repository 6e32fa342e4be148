use asdf_present_hook::HookError;

use crate::types::Api;

/// Failure while preparing a probe hook for a candidate.
///
/// The candidate is skipped for the current module load, other candidates are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("symbol `{0}` not found")]
    SymbolMissing(&'static str),

    #[error("{interface} has {slots} slots, slot {slot} is out of range")]
    SlotOutOfRange {
        interface: &'static str,
        slots: usize,
        slot: usize,
    },

    #[error("{0} object has no method table")]
    NullVtable(&'static str),

    #[error("offscreen probe device creation failed. {0:#}")]
    Offscreen(anyhow::Error),

    #[error("probing is not supported on this platform")]
    Unsupported,

    #[error(transparent)]
    Hook(#[from] HookError),
}

/// Failure while attaching a confirmed backend.
///
/// No hook of the failed backend is left installed.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("entry point of {api} unavailable. {source}")]
    EntryPoint {
        api: Api,
        #[source]
        source: ProbeError,
    },

    #[error(transparent)]
    Hook(#[from] HookError),
}

impl AttachError {
    pub(crate) fn entry_point(api: Api) -> impl FnOnce(ProbeError) -> Self {
        move |source| AttachError::EntryPoint { api, source }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image size is zero")]
    Empty,

    #[error("expected {expected} bytes of rgba pixels, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("backend is not attached")]
    Detached,
}
