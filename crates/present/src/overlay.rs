//! Render callback supplied by the overlay content renderer.

use crate::frame::FrameContext;

/// Backend render object state reported to the [`Overlay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    /// Render objects are created, frames will be rendered.
    Ready,
    /// Render objects are released until the next ready transition.
    TornDown,
}

/// Per frame render callback.
///
/// Called on the host render thread. Panics are caught at the hook boundary.
pub trait Overlay: Send + Sync {
    /// Draw into the bound render target of the frame.
    fn render(&self, cx: &FrameContext<'_>);

    /// Called once per ready or torn down transition.
    fn transition(&self, state: OverlayState) {
        let _ = state;
    }
}

impl<F: Fn(&FrameContext<'_>) + Send + Sync> Overlay for F {
    fn render(&self, cx: &FrameContext<'_>) {
        self(cx)
    }
}
