#[allow(unsafe_op_in_unsafe_fn, clippy::all)]
mod gl {
    include!(concat!(env!("OUT_DIR"), "/gl_bindings.rs"));
}

pub mod config;
pub mod error;
pub mod frame;
pub mod module;
pub mod overlay;
pub mod platform;
pub mod renderer;
pub mod types;
pub mod vtable;

mod backend;
mod detect;
mod dispatch;
mod image;
mod objc;
mod session;

pub use asdf_present_hook as hook;

pub use backend::{Backend, Lifecycle};
pub use config::DetectConfig;
pub use detect::state::{DetectOutcome, Phase};
pub use error::{AttachError, ImageError, ProbeError};
pub use frame::{Frame, FrameContext, NativeTarget};
pub use image::{ImageHandle, NativeTexture};
pub use module::{ModuleHandle, ModuleIntrospection};
pub use overlay::{Overlay, OverlayState};
pub use platform::{NoOffscreenDevices, OffscreenDevices, Platform};
pub use renderer::{DriverFactory, Release, RenderDriver};
pub use session::{DetectionSession, PendingDetection};
pub use types::{Api, CandidateKind};
pub use vtable::ComObject;
