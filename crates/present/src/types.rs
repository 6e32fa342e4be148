//! Common types used in many modules.

use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;

/// Fast integer [`DashMap`]
pub type IntDashMap<K, V> = DashMap<K, V, BuildNoHashHasher<K>>;

/// Graphics api a confirmed backend renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    Dx9,
    Dx10,
    Dx11,
    Dx12,
    OpenGl,
    Glx,
    Vulkan,
    Metal,
}

impl Api {
    pub const fn name(self) -> &'static str {
        match self {
            Api::Dx9 => "Direct3D 9",
            Api::Dx10 => "Direct3D 10",
            Api::Dx11 => "Direct3D 11",
            Api::Dx12 => "Direct3D 12",
            Api::OpenGl => "OpenGL",
            Api::Glx => "GLX",
            Api::Vulkan => "Vulkan",
            Api::Metal => "Metal",
        }
    }

    /// Candidate which detects this api.
    pub const fn candidate(self) -> CandidateKind {
        match self {
            Api::Dx9 => CandidateKind::Dx9,
            Api::Dx10 | Api::Dx11 | Api::Dx12 => CandidateKind::Dxgi,
            Api::OpenGl => CandidateKind::Wgl,
            Api::Glx => CandidateKind::Glx,
            Api::Vulkan => CandidateKind::Vulkan,
            Api::Metal => CandidateKind::Metal,
        }
    }
}

impl Display for Api {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Graphics api family probed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Dx9,
    /// Direct3D 10, 11 and 12 share the dxgi swap chain.
    Dxgi,
    Wgl,
    Glx,
    Vulkan,
    Metal,
}

impl CandidateKind {
    pub const ALL: [CandidateKind; 6] = [
        CandidateKind::Dxgi,
        CandidateKind::Dx9,
        CandidateKind::Wgl,
        CandidateKind::Vulkan,
        CandidateKind::Glx,
        CandidateKind::Metal,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            CandidateKind::Dx9 => "dx9",
            CandidateKind::Dxgi => "dxgi",
            CandidateKind::Wgl => "wgl",
            CandidateKind::Glx => "glx",
            CandidateKind::Vulkan => "vulkan",
            CandidateKind::Metal => "metal",
        }
    }

    /// Modules backing this candidate. The first loaded one is probed.
    pub const fn modules(self) -> &'static [&'static str] {
        match self {
            CandidateKind::Dx9 => &["d3d9.dll"],
            CandidateKind::Dxgi => &["dxgi.dll"],
            CandidateKind::Wgl => &["opengl32.dll"],
            CandidateKind::Glx => &["libGL.so.1", "libGLX.so.0"],
            CandidateKind::Vulkan => &["vulkan-1.dll", "libvulkan.so.1", "libvulkan.1.dylib"],
            CandidateKind::Metal => &["/System/Library/Frameworks/Metal.framework/Metal"],
        }
    }
}

impl Display for CandidateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown candidate `{0}`")]
pub struct UnknownCandidate(pub String);

impl FromStr for CandidateKind {
    type Err = UnknownCandidate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        CandidateKind::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownCandidate(name.to_string()))
    }
}
