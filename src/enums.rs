use std::fmt;

/// Stages a single pipeline run moves through.
///
/// A run starts in `Idle`, checks the cache, and then either takes the
/// `CacheHit` shortcut or walks `Predicting -> Analyzing -> MeshBuilding ->
/// CacheWrite`. Both paths may end in `Delivering` before reaching `Done`.
/// Any error moves the run to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    CacheCheck,
    CacheHit,
    Predicting,
    Analyzing,
    MeshBuilding,
    CacheWrite,
    Delivering,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::CacheCheck => "cache-check",
            PipelineState::CacheHit => "cache-hit",
            PipelineState::Predicting => "predicting",
            PipelineState::Analyzing => "analyzing",
            PipelineState::MeshBuilding => "mesh-building",
            PipelineState::CacheWrite => "cache-write",
            PipelineState::Delivering => "delivering",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Post-processing applied to an extracted surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingMode {
    /// Laplacian smoothing with a fixed number of iterations and step factor.
    Laplacian { iterations: usize, lambda: f32 },
    None,
}

impl Default for SmoothingMode {
    fn default() -> Self {
        SmoothingMode::Laplacian {
            iterations: 2,
            lambda: 0.5,
        }
    }
}
