//! Error types for setup, resource creation and per-tick submission.

use thiserror::Error;

/// Top level error returned by the simulation and rendering pipeline.
#[derive(Debug, Error)]
pub enum LifeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create GPU resources: {0}")]
    Resource(#[from] ResourceError),
    #[error("tick submission failed: {0}")]
    Submission(#[from] SubmissionError),
}

/// Invalid grid dimensions or configuration values. Raised before the first tick.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("grid dimensions must be non-zero (got {width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("grid of {cells} cells exceeds the maximum of {max} addressable cells")]
    TooManyCells { cells: u64, max: u64 },
    #[error("grid needs {tiles} tiles along one axis, device allows at most {max}")]
    TooManyTiles { tiles: u32, max: u32 },
    #[error("{what} holds {actual} cells, the grid has {expected}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} is {}x{}, expected {}x{}", actual.0, actual.1, expected.0, expected.1)]
    GridMismatch {
        what: &'static str,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("there is no state buffer {0}, only 0 (A) and 1 (B)")]
    NoSuchBuffer(usize),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure to acquire the device or create buffers, pipelines and bind groups.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("no suitable adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("surface creation failed: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("adapter does not support compute shaders")]
    MissingComputeSupport,
    #[error("surface is not supported by the adapter")]
    UnsupportedSurface,
    #[error("{stage} rejected by the device: {source}")]
    Validation {
        stage: &'static str,
        #[source]
        source: wgpu::Error,
    },
    #[error("buffer read-back failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),
    #[error("buffer read-back was dropped before completion")]
    ReadbackCancelled,
}

/// A tick could not be submitted. The frame driver halts after any of these.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("could not acquire surface texture: {0}")]
    Surface(#[from] wgpu::SurfaceError),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("frame driver halted after an earlier submission failure")]
    Halted,
}
