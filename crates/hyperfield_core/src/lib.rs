//! Core of the hyperfield evolution engine: data model, kernel math, the compute device
//! abstraction with its CPU backend, and the sequential controller that drives a run.
//!
//! GPU backends live in `hyperfield_wgpu`; the WGSL they run lives in `hyperfield_shaders`
//! and mirrors [`kernels`] line for line.

pub mod config;
pub mod controller;
pub mod cpu;
pub mod device;
pub mod error;
pub mod gpu;
pub mod kernels;
pub mod metrics;
pub mod state;

/// Scalar type used on the device and in the kernel math.
pub type Scalar = f32;

/// φ − 1, the golden-ratio conjugate used for scaling throughout the kernels.
#[allow(clippy::excessive_precision)]
pub const GOLDEN_RATIO: Scalar = 0.618_033_988_749_894_9;

pub use config::EngineConfig;
pub use controller::{ControllerState, EvolutionController};
pub use cpu::CpuDevice;
pub use device::{BufferId, BufferUsage, ComputeDevice, KernelBindings, KernelId};
pub use error::{FieldError, FieldResult};
pub use gpu::{KernelParams, MetricWords};
pub use metrics::EvolutionHistory;
pub use state::{StateSnapshot, StateStore};
