//! Error hierarchy shared by the controller, the device backends and the config layer.

use thiserror::Error;

use crate::controller::ControllerState;
use crate::device::KernelId;

/// Root error type for all engine failures. Every variant is terminal for the current run.
#[derive(Error, Debug)]
pub enum FieldError {
    /// Invalid configuration (rejected before any device work happens).
    #[error("config error: {0}")]
    Config(String),

    /// No usable compute adapter/device could be acquired at setup.
    #[error("compute device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Buffer allocation, write or readback failed.
    #[error("buffer error: {0}")]
    Buffer(String),

    /// A kernel dispatch failed on the device.
    #[error("dispatch of {kernel} failed: {reason}")]
    Dispatch { kernel: KernelId, reason: String },

    /// NaN/Inf detected in the updated state.
    #[error("numerical error at step {step}: {count} node(s) produced a non-finite state")]
    NonFinite { step: u32, count: u32 },

    /// Operation not permitted in the controller's current state.
    #[error("cannot {action} while controller is {state}")]
    InvalidState {
        state: ControllerState,
        action: &'static str,
    },
}

pub type FieldResult<T> = Result<T, FieldError>;
