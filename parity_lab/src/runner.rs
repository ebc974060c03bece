//! Runs field cases through any [`ComputeDevice`] using the regular evolution controller.

use hyperfield_core::{ComputeDevice, ControllerState, EvolutionController, FieldError, FieldResult};
use tracing::debug;

use crate::cases::{FieldCase, FieldOutcome, Residuals};

/// Runs one case to completion on `device`. The controller is dropped before returning, so
/// the device holds no buffers afterwards.
pub fn run_case<D: ComputeDevice + ?Sized>(
    device: &mut D,
    case: &FieldCase,
) -> FieldResult<FieldOutcome> {
    let mut controller =
        EvolutionController::with_state(&mut *device, case.engine_config(), &case.vectors())?;
    let history = controller.run(case.steps)?;
    if controller.state() != ControllerState::Completed {
        return Err(FieldError::InvalidState {
            state: controller.state(),
            action: "finish parity case",
        });
    }
    let snapshot = controller.export_state()?;
    Ok(FieldOutcome {
        history: history.as_slice().to_vec(),
        nodes: snapshot.nodes,
    })
}

/// Runs every case and returns the per-case residuals against the sequential reference.
pub fn run_cases<D: ComputeDevice + ?Sized>(
    device: &mut D,
    cases: &[FieldCase],
) -> FieldResult<Vec<Residuals>> {
    cases
        .iter()
        .enumerate()
        .map(|(idx, case)| {
            let actual = run_case(device, case)?;
            let residuals = Residuals::between(&case.reference(), &actual);
            debug!(
                case = idx,
                nodes = case.nodes.len(),
                state = residuals.max_state,
                metric = residuals.max_metric,
                "parity case finished"
            );
            Ok(residuals)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::{field_stress_cases, generate_field_cases};
    use hyperfield_core::CpuDevice;

    #[test]
    fn cpu_device_matches_reference_exactly() {
        let mut device = CpuDevice::new();
        let mut cases = generate_field_cases(8, 0x5EED);
        cases.extend(field_stress_cases());

        for residuals in run_cases(&mut device, &cases).unwrap() {
            assert_eq!(residuals, Residuals::default());
        }
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn non_finite_case_is_reported() {
        let mut case = field_stress_cases().remove(0);
        case.nodes[0] = [f32::NAN, 0.0];
        let err = run_case(&mut CpuDevice::new(), &case).unwrap_err();
        assert!(matches!(err, FieldError::NonFinite { step: 0, .. }));
    }
}
