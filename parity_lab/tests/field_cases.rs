use hyperfield_core::{ComputeDevice, CpuDevice};
use parity_lab::{
    cases::{generate_field_cases, Residuals},
    runner::{run_case, run_cases},
};

#[test]
fn generated_cases_are_deterministic() {
    let cases = generate_field_cases(6, 0xA11CE);
    assert_eq!(cases.len(), 6);
    assert_eq!(cases, generate_field_cases(6, 0xA11CE));
    assert_ne!(cases, generate_field_cases(6, 0xA11CF));
}

#[test]
fn references_are_reproducible() {
    for case in generate_field_cases(4, 42) {
        let first = case.reference();
        let second = case.reference();
        assert_eq!(first, second);
        assert!(first.history.iter().all(|v| v.is_finite() && *v >= 0.0));
    }
}

#[test]
fn boxed_cpu_device_runs_cases_without_drift() {
    let mut device: Box<dyn ComputeDevice> = Box::new(CpuDevice::new());
    let cases = generate_field_cases(4, 7);

    let residuals = run_cases(&mut device, &cases).unwrap();
    let total = residuals
        .into_iter()
        .fold(Residuals::default(), Residuals::merge);
    assert!(total.within(0.0, 0.0));

    let again = run_case(&mut device, &cases[0]).unwrap();
    assert_eq!(again, cases[0].reference());
}
