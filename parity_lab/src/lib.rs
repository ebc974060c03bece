//! Parity Lab: deterministic field cases, a sequential CPU reference, and a harness that
//! replays the same cases on any compute backend and reports residuals.

pub mod case_io;
pub mod cases;
pub mod runner;

use case_io::CaseSet;
use cases::{field_stress_cases, generate_field_cases};

/// Default case sets: a seeded random set plus the fixed stress set.
pub fn build_case_sets(count: usize, seed: u64) -> Vec<CaseSet> {
    vec![
        CaseSet::new(format!("field_random_0x{seed:X}"), generate_field_cases(count, seed)),
        CaseSet::new("field_stress", field_stress_cases()),
    ]
}
