//! Centralized storage for WGSL shader sources.

pub mod compute {
    /// Field update, commit and alignment entry points sharing one bind group layout.
    pub const FIELD: &str = include_str!("kernels/field.wgsl");

    pub const FIELD_UPDATE_ENTRY: &str = "field_update";
    pub const COMMIT_STATE_ENTRY: &str = "commit_state";
    pub const ALIGN_TO_REFERENCE_ENTRY: &str = "align_to_reference";

    /// `@workgroup_size` of every entry point.
    pub const WORKGROUP_SIZE: u32 = 64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn parse(label: &str, source: &str) -> naga::Module {
        naga::front::wgsl::parse_str(source).unwrap_or_else(|err| panic!("{label}: {err:?}"))
    }

    fn validate_wgsl(label: &str, source: &str) -> naga::Module {
        let module = parse(label, source);
        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        validator
            .validate(&module)
            .unwrap_or_else(|err| panic!("{label}: {err:?}"));
        module
    }

    #[test]
    fn field_module_validates() {
        validate_wgsl("field", compute::FIELD);
    }

    #[test]
    fn entry_points_are_compute_with_expected_workgroup_size() {
        let module = validate_wgsl("field", compute::FIELD);
        for name in [
            compute::FIELD_UPDATE_ENTRY,
            compute::COMMIT_STATE_ENTRY,
            compute::ALIGN_TO_REFERENCE_ENTRY,
        ] {
            let entry = module
                .entry_points
                .iter()
                .find(|ep| ep.name == name)
                .unwrap_or_else(|| panic!("missing entry point {name}"));
            assert_eq!(entry.stage, naga::ShaderStage::Compute);
            assert_eq!(entry.workgroup_size, [compute::WORKGROUP_SIZE, 1, 1]);
        }
    }

    #[test]
    fn bindings_cover_group_zero() {
        let module = parse("field", compute::FIELD);
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref())
            .inspect(|binding| assert_eq!(binding.group, 0))
            .map(|binding| binding.binding)
            .collect();
        bindings.sort_unstable();
        assert_eq!(bindings, vec![0, 1, 2, 3]);
    }
}
