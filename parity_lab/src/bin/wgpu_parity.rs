use std::{env, path::PathBuf};

use anyhow::{bail, Context, Result};
use hyperfield_core::{ComputeDevice, CpuDevice};
use hyperfield_wgpu::WgpuDevice;
use parity_lab::{
    build_case_sets,
    case_io::{export_case_sets_to_json, import_case_sets_from_json, CaseSet},
    cases::Residuals,
    runner::run_cases,
};
use tracer::init_tracing;

struct CliOptions {
    count: usize,
    seed: u64,
    state_tolerance: f32,
    metric_tolerance: f64,
    input_json: Option<PathBuf>,
    export_json: Option<PathBuf>,
    skip_dispatch: bool,
    cpu: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let options = parse_options()?;

    let case_sets = if let Some(ref path) = options.input_json {
        println!("Loading parity case sets from {}", path.display());
        import_case_sets_from_json(path)?
    } else {
        println!(
            "Generating parity cases (random count={}, seed=0x{:X})",
            options.count, options.seed
        );
        build_case_sets(options.count, options.seed)
    };

    if let Some(ref path) = options.export_json {
        export_case_sets_to_json(&case_sets, path)?;
        println!(
            "Exported {} case sets ({}) to {}",
            case_sets.len(),
            case_sets
                .iter()
                .map(|set| set.label.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            path.display()
        );
    }

    if options.skip_dispatch {
        println!("Skip-dispatch flag set; exiting after case preparation.");
        return Ok(());
    }

    if options.cpu {
        run_sets(&mut CpuDevice::new(), &case_sets, &options)
    } else {
        let mut device =
            WgpuDevice::new().context("no compatible GPU adapter found for field parity")?;
        println!("Using adapter '{}'", device.adapter_info().name);
        run_sets(&mut device, &case_sets, &options)
    }
}

fn run_sets<D: ComputeDevice>(
    device: &mut D,
    sets: &[CaseSet],
    options: &CliOptions,
) -> Result<()> {
    let mut failed = Vec::new();
    for set in sets {
        println!(
            "Running field set '{}' on {} ({} cases, {} nodes)",
            set.label,
            device.name(),
            set.cases.len(),
            set.node_count()
        );
        let per_case = run_cases(device, &set.cases)
            .with_context(|| format!("set '{}' failed to run", set.label))?;

        let worst = per_case
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.max_state.total_cmp(&b.max_state));
        let total = per_case
            .iter()
            .fold(Residuals::default(), |acc, residuals| acc.merge(*residuals));

        println!("Set '{}' residuals:", set.label);
        println!("  max |state| error   : {:.3e}", total.max_state);
        println!("  max rel metric error: {:.3e}", total.max_metric);
        println!("  shape mismatches    : {}", total.shape_mismatch);

        if !total.within(options.state_tolerance, options.metric_tolerance) {
            if let Some((idx, residuals)) = worst {
                println!(
                    "  worst case #{idx}: state={:.3e}, metric={:.3e}",
                    residuals.max_state, residuals.max_metric
                );
            }
            failed.push(set.label.clone());
        }
    }

    if !failed.is_empty() {
        bail!(
            "field results diverged beyond tolerance (state {}, metric {}) in: {}",
            options.state_tolerance,
            options.metric_tolerance,
            failed.join(", ")
        );
    }
    Ok(())
}

fn parse_options() -> Result<CliOptions> {
    let mut opts = CliOptions {
        count: 32,
        seed: 0xA11CE,
        state_tolerance: 5e-2,
        metric_tolerance: 5e-2,
        input_json: None,
        export_json: None,
        skip_dispatch: false,
        cpu: false,
    };

    for arg in env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--count=") {
            opts.count = value.parse().context("invalid --count value")?;
        } else if let Some(value) = arg.strip_prefix("--seed=") {
            opts.seed = parse_seed(value).context("invalid --seed value")?;
        } else if let Some(value) = arg.strip_prefix("--state-tolerance=") {
            opts.state_tolerance = value.parse().context("invalid --state-tolerance value")?;
        } else if let Some(value) = arg.strip_prefix("--metric-tolerance=") {
            opts.metric_tolerance = value.parse().context("invalid --metric-tolerance value")?;
        } else if let Some(value) = arg.strip_prefix("--cases-json=") {
            opts.input_json = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--export-json=") {
            opts.export_json = Some(PathBuf::from(value));
        } else if arg == "--skip-dispatch" {
            opts.skip_dispatch = true;
        } else if arg == "--cpu" {
            opts.cpu = true;
        } else {
            bail!("unrecognized argument: {arg}");
        }
    }

    Ok(opts)
}

fn parse_seed(value: &str) -> Result<u64> {
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).context("expected hex literal")
    } else {
        value.parse().context("expected integer seed")
    }
}
