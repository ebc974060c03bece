//! Command-line driver: loads a configuration, picks a compute backend and runs the evolution.

use std::{
    env, fmt,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context as _, Result};
use hyperfield_core::{ComputeDevice, ControllerState, CpuDevice, EngineConfig, EvolutionController};
use hyperfield_wgpu::WgpuDevice;
use serde::Serialize;
use tracer::init_tracing;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum Backend {
    Cpu,
    Wgpu,
    /// `wgpu` when an adapter is available, otherwise the CPU backend.
    #[default]
    Auto,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Wgpu => write!(f, "wgpu"),
            Backend::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "cpu" => Ok(Backend::Cpu),
            "wgpu" | "gpu" => Ok(Backend::Wgpu),
            "auto" => Ok(Backend::Auto),
            other => bail!("unknown backend `{other}` (expected cpu, wgpu or auto)"),
        }
    }
}

#[derive(Debug, Default)]
struct CliOptions {
    config_path: Option<PathBuf>,
    nodes: Option<u32>,
    iterations: Option<u32>,
    threshold: Option<f64>,
    curvature: Option<f32>,
    align_every: Option<u32>,
    backend: Backend,
    export_state: Option<PathBuf>,
    export_history: Option<PathBuf>,
}

impl CliOptions {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut options = CliOptions::default();
        for arg in args {
            if let Some(value) = arg.strip_prefix("--config=") {
                options.config_path = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--nodes=") {
                options.nodes = Some(
                    value
                        .parse()
                        .context("invalid value for --nodes (expected a positive integer)")?,
                );
            } else if let Some(value) = arg.strip_prefix("--iterations=") {
                options.iterations = Some(
                    value
                        .parse()
                        .context("invalid value for --iterations (expected an integer)")?,
                );
            } else if let Some(value) = arg.strip_prefix("--threshold=") {
                options.threshold = Some(
                    value
                        .parse()
                        .context("invalid value for --threshold (expected a number)")?,
                );
            } else if let Some(value) = arg.strip_prefix("--curvature=") {
                options.curvature = Some(
                    value
                        .parse()
                        .context("invalid value for --curvature (expected a negative number)")?,
                );
            } else if let Some(value) = arg.strip_prefix("--align-every=") {
                options.align_every = Some(
                    value
                        .parse()
                        .context("invalid value for --align-every (expected a positive integer)")?,
                );
            } else if let Some(value) = arg.strip_prefix("--backend=") {
                options.backend = value.parse()?;
            } else if let Some(value) = arg.strip_prefix("--export-state=") {
                options.export_state = Some(PathBuf::from(value));
            } else if let Some(value) = arg.strip_prefix("--export-history=") {
                options.export_history = Some(PathBuf::from(value));
            } else {
                bail!("unrecognised argument `{arg}`");
            }
        }
        Ok(options)
    }

    /// File values first, then flag overrides.
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config_path {
            Some(path) => EngineConfig::from_json_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(nodes) = self.nodes {
            config.nodes = nodes;
        }
        if let Some(iterations) = self.iterations {
            config.max_iterations = iterations;
        }
        if let Some(threshold) = self.threshold {
            config.halt_threshold = threshold;
        }
        if let Some(curvature) = self.curvature {
            config.curvature = curvature;
        }
        if let Some(interval) = self.align_every {
            config.alignment_interval = interval;
        }
        config.validate().context("invalid engine configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    init_tracing();

    let options = CliOptions::parse(env::args().skip(1))?;
    let config = options.engine_config()?;

    match options.backend {
        Backend::Cpu => run(CpuDevice::new(), config, &options),
        Backend::Wgpu => {
            let device = WgpuDevice::new().context("failed to initialise wgpu backend")?;
            run(device, config, &options)
        }
        Backend::Auto => match WgpuDevice::new() {
            Ok(device) => run(device, config, &options),
            Err(err) => {
                warn!(%err, "wgpu backend unavailable, falling back to cpu");
                run(CpuDevice::new(), config, &options)
            }
        },
    }
}

fn run<D: ComputeDevice>(device: D, config: EngineConfig, options: &CliOptions) -> Result<()> {
    let iterations = config.max_iterations;
    let threshold = config.halt_threshold;
    let mut controller =
        EvolutionController::new(device, config).context("failed to set up evolution")?;
    info!(backend = controller.device().name(), requested = %options.backend, "backend selected");

    let history = controller.run(iterations).context("evolution run failed")?;

    match controller.state() {
        ControllerState::HaltedSafety => warn!(
            steps = history.len(),
            last = history.last().unwrap_or(0.0),
            threshold,
            "run stopped by safety halt"
        ),
        state => info!(steps = history.len(), %state, "run finished"),
    }

    if let Some(path) = &options.export_history {
        write_json(path, &history)?;
        info!(path = %path.display(), samples = history.len(), "history exported");
    }
    if let Some(path) = &options.export_state {
        let snapshot = controller.export_state().context("failed to export state")?;
        write_json(path, &snapshot)?;
        info!(path = %path.display(), nodes = snapshot.len(), "state exported");
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("failed to write {}", path.display()))
}
