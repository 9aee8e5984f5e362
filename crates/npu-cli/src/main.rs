//! `npuctl`: command-line interface for the NPU control plane.
//!
//! ```text
//! USAGE:
//!   npuctl inspect <file>              Decode and validate a container
//!   npuctl size <file> [--precise]     Show the memory a container needs
//!   npuctl build <out> [options]       Write a synthetic container
//!   npuctl simulate <file> [options]   Load and run a container on the simulated NPU
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use npu_chip::irq;
use npu_driver::backends::simulated::RunOutcome;
use npu_driver::{DriverConfig, Simulator, SimulatorConfig};
use npu_models::{
    AreaKind, Container, ContainerBuilder, Layer, MemoryArea, Operation, PageTableStrategy,
    ResourceSizer,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npuctl", about = "NPU control plane CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Decode a container and print its header, metadata and area tables.
    Inspect {
        /// Container file.
        file: PathBuf,
    },
    /// Print the resources a container needs.
    Size {
        /// Container file.
        file: PathBuf,
        /// Count page tables per distinct 4 MiB span instead of per area.
        #[arg(long)]
        precise: bool,
    },
    /// Write a synthetic container.
    Build {
        /// Output file.
        out: PathBuf,
        /// Network name.
        #[arg(long, default_value = "synthetic")]
        name: String,
        /// Target hardware id.
        #[arg(long, default_value_t = 0)]
        target: u32,
        /// Request profiling and emit a layer/operation table.
        #[arg(long)]
        profiling: bool,
        /// Code area size in bytes.
        #[arg(long, default_value_t = 4096)]
        code_size: u32,
        /// Pool area size in bytes (0: no pool).
        #[arg(long, default_value_t = 0)]
        pool_size: u32,
        /// Input areas.
        #[arg(long, default_value_t = 1)]
        inputs: u32,
        /// Output areas.
        #[arg(long, default_value_t = 1)]
        outputs: u32,
    },
    /// Load a container on the simulated NPU and run it.
    Simulate {
        /// Container file.
        file: PathBuf,
        /// Number of runs.
        #[arg(long, default_value_t = 1)]
        runs: u32,
        /// What the simulated accelerator does on every run.
        #[arg(long, value_enum, default_value_t = Outcome::Complete)]
        outcome: Outcome,
        /// Run timeout in milliseconds.
        #[arg(long, default_value_t = 20_000)]
        timeout_ms: u64,
        /// Simulated completion latency in milliseconds.
        #[arg(long, default_value_t = 1)]
        latency_ms: u64,
        /// Simulated accelerator id.
        #[arg(long, default_value_t = 0)]
        target: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Complete,
    BusError,
    Mmu,
    Spurious,
    Hang,
}

impl From<Outcome> for RunOutcome {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Complete => Self::Complete,
            Outcome::BusError => Self::BusError,
            Outcome::Mmu => Self::MmuException,
            Outcome::Spurious => Self::Spurious,
            Outcome::Hang => Self::Hang,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { file } => cmd_inspect(&file)?,
        Cmd::Size { file, precise } => cmd_size(&file, precise)?,
        Cmd::Build {
            out,
            name,
            target,
            profiling,
            code_size,
            pool_size,
            inputs,
            outputs,
        } => {
            let shape = Shape {
                name,
                target,
                profiling,
                code_size,
                pool_size,
                inputs,
                outputs,
            };
            cmd_build(&out, &shape)?;
        }
        Cmd::Simulate {
            file,
            runs,
            outcome,
            timeout_ms,
            latency_ms,
            target,
        } => {
            let sim = SimulatorConfig::default()
                .with_latency(Duration::from_millis(latency_ms))
                .with_target_id(target);
            let driver = DriverConfig::default().with_run_timeout(Duration::from_millis(timeout_ms));
            cmd_simulate(&file, runs, outcome, &sim, driver)?;
        }
    }

    Ok(())
}

fn load(file: &Path) -> Result<Container> {
    Container::from_file(file).with_context(|| format!("loading {}", file.display()))
}

fn cmd_inspect(file: &Path) -> Result<()> {
    let c = load(file)?;
    let h = c.header();
    let m = c.metadata();

    println!("File         : {}", file.display());
    println!("Version      : {}", h.version);
    println!("Endianness   : {:?}", h.endianness);
    println!("Security     : {:?} ({} B info)", h.security, h.security_info_len);
    println!("Sections     : metadata {} B, aux {} B, code {} B", h.metadata_len, h.aux_len, h.code_len);
    println!("Name         : {}", m.name());
    println!("Compiler     : {} v{}", m.compiler(), m.compiler_version);
    println!("Target       : {:#x}", m.target_id);
    println!("Exec mode    : {:?}", m.exec_mode);
    println!(
        "Areas        : {} generic, {} in, {} out",
        m.memory_area_count, m.input_count, m.output_count
    );

    println!();
    println!("  {:<12} {:>10} {:>10} {:>8} {:>8}", "type", "base", "size", "align", "page");
    for a in c.all_areas() {
        println!(
            "  {:<12} {:>#10x} {:>10} {:>8} {:>8}",
            a.kind.to_string(),
            a.base,
            a.size,
            a.alignment,
            a.page_size
        );
    }

    if let Some(aux) = c.aux() {
        println!();
        println!(
            "Aux          : {} code relocs, {} data relocs, {} layers, {} ops",
            aux.code_reloc_count,
            aux.data_reloc_count,
            aux.layers.len(),
            aux.operations.len()
        );
        for (i, l) in aux.layers.iter().enumerate() {
            let ops = aux.operations.iter().filter(|o| o.layer_index as usize == i).count();
            println!("  [{i}] uid {:<6} {:<28} {ops} ops", l.uid, l.name());
        }
    }

    Ok(())
}

fn cmd_size(file: &Path, precise: bool) -> Result<()> {
    let c = load(file)?;
    let strategy = if precise {
        PageTableStrategy::Precise
    } else {
        PageTableStrategy::Conservative
    };
    let r = ResourceSizer::new(strategy).size(&c)?;

    println!("Network      : {}{}", c.metadata().name(), if r.secure { " (secure)" } else { "" });
    println!("Strategy     : {strategy:?}");
    println!("Code         : {} B", r.code_size);
    println!("Pool         : {} B", r.pool_size);
    println!("Page tables  : {} ({} B)", r.page_tables, r.page_table_size);
    if r.profiling {
        println!(
            "Trace buffer : {} B ({} layers, {} ops)",
            r.profile_buffer_size, r.layer_count, r.op_count
        );
    }
    Ok(())
}

struct Shape {
    name: String,
    target: u32,
    profiling: bool,
    code_size: u32,
    pool_size: u32,
    inputs: u32,
    outputs: u32,
}

/// Device-virtual layout of synthetic containers, one 4 MiB span per role
const POOL_BASE: u32 = 0x0040_0000;
const IO_BASE: u32 = 0x0080_0000;
const IO_STRIDE: u32 = 0x0001_0000;

fn cmd_build(out: &Path, shape: &Shape) -> Result<()> {
    let code_len = shape.code_size.min(1024);
    let mut b = ContainerBuilder::new(&shape.name)
        .target(shape.target)
        .profiling(shape.profiling)
        .area(MemoryArea::new(AreaKind::Code, 0, shape.code_size))
        .code(vec![0u8; code_len as usize]);

    if shape.pool_size > 0 {
        b = b.area(MemoryArea::new(AreaKind::Pool, POOL_BASE, shape.pool_size));
    }
    for i in 0..shape.inputs {
        b = b.input(MemoryArea::new(AreaKind::Input, IO_BASE + i * IO_STRIDE, 4096));
    }
    for i in 0..shape.outputs {
        let base = IO_BASE + (shape.inputs + i) * IO_STRIDE;
        b = b.output(MemoryArea::new(AreaKind::Output, base, 4096));
    }
    if shape.profiling {
        b = b
            .layer(Layer::new(1, "input"))
            .layer(Layer::new(2, "conv_0"))
            .layer(Layer::new(3, "dense"))
            .operation(Operation { layer_index: 0, offset: 0, size: 64, kind: 5 })
            .operation(Operation { layer_index: 1, offset: 64, size: 256, kind: 1 })
            .operation(Operation { layer_index: 1, offset: 320, size: 256, kind: 1 })
            .operation(Operation { layer_index: 2, offset: 576, size: 128, kind: 4 });
    }

    let data = b.build();
    std::fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} ({} B)", out.display(), data.len());
    Ok(())
}

fn cmd_simulate(
    file: &Path,
    runs: u32,
    outcome: Outcome,
    sim_config: &SimulatorConfig,
    driver: DriverConfig,
) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    let sim = Simulator::new(sim_config);
    sim.tee.set_outcome(outcome.into());
    let device = sim.attach(driver)?;
    let session = device.open_session()?;

    let net = session.create_network(&data)?;
    tracing::info!("Loaded {} on the simulated NPU", file.display());
    let report = session.network_report(net)?;
    for i in 0..report.input_slots {
        let buf = session.allocate_buffer(4096, false)?;
        let att = session.attach(net, buf)?;
        session.set_input(net, att, i)?;
    }
    for i in 0..report.output_slots {
        let buf = session.allocate_buffer(4096, false)?;
        let att = session.attach(net, buf)?;
        session.set_output(net, att, i)?;
    }

    for run in 1..=runs {
        match session.run(net) {
            Ok(r) => println!(
                "run {run}: ok in {:?} (status {:#010x}{})",
                r.latency,
                r.status,
                if r.status & irq::DONE != 0 { ", done" } else { "" }
            ),
            Err(e) => {
                tracing::debug!(run, "run failed: {e:?}");
                println!("run {run}: {e}");
            }
        }
    }

    println!();
    print!("{}", session.network_report(net)?);
    print!("{}", device.report());

    session.close()?;
    Ok(())
}
