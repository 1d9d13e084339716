//! fdfd-adjoint: CLI for solving FDFD problems and checking their gradients

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fdfd_adjoint::jacobian::relative_error;
use fdfd_adjoint::{Design, DesignSolver, DiffMode, Objective, OperatorCache, ProblemSpec};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fdfd-adjoint")]
#[command(about = "Solve 2-D FDFD problems and compute adjoint gradients")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Solve for the fields and write them as JSON
    Solve {
        /// Problem description (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output JSON file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Evaluate the objective and its Jacobian
    Gradient {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Differentiation mode (reverse, forward, numerical)
        #[arg(short, long, default_value = "reverse")]
        mode: String,
    },

    /// Compare reverse, forward and numerical Jacobians
    Check {
        #[arg(short, long)]
        input: PathBuf,

        /// Largest accepted relative error against the numerical Jacobian
        #[arg(long, default_value = "1e-4")]
        tolerance: f64,
    },
}

#[derive(Serialize)]
struct GradientReport {
    mode: String,
    value: Vec<f64>,
    /// One row per objective output, in grid order
    jacobian: Vec<Vec<f64>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Solve { input, output } => {
            let spec = load(&input)?;
            let mut cache = OperatorCache::new();
            let grid = spec.grid()?;
            let source = spec.source(&grid)?;
            let fields = match spec.nonlinear_solver(&mut cache)? {
                Some(sim) => {
                    let solution = sim.solve_linearized(&source).context("Nonlinear solve failed")?;
                    info!(iterations = solution.iterations(), "nonlinear solve finished");
                    solution.into_fields()
                }
                None => spec.linear_solver(&mut cache)?.solve(&source).context("Solve failed")?,
            };
            write_json(&fields, output.as_deref())
        }
        Command::Gradient { input, output, mode } => {
            let spec = load(&input)?;
            let mode = parse_mode(&mode, &spec)?;
            let mut cache = OperatorCache::new();
            let report = match spec.nonlinear_solver(&mut cache)? {
                Some(sim) => gradient(sim, &spec, mode)?,
                None => gradient(spec.linear_solver(&mut cache)?, &spec, mode)?,
            };
            write_json(&report, output.as_deref())
        }
        Command::Check { input, tolerance } => {
            let spec = load(&input)?;
            let mut cache = OperatorCache::new();
            match spec.nonlinear_solver(&mut cache)? {
                Some(sim) => check(sim, &spec, tolerance),
                None => check(spec.linear_solver(&mut cache)?, &spec, tolerance),
            }
        }
    }
}

fn load(path: &Path) -> Result<ProblemSpec> {
    ProblemSpec::from_file(path).with_context(|| format!("Failed to read problem file: {:?}", path))
}

fn parse_mode(mode: &str, spec: &ProblemSpec) -> Result<DiffMode> {
    let mode: DiffMode = mode.parse()?;
    Ok(match mode {
        DiffMode::Numerical(_) => DiffMode::Numerical(spec.solver.numerical),
        other => other,
    })
}

fn design<S: DesignSolver>(
    solver: S,
    spec: &ProblemSpec,
) -> Result<(Design<S, Box<dyn Objective>>, Vec<f64>)> {
    let grid = spec.grid()?;
    let eps = spec.permittivity(&grid)?;
    let source = spec.source(&grid)?;
    Ok((Design::new(solver, source, spec.objective.build())?, eps))
}

fn gradient<S: DesignSolver>(
    solver: S,
    spec: &ProblemSpec,
    mode: DiffMode,
) -> Result<GradientReport> {
    let (mut design, eps) = design(solver, spec)?;
    let value = design.evaluate(&eps)?;
    let jac = design
        .jacobian(&eps, mode)
        .with_context(|| format!("{} jacobian failed", mode))?;
    Ok(GradientReport {
        mode: mode.to_string(),
        value,
        jacobian: jac.row_iter().map(|row| row.iter().copied().collect()).collect(),
    })
}

fn check<S: DesignSolver>(solver: S, spec: &ProblemSpec, tolerance: f64) -> Result<()> {
    let (mut design, eps) = design(solver, spec)?;
    let reverse = design.jacobian(&eps, DiffMode::Reverse)?;
    let forward = design.jacobian(&eps, DiffMode::Forward)?;
    let numerical = design.jacobian(&eps, DiffMode::Numerical(spec.solver.numerical))?;

    let reverse_error = relative_error(&reverse, &numerical);
    let forward_error = relative_error(&forward, &numerical);
    eprintln!("reverse vs numerical: {:.3e}", reverse_error);
    eprintln!("forward vs numerical: {:.3e}", forward_error);
    eprintln!("reverse vs forward:   {:.3e}", relative_error(&reverse, &forward));

    if reverse_error > tolerance || forward_error > tolerance {
        bail!(
            "Gradient check failed: relative error {:.3e} exceeds tolerance {:.1e}",
            reverse_error.max(forward_error),
            tolerance
        );
    }
    eprintln!("Gradient check passed");
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write output file: {:?}", path))?;
            eprintln!("Wrote {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}
