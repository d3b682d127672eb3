// src/main.rs
//
// Driver: runs one simulation described by a JSON parameter file on N
// cooperating in-process ranks, or with `--features mpi` on one rank per MPI
// process.
//
// Examples:
//
//   cargo run --release -- params.json
//       -> single rank, outputs under runs/<run_id>/
//
//   RUST_LOG=debug cargo run --release -- params.json ranks=4 out=runs run=lcdm_test
//       -> four ranks, verbose logging, outputs under runs/lcdm_test/
//
//   cargo build --release --features mpi
//   mpirun -n 8 target/release/pm-sim params.json out=runs
//       -> eight MPI processes, run id <params stem>_nc<nc>_<timestamp>
//
// Typical outputs (per run directory):
//   runs/<run_id>/
//     ├── config.json
//     ├── <measure_power_spectrum_filename><seed>_<a>.txt   (+ .svg with plot_power_spectrum)
//     └── <snapshot_filename><seed>_<a>.bin.<rank>

use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info};
#[cfg(feature = "mpi")]
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pm_sim::alloc::estimate_alloc_factor;
use pm_sim::comm::Communicator;
#[cfg(not(feature = "mpi"))]
use pm_sim::comm::LocalWorld;
#[cfg(feature = "mpi")]
use pm_sim::comm::{agree, MpiComm};
use pm_sim::config::{AllocFactor, Parameters, RunConfig, RunInfo};
use pm_sim::cosmology::Cosmology;
use pm_sim::error::{PmError, Result};
use pm_sim::initial::apply_initial_condition;
use pm_sim::particles::{AttrMask, ParticleStore};
use pm_sim::power::TabulatedPower;
use pm_sim::simulation::{PowerOutput, RunSummary, Simulation};
use pm_sim::snapshot::Snapshots;
use pm_sim::snapshot_io::BinarySnapshotWriter;
use pm_sim::stepping::LeapfrogIntegrator;
use pm_sim::vpm::MeshSelector;
use pm_sim::walltime::ClockTable;

fn print_usage() {
    eprintln!(
        r#"Usage:
  pm-sim PARAMS.json [ranks=N] [out=DIR] [run=RUN_ID]

Notes:
  - ranks must not exceed the particle grid size nc times the first pm_nc_factor.
  - Built with the mpi feature, ranks= is ignored; the launcher decides.
  - Log verbosity follows RUST_LOG (default: info).
"#
    );
}

/// Keep `[A-Za-z0-9_.-]`, fold everything else into single underscores and
/// never start with a dot, so the id is always one plain directory name.
fn sanitize_run_id(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let id = out.trim_start_matches(['.', '_']).trim_end_matches('_');
    if id.is_empty() {
        "run".to_string()
    } else {
        id.to_string()
    }
}

/// `<params stem>_nc<nc>_<unix seconds><millis>`
fn default_run_id(params_path: &Path, nc: usize) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let stem = params_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    format!("{}_nc{}_{}{:03}", stem, nc, now.as_secs(), now.subsec_millis())
}

/// First of `<id>`, `<id>_1`, `<id>_2`, ... that does not exist yet.
fn unique_run_dir(out_root: &Path, run_id: &str) -> Result<PathBuf> {
    let candidates = std::iter::once(run_id.to_string())
        .chain((1..1000).map(|k| format!("{}_{}", run_id, k)));
    for name in candidates {
        let dir = out_root.join(name);
        if !dir.exists() {
            return Ok(dir);
        }
    }
    Err(PmError::config(format!(
        "no free run directory for '{}' under {}",
        run_id,
        out_root.display()
    )))
}

struct Args {
    params: PathBuf,
    ranks: usize,
    out_root: PathBuf,
    run_id: Option<String>,
}

fn parse_args() -> Option<Args> {
    let mut params: Option<PathBuf> = None;
    let mut ranks = 1usize;
    let mut out_root = PathBuf::from("runs");
    let mut run_id = None;

    for arg in env::args().skip(1) {
        if arg == "-h" || arg == "--help" || arg == "help" {
            return None;
        }
        if let Some(v) = arg.strip_prefix("ranks=") {
            match v.parse::<usize>() {
                Ok(n) => ranks = n,
                Err(_) => eprintln!("Warning: could not parse ranks value '{v}', using {ranks}"),
            }
            continue;
        }
        if let Some(v) = arg.strip_prefix("out=") {
            out_root = PathBuf::from(v);
            continue;
        }
        if let Some(v) = arg.strip_prefix("run=") {
            run_id = Some(v.to_string());
            continue;
        }
        if params.is_none() && !arg.contains('=') {
            params = Some(PathBuf::from(arg));
            continue;
        }
        eprintln!("Warning: ignoring unknown argument '{arg}'");
    }

    Some(Args {
        params: params?,
        ranks,
        out_root,
        run_id,
    })
}

/// Fixed factors pass through; estimates use sigma^2(R) of the linear power
/// table over one rank's share of the box.
fn resolve_alloc_factor(params: &Parameters, ranks: usize) -> Result<f64> {
    match params.alloc_factor {
        AllocFactor::Fixed(f) => {
            info!("Using alloc factor of {}", f);
            Ok(f)
        }
        AllocFactor::Estimate { failure_rate } => {
            let path = params.linear_power_file.as_ref().ok_or_else(|| {
                PmError::config("alloc_factor estimate needs linear_power_file")
            })?;
            let pk = TabulatedPower::from_file(path)?;
            let volume = params.boxsize.powi(3) / ranks as f64;
            let est = estimate_alloc_factor(volume, ranks, failure_rate, |r| pk.sigma2(r))?;
            Ok(est.factor)
        }
    }
}

fn run_rank<C: Communicator>(
    comm: C,
    params: &Parameters,
    alloc_factor: f64,
    out_dir: &Path,
) -> Result<RunSummary> {
    let mut clock = ClockTable::new();
    let cosmology = Cosmology::new(params.omega_m);
    let steps = params.step_schedule()?;
    let a0 = steps.a_initial();
    let ntotal = params.nc * params.nc * params.nc;

    let mut store = ParticleStore::alloc_evenly(ntotal, AttrMask::all(), alloc_factor, &comm)?;
    clock.measure("/Init/Alloc");

    let meshes = MeshSelector::new(&params.vpm, params.nc, params.boxsize, &comm, a0)?;
    clock.measure("/Init/Plan");

    let shift = 0.5 * params.boxsize / params.nc as f64;
    store.set_lagrangian_lattice(params.nc, params.boxsize, [shift; 3], &comm)?;
    apply_initial_condition(
        &mut store,
        &params.initial,
        params.boxsize,
        &cosmology,
        a0,
        params.random_seed,
    )?;
    if !params.force_mode.uses_pm() {
        // Without PM forces the residual velocity starts at zero.
        let np = store.np;
        store.v[..np].iter_mut().for_each(|v| *v = [0.0; 3]);
    }
    clock.measure("/Init/Drift");

    let writer = params.snapshot_filename.as_ref().map(|prefix| {
        BinarySnapshotWriter::new(
            out_dir.join(prefix).to_string_lossy().into_owned(),
            params.random_seed,
            params.boxsize,
            params.omega_m,
        )
    });
    let snapshots = Snapshots::new(params.snapshot_schedule()?, writer, params.boxsize);

    let mut sim = Simulation::new(
        comm.clone(),
        store,
        meshes,
        steps,
        LeapfrogIntegrator::new(cosmology),
        snapshots,
    )
    .with_force_mode(params.force_mode);
    if let Some(prefix) = &params.measure_power_spectrum_filename {
        sim = sim.with_power_output(PowerOutput {
            prefix: out_dir.join(prefix).to_string_lossy().into_owned(),
            seed: params.random_seed,
            ntotal,
            plot: params.plot_power_spectrum,
        });
    }

    let summary = sim.run()?;

    let mut table = clock.summary(&comm);
    table.extend(sim.clock.summary(&comm));
    if comm.is_root() {
        for row in &table {
            info!(
                "{:<28} min {:10.4} s  mean {:10.4} s  max {:10.4} s",
                row.label, row.min, row.mean, row.max
            );
        }
    }
    Ok(summary)
}

/// Pick the run directory and record what is about to run in it.
fn prepare_run_dir(
    args: &Args,
    params: &Parameters,
    ranks: usize,
    alloc_factor: f64,
) -> Result<PathBuf> {
    let run_id = sanitize_run_id(
        &args
            .run_id
            .clone()
            .unwrap_or_else(|| default_run_id(&args.params, params.nc)),
    );
    let out_dir = unique_run_dir(&args.out_root, &run_id)?;
    let timestamp_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs());
    RunConfig {
        parameters: params.clone(),
        ranks,
        alloc_factor,
        run: RunInfo {
            binary: "pm-sim".to_string(),
            run_id,
            timestamp_unix,
        },
    }
    .write_to_dir(&out_dir)?;
    info!("run directory {}", out_dir.display());
    Ok(out_dir)
}

fn report(summary: &RunSummary) {
    info!(
        "done: {} steps, {} snapshots, final a_x = {:.4}",
        summary.steps, summary.snapshots, summary.final_a_x
    );
}

fn load_parameters(args: &Args) -> Result<Parameters> {
    let params = Parameters::from_file(&args.params)?;
    params.validate()?;
    Ok(params)
}

#[cfg(not(feature = "mpi"))]
fn run(args: Args) -> Result<()> {
    let params = load_parameters(&args)?;
    if args.ranks == 0 {
        return Err(PmError::config("ranks must be at least 1"));
    }
    let alloc_factor = resolve_alloc_factor(&params, args.ranks)?;
    let out_dir = prepare_run_dir(&args, &params, args.ranks, alloc_factor)?;

    let results = LocalWorld::run(args.ranks, |comm| {
        run_rank(comm, &params, alloc_factor, &out_dir)
    })?;
    // Every rank fails together; report the first.
    let mut summaries = Vec::with_capacity(results.len());
    for r in results {
        summaries.push(r?);
    }
    if let Some(s) = summaries.first() {
        report(s);
    }
    Ok(())
}

/// One rank per MPI process; `ranks=` is ignored in favour of the launcher's.
#[cfg(feature = "mpi")]
fn run(args: Args) -> Result<()> {
    let universe = mpi::initialize()
        .ok_or_else(|| PmError::config("MPI could not be initialised"))?;
    let comm = MpiComm::world(&universe);
    if args.ranks != 1 && args.ranks != comm.size() {
        warn!(
            "ranks={} ignored; running on {} MPI processes",
            args.ranks,
            comm.size()
        );
    }

    let params = load_parameters(&args)?;
    let alloc_factor = resolve_alloc_factor(&params, comm.size())?;

    // Root picks the directory; everyone learns it or the failure.
    let prepared = if comm.is_root() {
        prepare_run_dir(&args, &params, comm.size(), alloc_factor).map(Some)
    } else {
        Ok(None)
    };
    let dir = match &prepared {
        Ok(Some(d)) => d.to_string_lossy().into_owned(),
        _ => String::new(),
    };
    agree(&comm, prepared.map(|_| ()), "run directory setup")?;
    let out_dir = PathBuf::from(comm.all_gather(dir).swap_remove(0));

    let summary = run_rank(comm, &params, alloc_factor, &out_dir)?;
    if comm.is_root() {
        report(&summary);
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let Some(args) = parse_args() else {
        print_usage();
        return ExitCode::FAILURE;
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_single_plain_directory_names() {
        assert_eq!(sanitize_run_id("lcdm test/../x"), "lcdm_test_.._x");
        assert_eq!(sanitize_run_id("../../etc"), "etc");
        assert_eq!(sanitize_run_id("a  b??c_"), "a_b_c");
        assert_eq!(sanitize_run_id("///"), "run");
        assert_eq!(sanitize_run_id("box-256.v2"), "box-256.v2");
    }

    #[test]
    fn default_id_names_the_params_file_and_grid() {
        let id = default_run_id(Path::new("configs/lcdm.json"), 64);
        assert!(id.starts_with("lcdm_nc64_"), "{}", id);
        assert!(id["lcdm_nc64_".len()..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn taken_run_dirs_get_a_numeric_suffix() {
        let root = std::env::temp_dir().join(format!("pm_sim_runs_{}", std::process::id()));
        std::fs::create_dir_all(root.join("lcdm")).unwrap();
        std::fs::create_dir_all(root.join("lcdm_1")).unwrap();
        assert_eq!(unique_run_dir(&root, "lcdm").unwrap(), root.join("lcdm_2"));
        assert_eq!(unique_run_dir(&root, "other").unwrap(), root.join("other"));
        std::fs::remove_dir_all(&root).unwrap();
    }
}
