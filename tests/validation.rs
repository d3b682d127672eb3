// tests/validation.rs
//
// Integration-style validation tests across modules.
// Run with: cargo test
// Or only these tests: cargo test --test validation

use std::sync::{Arc, Mutex};

use rustfft::num_complex::Complex;

use pm_sim::comm::{Communicator, LocalWorld, SerialComm};
use pm_sim::cosmology::Cosmology;
use pm_sim::error::{PmError, Result};
use pm_sim::extensions::ExtensionPoint;
use pm_sim::force::{compute_force_with, MeshBuffers};
use pm_sim::initial::{apply_initial_condition, InitialCondition, XorShift64};
use pm_sim::mesh::kernels::{apply_force_kernel, bin_power_spectrum};
use pm_sim::mesh::ParticleMesh;
use pm_sim::particles::{AttrMask, Particle, ParticleStore};
use pm_sim::power::PowerSpectrum;
use pm_sim::simulation::{measure_load_imbalance, PowerOutput, Simulation};
use pm_sim::snapshot::{SnapshotSchedule, SnapshotWriter, Snapshots};
use pm_sim::snapshot_io::BinarySnapshotWriter;
use pm_sim::stepping::{ForceMode, Integrator, LeapfrogIntegrator, StepSchedule};
use pm_sim::vpm::{MeshSelector, VpmInit};
use pm_sim::walltime::ClockTable;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn single_level() -> Vec<VpmInit> {
    vec![VpmInit {
        a_start: 0.0,
        pm_nc_factor: 1,
    }]
}

// ---------------------------
// Power spectrum
// ---------------------------

/// Uniform noise in [-1, 1) seeded per global cell, so the field does not
/// depend on how the mesh is split.
fn white_noise_spectrum<C: Communicator>(comm: C, n: usize, box_size: f64) -> PowerSpectrum {
    let mesh = ParticleMesh::new(n, box_size, &comm).unwrap();
    let mut real = vec![0.0; mesh.real_len()];
    let x0 = mesh.x_region().start;
    for (local, v) in real.iter_mut().enumerate() {
        let global = x0 * n * n + local;
        let mut rng = XorShift64::new(0xC0FFEE ^ (global as u64).wrapping_mul(0x2545_F491_4F6C_DD1D));
        rng.next_u64();
        *v = rng.next_f64() * 2.0 - 1.0;
    }
    let mut field = vec![Complex::new(0.0, 0.0); mesh.complex_len()];
    mesh.r2c(&real, &mut field);

    let mut ps = PowerSpectrum::for_mesh(n);
    bin_power_spectrum(&mesh, &field, &mut ps);
    ps.reduce(&comm);
    ps.normalize(mesh.volume(), mesh.norm(), 1.0);
    ps
}

#[test]
fn white_noise_has_a_flat_spectrum() {
    let (n, box_size) = (16, 32.0);
    let ps = white_noise_spectrum(SerialComm, n, box_size);

    // variance 1/3 per cell: P = sigma^2 * cell volume
    let cell = (box_size / n as f64).powi(3);
    let expected = cell / 3.0;

    let mut weighted = 0.0;
    let mut modes = 0.0;
    for b in 1..ps.len() {
        assert!(ps.n[b] > 0.0, "bin {} is empty", b);
        // |delta_k|^2 is exponential; the bin mean has relative spread 1/sqrt(N/2)
        let tol = 5.0 / (ps.n[b] / 2.0).sqrt();
        assert!(
            (ps.p[b] / expected - 1.0).abs() < tol,
            "bin {}: P = {}, expected {} (N = {})",
            b,
            ps.p[b],
            expected,
            ps.n[b]
        );
        weighted += ps.p[b] * ps.n[b];
        modes += ps.n[b];
    }
    let mean = weighted / modes;
    assert!(
        (mean / expected - 1.0).abs() < 0.15,
        "mean P = {}, expected {}",
        mean,
        expected
    );
}

#[test]
fn spectrum_does_not_depend_on_rank_count() {
    let serial = white_noise_spectrum(SerialComm, 8, 10.0);
    let split = LocalWorld::run(4, |comm| white_noise_spectrum(comm, 8, 10.0)).unwrap();
    for ps in &split {
        assert_eq!(ps.n, serial.n);
        for b in 0..serial.len() {
            assert!(approx_eq(ps.p[b], serial.p[b], 1e-12 * serial.p[b].abs().max(1.0)));
            assert!(approx_eq(ps.k[b], serial.k[b], 1e-12));
        }
    }
}

// ---------------------------
// Ghost exchange through the force stage
// ---------------------------

fn scattered_particles() -> Vec<Particle> {
    let mut out = vec![
        // on the slab boundary of a two-way split
        Particle {
            x: [4.0, 2.3, 5.1],
            id: 0,
            ..Particle::default()
        },
        // just below it
        Particle {
            x: [3.99, 2.0, 5.0],
            id: 1,
            ..Particle::default()
        },
        // across the periodic boundary
        Particle {
            x: [0.05, 7.9, 1.0],
            id: 2,
            ..Particle::default()
        },
        Particle {
            x: [7.97, 0.1, 6.5],
            id: 3,
            ..Particle::default()
        },
    ];
    let mut rng = XorShift64::new(7);
    for id in 4..40u64 {
        let mut p = Particle {
            id,
            ..Particle::default()
        };
        for c in p.x.iter_mut() {
            *c = rng.next_f64() * 8.0;
        }
        out.push(p);
    }
    out
}

/// Accelerations by id after one force pass with `kernel` on an 8^3 mesh.
fn force_by_id<C, K>(comm: C, kernel: K) -> Vec<(u64, [f64; 3])>
where
    C: Communicator,
    K: Fn(&ParticleMesh<C>, &[Complex<f64>], &mut [Complex<f64>], usize),
{
    let mesh = ParticleMesh::new(8, 8.0, &comm).unwrap();
    let mut buffers = MeshBuffers::new(&mesh);
    let mut store = ParticleStore::new(128, AttrMask::all());
    if comm.is_root() {
        for p in scattered_particles() {
            store.push(p).unwrap();
        }
    }
    store.decompose(|x| mesh.pos_to_rank(x), &comm).unwrap();

    let mut ps = PowerSpectrum::for_mesh(8);
    let mut clock = ClockTable::new();
    compute_force_with(&mut store, &mesh, &mut buffers, 1.0, &mut ps, &mut clock, kernel)
        .unwrap();
    assert_eq!(store.nghosts(), 0);
    (0..store.np).map(|i| (store.id[i], store.acc[i])).collect()
}

fn merged(parts: Vec<Vec<(u64, [f64; 3])>>) -> Vec<(u64, [f64; 3])> {
    let mut all: Vec<_> = parts.into_iter().flatten().collect();
    all.sort_by_key(|(id, _)| *id);
    all
}

fn assert_same_by_id(a: &[(u64, [f64; 3])], b: &[(u64, [f64; 3])], tol: f64) {
    assert_eq!(a.len(), b.len());
    for ((ia, va), (ib, vb)) in a.iter().zip(b) {
        assert_eq!(ia, ib);
        for d in 0..3 {
            assert!(
                approx_eq(va[d], vb[d], tol),
                "particle {} axis {}: {} vs {}",
                ia,
                d,
                va[d],
                vb[d]
            );
        }
    }
}

#[test]
fn identity_kernel_round_trip_matches_single_rank() {
    fn identity<C: Communicator>(
        _: &ParticleMesh<C>,
        from: &[Complex<f64>],
        to: &mut [Complex<f64>],
        _: usize,
    ) {
        to.copy_from_slice(from);
    }

    let serial = merged(vec![force_by_id(SerialComm, identity)]);
    // the identity kernel reads back the CIC density: never zero at a particle
    assert!(serial.iter().all(|(_, a)| a[0] > 0.0 && a[0] == a[1] && a[1] == a[2]));

    for ranks in [2, 3] {
        let split = merged(LocalWorld::run(ranks, |comm| force_by_id(comm, identity)).unwrap());
        assert_same_by_id(&serial, &split, 1e-10);
    }
}

#[test]
fn force_does_not_depend_on_rank_count() {
    let serial = merged(vec![force_by_id(SerialComm, apply_force_kernel)]);
    let split = merged(LocalWorld::run(2, |comm| force_by_id(comm, apply_force_kernel)).unwrap());
    assert_same_by_id(&serial, &split, 1e-10);
    // total momentum change of a periodic system vanishes
    for d in 0..3 {
        let sum: f64 = serial.iter().map(|(_, a)| a[d]).sum();
        assert!(sum.abs() < 1e-8, "axis {} net force {}", d, sum);
    }
}

// ---------------------------
// Load imbalance
// ---------------------------

#[test]
fn uniform_lattice_is_perfectly_balanced() {
    let out = LocalWorld::run(4, |comm| {
        let nc = 4;
        let mesh = ParticleMesh::new(nc, 4.0, &comm).unwrap();
        let mut store =
            ParticleStore::alloc_evenly(nc * nc * nc, AttrMask::POS | AttrMask::ID, 1.5, &comm)
                .unwrap();
        store
            .set_lagrangian_lattice(nc, 4.0, [0.5; 3], &comm)
            .unwrap();
        store.decompose(|x| mesh.pos_to_rank(x), &comm).unwrap();
        measure_load_imbalance(store.np, &comm)
    })
    .unwrap();
    for imb in out {
        assert!(approx_eq(imb.min, 1.0, 1e-12));
        assert!(approx_eq(imb.max, 1.0, 1e-12));
    }
}

// ---------------------------
// Stepping loop
// ---------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Call {
    Kick(f64, f64),
    Drift(f64, f64),
}

#[derive(Default)]
struct RecordingIntegrator {
    calls: Vec<Call>,
}

impl Integrator for RecordingIntegrator {
    fn kick(&mut self, _: &mut ParticleStore, a_v: f64, a_v1: f64, _: f64, _: ForceMode) {
        self.calls.push(Call::Kick(a_v, a_v1));
    }

    fn drift(&mut self, _: &mut ParticleStore, a_x: f64, a_x1: f64, _: f64, _: ForceMode) {
        self.calls.push(Call::Drift(a_x, a_x1));
    }

    fn interpolate(
        &self,
        from: &ParticleStore,
        to: &mut ParticleStore,
        _: f64,
        _: f64,
        _: f64,
        _: ForceMode,
    ) -> Result<()> {
        to.clear();
        for i in 0..from.np {
            to.push(from.get(i))?;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingWriter {
    epochs: Arc<Mutex<Vec<(f64, usize)>>>,
}

impl SnapshotWriter for RecordingWriter {
    fn write(&mut self, snapshot: &ParticleStore, aout: f64, _rank: usize) -> Result<()> {
        self.epochs.lock().unwrap().push((aout, snapshot.np));
        Ok(())
    }
}

fn small_lattice() -> ParticleStore {
    let mut store = ParticleStore::new(16, AttrMask::all());
    store
        .set_lagrangian_lattice(2, 1.0, [0.25; 3], &SerialComm)
        .unwrap();
    store
}

fn simulation<I: Integrator>(
    times: Vec<f64>,
    aout: Vec<f64>,
    integrator: I,
) -> (Simulation<SerialComm, I, RecordingWriter>, RecordingWriter) {
    let steps = StepSchedule::new(times).unwrap();
    let meshes =
        MeshSelector::new(&single_level(), 2, 1.0, &SerialComm, steps.a_initial()).unwrap();
    let writer = RecordingWriter::default();
    let snapshots = Snapshots::new(SnapshotSchedule::new(aout).unwrap(), writer.clone(), 1.0);
    let sim = Simulation::new(SerialComm, small_lattice(), meshes, steps, integrator, snapshots)
        .with_force_mode(ForceMode::Off);
    (sim, writer)
}

#[test]
fn step_at_a_equal_one_ends_without_kick_or_drift() {
    let (mut sim, _) = simulation(vec![0.5, 1.0], vec![], RecordingIntegrator::default());
    let summary = sim.run().unwrap();

    let a_v1 = (0.5f64 * 1.0).sqrt();
    assert_eq!(
        sim.integrator.calls,
        vec![Call::Kick(0.5, a_v1), Call::Drift(0.5, 1.0)]
    );
    assert_eq!(summary.steps, 2);
    assert_eq!(summary.final_a_x, 1.0);
}

#[test]
fn schedule_ending_before_one_runs_every_step() {
    let (mut sim, _) = simulation(vec![0.2, 0.4, 0.8], vec![], RecordingIntegrator::default());
    let summary = sim.run().unwrap();
    // the last window has a_x1 = a_x, so its drift is empty but still dispatched
    assert_eq!(sim.integrator.calls.len(), 6);
    assert_eq!(summary.steps, 3);
    assert_eq!(summary.imbalance.len(), 3);
}

#[test]
fn epochs_are_caught_at_drift_boundaries_and_inside_kicks() {
    let integrator = LeapfrogIntegrator::new(Cosmology::new(0.3));
    let (mut sim, writer) = simulation(vec![0.4, 0.6, 1.0], vec![0.5, 0.8, 1.0], integrator);
    let summary = sim.run().unwrap();
    let epochs = writer.epochs.lock().unwrap().clone();
    assert_eq!(
        epochs.iter().map(|e| e.0).collect::<Vec<_>>(),
        vec![0.5, 0.8, 1.0]
    );
    assert!(epochs.iter().all(|e| e.1 == 8));
    assert_eq!(summary.snapshots, 3);
    assert!(sim.snapshots.schedule.is_done());

    // 0.45 lies inside the first kick window (0.4 .. sqrt(0.24))
    let integrator = LeapfrogIntegrator::new(Cosmology::new(0.3));
    let (mut sim, writer) = simulation(vec![0.4, 0.6], vec![0.45], integrator);
    sim.step(0).unwrap();
    assert_eq!(writer.epochs.lock().unwrap().as_slice(), &[(0.45, 8)]);
    sim.step(1).unwrap();
    assert_eq!(writer.epochs.lock().unwrap().len(), 1);
}

#[test]
fn epoch_at_the_start_is_written_before_stepping() {
    let (mut sim, writer) = simulation(vec![0.5, 1.0], vec![0.5], RecordingIntegrator::default());
    sim.run().unwrap();
    assert_eq!(writer.epochs.lock().unwrap().as_slice(), &[(0.5, 8)]);
}

#[test]
fn epoch_before_the_first_step_is_refused_up_front() {
    // 0.05 can never be crossed; accepting it would hold back 0.5 as well
    let (mut sim, writer) = simulation(
        vec![0.1, 0.35, 0.6, 1.0],
        vec![0.05, 0.5],
        RecordingIntegrator::default(),
    );
    assert!(matches!(sim.run(), Err(PmError::Config(_))));
    assert!(sim.integrator.calls.is_empty());
    assert!(writer.epochs.lock().unwrap().is_empty());

    let (mut sim, writer) = simulation(
        vec![0.1, 0.35, 0.6, 1.0],
        vec![0.1, 0.5],
        RecordingIntegrator::default(),
    );
    sim.run().unwrap();
    let epochs: Vec<f64> = writer.epochs.lock().unwrap().iter().map(|e| e.0).collect();
    assert_eq!(epochs, vec![0.1, 0.5]);
}

#[test]
fn extension_failing_on_one_rank_stops_every_rank() {
    let out = LocalWorld::run(2, |comm| {
        let steps = StepSchedule::new(vec![0.5, 0.75, 1.0]).unwrap();
        let meshes =
            MeshSelector::new(&single_level(), 4, 1.0, &comm, steps.a_initial()).unwrap();
        let mut store = ParticleStore::alloc_evenly(64, AttrMask::all(), 2.0, &comm).unwrap();
        store
            .set_lagrangian_lattice(4, 1.0, [0.125; 3], &comm)
            .unwrap();
        let snapshots = Snapshots::new(
            SnapshotSchedule::new(vec![]).unwrap(),
            RecordingWriter::default(),
            1.0,
        );
        let mut sim = Simulation::new(
            comm.clone(),
            store,
            meshes,
            steps,
            RecordingIntegrator::default(),
            snapshots,
        );
        let rank = comm.rank();
        sim.extensions_mut()
            .register_fn(ExtensionPoint::AfterKick, move |ctx| {
                if rank == 1 && ctx.step == 1 {
                    Err(PmError::config("diverged"))
                } else {
                    Ok(())
                }
            });
        let failed = sim.run().is_err();
        (failed, sim.integrator.calls.len())
    })
    .unwrap();
    // kick + drift of step 0, then the kick of step 1; no rank drifts again
    assert_eq!(out, vec![(true, 3), (true, 3)]);
}

// ---------------------------
// End to end
// ---------------------------

/// Fitted amplitude of a displacement along x of the form A sin(2 pi q_x / L).
fn plane_wave_amplitude(parts: &[(u64, [f64; 3])], nc: usize, box_size: f64) -> f64 {
    let spacing = box_size / nc as f64;
    let (mut num, mut den) = (0.0, 0.0);
    for (id, x) in parts {
        let ix = (*id as usize) / (nc * nc);
        let qx = ix as f64 * spacing + 0.5 * spacing;
        let mut d = x[0] - qx;
        d -= box_size * (d / box_size).round();
        let s = (2.0 * std::f64::consts::PI * qx / box_size).sin();
        num += d * s;
        den += s * s;
    }
    num / den
}

fn plane_wave_run<C: Communicator>(comm: C, power: Option<PowerOutput>) -> Vec<(u64, [f64; 3])> {
    let (nc, box_size) = (8, 8.0);
    let cosmology = Cosmology::new(1.0);
    let steps = StepSchedule::new(vec![0.2, 0.4, 0.6, 0.8, 1.0]).unwrap();
    let mut store =
        ParticleStore::alloc_evenly(nc * nc * nc, AttrMask::all(), 2.0, &comm).unwrap();
    store
        .set_lagrangian_lattice(nc, box_size, [0.5 * box_size / nc as f64; 3], &comm)
        .unwrap();
    let ic = InitialCondition::PlaneWave {
        amplitude: 0.1,
        mode: 1,
    };
    apply_initial_condition(&mut store, &ic, box_size, &cosmology, 0.2, 0).unwrap();

    let meshes = MeshSelector::new(&single_level(), nc, box_size, &comm, 0.2).unwrap();
    let snapshots = Snapshots::new(
        SnapshotSchedule::new(vec![]).unwrap(),
        None::<BinarySnapshotWriter>,
        box_size,
    );
    let mut sim = Simulation::new(
        comm.clone(),
        store,
        meshes,
        steps,
        LeapfrogIntegrator::new(cosmology),
        snapshots,
    );
    if let Some(out) = power {
        sim = sim.with_power_output(out);
    }
    let summary = sim.run().unwrap();
    assert_eq!(summary.steps, 5);
    assert_eq!(summary.final_a_x, 1.0);
    assert!(sim.last_power_spectrum().is_some());

    (0..sim.store.np)
        .map(|i| (sim.store.id[i], sim.store.x[i]))
        .collect()
}

#[test]
fn plane_wave_grows_and_is_independent_of_rank_count() {
    let dir = std::env::temp_dir().join(format!("pm_sim_validation_{}", std::process::id()));
    let prefix = dir.join("powerspec_").to_string_lossy().into_owned();

    let serial = plane_wave_run(
        SerialComm,
        Some(PowerOutput {
            prefix: prefix.clone(),
            seed: 3,
            ntotal: 512,
            plot: false,
        }),
    );
    let mut serial_sorted = serial.clone();
    serial_sorted.sort_by_key(|(id, _)| *id);
    assert_eq!(serial_sorted.len(), 512);

    // linear growth is D = a in this cosmology: x5 from a = 0.2, less mesh smoothing
    let amp = plane_wave_amplitude(&serial_sorted, 8, 8.0);
    assert!(amp > 0.25 && amp < 0.7, "final amplitude {}", amp);

    let split = merged(LocalWorld::run(2, |comm| plane_wave_run(comm, None)).unwrap());
    assert_same_by_id(&serial_sorted, &split, 1e-8);

    let text = std::fs::read_to_string(dir.join("powerspec_00003_0.2000.txt")).unwrap();
    assert!(text.starts_with("# k p N "));
    assert!(text.contains("# metadata 7"));
    assert!(text.contains("# shotnoise 1 float64"));
    let _ = std::fs::remove_dir_all(&dir);
}
