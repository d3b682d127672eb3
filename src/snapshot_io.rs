// src/snapshot_io.rs
//
// Per-rank binary snapshot files.
//
// Layout: an ASCII header of `# key: value` lines closed by
// "# Begin: Data Binary 8", then the f64 check value 1234567.0 and three
// little-endian blocks: ids (u64), positions (3 x f64), velocities (3 x f64).

use std::fs::{create_dir_all, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{PmError, Result};
use crate::particles::{AttrMask, ParticleStore};
use crate::snapshot::SnapshotWriter;

const CHECK_VALUE: f64 = 1234567.0;
const DATA_MARKER: &str = "# Begin: Data Binary 8";

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// `<prefix><seed:05>_<a:.4>.bin.<rank:03>`
pub fn snapshot_path(prefix: &str, seed: u64, aout: f64, rank: usize) -> PathBuf {
    PathBuf::from(format!("{}{:05}_{:.4}.bin.{:03}", prefix, seed, aout, rank))
}

#[derive(Debug, Clone)]
pub struct BinarySnapshotWriter {
    pub prefix: String,
    pub seed: u64,
    pub boxsize: f64,
    pub omega_m: f64,
}

impl BinarySnapshotWriter {
    pub fn new<S: Into<String>>(prefix: S, seed: u64, boxsize: f64, omega_m: f64) -> Self {
        Self {
            prefix: prefix.into(),
            seed,
            boxsize,
            omega_m,
        }
    }
}

impl SnapshotWriter for BinarySnapshotWriter {
    fn write(&mut self, snapshot: &ParticleStore, aout: f64, rank: usize) -> Result<()> {
        let path = snapshot_path(&self.prefix, self.seed, aout, rank);
        write_binary_snapshot(&path, snapshot, aout, self.boxsize, self.omega_m, rank)
    }
}

pub fn write_binary_snapshot(
    path: &Path,
    snapshot: &ParticleStore,
    aout: f64,
    boxsize: f64,
    omega_m: f64,
    rank: usize,
) -> Result<()> {
    let need = AttrMask::ID | AttrMask::POS | AttrMask::VEL;
    if !snapshot.has(need) {
        return Err(PmError::config(
            "snapshot store must carry ids, positions and velocities",
        ));
    }
    ensure_parent_dir(path)?;

    let np = snapshot.np;
    let mut f = BufWriter::new(File::create(path)?);

    writeln!(f, "# pm-sim snapshot")?;
    writeln!(f, "# Begin: Header")?;
    writeln!(f, "# a: {:.17e}", aout)?;
    writeln!(f, "# boxsize: {:.17e}", boxsize)?;
    writeln!(f, "# omega_m: {:.17e}", omega_m)?;
    writeln!(f, "# np: {}", np)?;
    writeln!(f, "# rank: {}", rank)?;
    writeln!(f, "# End: Header")?;
    writeln!(f, "{}", DATA_MARKER)?;

    f.write_all(&CHECK_VALUE.to_le_bytes())?;
    for id in &snapshot.id[..np] {
        f.write_all(&id.to_le_bytes())?;
    }
    for x in &snapshot.x[..np] {
        for c in x {
            f.write_all(&c.to_le_bytes())?;
        }
    }
    for v in &snapshot.v[..np] {
        for c in v {
            f.write_all(&c.to_le_bytes())?;
        }
    }

    writeln!(f)?;
    writeln!(f, "# End: Data Binary 8")?;
    writeln!(f, "# End: File")?;
    f.flush()?;
    Ok(())
}

/// Contents of one rank's snapshot file.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotData {
    pub a: f64,
    pub boxsize: f64,
    pub omega_m: f64,
    pub rank: usize,
    pub id: Vec<u64>,
    pub x: Vec<[f64; 3]>,
    pub v: Vec<[f64; 3]>,
}

fn bad(path: &Path, what: &str) -> PmError {
    PmError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {}", path.display(), what),
    ))
}

pub fn read_binary_snapshot(path: &Path) -> Result<SnapshotData> {
    let mut r = BufReader::new(File::open(path)?);

    let (mut a, mut boxsize, mut omega_m, mut np, mut rank) = (None, None, None, None, None);
    let mut line = String::new();
    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 {
            return Err(bad(path, "missing data block"));
        }
        let l = line.trim_end();
        if l == DATA_MARKER {
            break;
        }
        if let Some((key, value)) = l.trim_start_matches("# ").split_once(": ") {
            let value = value.trim();
            match key {
                "a" => a = value.parse::<f64>().ok(),
                "boxsize" => boxsize = value.parse::<f64>().ok(),
                "omega_m" => omega_m = value.parse::<f64>().ok(),
                "np" => np = value.parse::<usize>().ok(),
                "rank" => rank = value.parse::<usize>().ok(),
                _ => {}
            }
        }
    }
    let np = np.ok_or_else(|| bad(path, "header lacks np"))?;

    let mut word = [0u8; 8];
    let mut next = |r: &mut BufReader<File>| -> Result<[u8; 8]> {
        r.read_exact(&mut word)?;
        Ok(word)
    };

    if f64::from_le_bytes(next(&mut r)?) != CHECK_VALUE {
        return Err(bad(path, "check value mismatch"));
    }
    let mut id = Vec::with_capacity(np);
    for _ in 0..np {
        id.push(u64::from_le_bytes(next(&mut r)?));
    }
    let mut triples = |r: &mut BufReader<File>| -> Result<Vec<[f64; 3]>> {
        let mut out = Vec::with_capacity(np);
        for _ in 0..np {
            let mut t = [0.0; 3];
            for c in t.iter_mut() {
                *c = f64::from_le_bytes(next(r)?);
            }
            out.push(t);
        }
        Ok(out)
    };
    let x = triples(&mut r)?;
    let v = triples(&mut r)?;

    Ok(SnapshotData {
        a: a.ok_or_else(|| bad(path, "header lacks a"))?,
        boxsize: boxsize.ok_or_else(|| bad(path, "header lacks boxsize"))?,
        omega_m: omega_m.ok_or_else(|| bad(path, "header lacks omega_m"))?,
        rank: rank.unwrap_or(0),
        id,
        x,
        v,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::Particle;

    #[test]
    fn path_pattern() {
        let p = snapshot_path("snap/fof_", 100, 0.25, 2);
        assert_eq!(p, PathBuf::from("snap/fof_00100_0.2500.bin.002"));
    }

    #[test]
    fn written_file_reads_back() {
        let dir = std::env::temp_dir().join(format!("pm_sim_snap_{}", std::process::id()));
        let mut store = ParticleStore::new(2, AttrMask::ID | AttrMask::POS | AttrMask::VEL);
        store
            .push(Particle {
                x: [1.0, 2.0, 3.0],
                v: [-0.5, 0.0, 0.5],
                id: 9,
                ..Particle::default()
            })
            .unwrap();
        let mut w = BinarySnapshotWriter::new(
            dir.join("nested/snap_").to_string_lossy().into_owned(),
            7,
            50.0,
            0.3,
        );
        w.write(&store, 0.5, 1).unwrap();

        let data = read_binary_snapshot(&snapshot_path(&w.prefix, 7, 0.5, 1)).unwrap();
        assert_eq!(data.a, 0.5);
        assert_eq!(data.boxsize, 50.0);
        assert_eq!(data.rank, 1);
        assert_eq!(data.id, vec![9]);
        assert_eq!(data.x, vec![[1.0, 2.0, 3.0]]);
        assert_eq!(data.v, vec![[-0.5, 0.0, 0.5]]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_without_velocities_is_rejected() {
        let store = ParticleStore::new(1, AttrMask::ID | AttrMask::POS);
        let path = std::env::temp_dir().join("pm_sim_never_written.bin");
        assert!(write_binary_snapshot(&path, &store, 1.0, 1.0, 0.3, 0).is_err());
    }
}
