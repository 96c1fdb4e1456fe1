//! Per-step diff files: the wire format between topology and orchestration.
//!
//! One file per shell per step (`<dir>/<shell>/<step>.txt`) and one for the
//! merged GSL layer (`<dir>/GS-<n>/<step>.txt`, `n` ground stations). Each
//! node owns one line:
//!
//! ```text
//! SH1O1S1|<deleted>|<updated>|<added>
//! ```
//!
//! where every list is space separated. ISL entries are
//! `index,peer_orbit,peer_slot,delay_ms`; GSL entries add the peer shell:
//! `index,shell,orbit,slot,delay_ms`. Delays carry two decimals. ISL files
//! are orbit-major with a blank line closing each orbit. The leading label is
//! optional when reading.
//!
//! A link is listed only on the line of its first endpoint.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::delta::Delta;
use crate::error::DiffFormatError;
use crate::model::{Link, NodeId, SatId, Shell};
use crate::topology::Timeline;

/// Path of an ISL diff file.
pub fn isl_path(dir: &Path, shell_name: &str, step: usize) -> PathBuf {
    dir.join(shell_name).join(format!("{}.txt", step))
}

/// Directory of the GSL layer.
pub fn gsl_dir(dir: &Path, ground_count: usize) -> PathBuf {
    dir.join(format!("GS-{}", ground_count))
}

/// Path of a GSL diff file.
pub fn gsl_path(dir: &Path, ground_count: usize, step: usize) -> PathBuf {
    gsl_dir(dir, ground_count).join(format!("{}.txt", step))
}

enum Field {
    Deleted,
    Updated,
    Added,
}

fn write_line<F>(out: &mut String, node: NodeId, delta: &Delta, mut entry: F)
where
    F: FnMut(&mut String, &Link),
{
    let _ = write!(out, "{}", node);
    for field in [Field::Deleted, Field::Updated, Field::Added] {
        let links = match field {
            Field::Deleted => &delta.deleted,
            Field::Updated => &delta.updated,
            Field::Added => &delta.added,
        };
        out.push('|');
        for (i, link) in links.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            entry(out, link);
        }
    }
    out.push('\n');
}

/// Renders one shell's ISL delta.
pub fn render_isl(shell_idx: u32, shell: &Shell, delta: &Delta) -> String {
    let mut out = String::new();
    for orbit in 0..shell.orbit_count {
        for slot in 0..shell.sats_per_orbit {
            let node = NodeId::sat(shell_idx, orbit, slot);
            write_line(&mut out, node, &delta.owned_by(node), |out, link| {
                if let Some(peer) = link.b.as_sat() {
                    let _ = write!(
                        out,
                        "{},{},{},{:.2}",
                        link.index, peer.orbit, peer.slot, link.delay_ms
                    );
                }
            });
        }
        out.push('\n');
    }
    out
}

/// Renders the GSL delta.
pub fn render_gsl(ground_count: usize, delta: &Delta) -> String {
    let mut out = String::new();
    for gid in 0..ground_count as u32 {
        let node = NodeId::Ground(gid);
        write_line(&mut out, node, &delta.owned_by(node), |out, link| {
            if let Some(sat) = link.b.as_sat() {
                let _ = write!(
                    out,
                    "{},{},{},{},{:.2}",
                    link.index, sat.shell, sat.orbit, sat.slot, link.delay_ms
                );
            }
        });
    }
    out
}

/// Splits a node line into its deleted/updated/added fields.
fn split_fields(line: &str, lineno: usize) -> Result<[&str; 3], DiffFormatError> {
    let parts: Vec<&str> = line.split('|').collect();
    match parts.as_slice() {
        [_, d, u, a] | [d, u, a] => Ok([*d, *u, *a]),
        _ => Err(DiffFormatError::malformed(
            lineno,
            format!("expected 3 or 4 '|' fields, found {}", parts.len()),
        )),
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, what: &str, lineno: usize) -> Result<T, DiffFormatError> {
    raw.trim()
        .parse()
        .map_err(|_| DiffFormatError::malformed(lineno, format!("bad {} '{}'", what, raw)))
}

fn parse_lines<F>(
    text: &str,
    expected: usize,
    mut node_at: impl FnMut(usize) -> NodeId,
    mut peer: F,
) -> Result<Delta, DiffFormatError>
where
    F: FnMut(&[&str], usize) -> Result<(u32, NodeId, f64), DiffFormatError>,
{
    let mut delta = Delta::default();
    let mut seen = 0usize;
    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        if raw.trim().is_empty() {
            continue;
        }
        if seen >= expected {
            return Err(DiffFormatError::NodeCount {
                expected,
                found: seen + 1,
            });
        }
        let node = node_at(seen);
        seen += 1;

        let fields = split_fields(raw, lineno)?;
        for (k, field) in fields.iter().enumerate() {
            for entry in field.split_whitespace() {
                let parts: Vec<&str> = entry.split(',').collect();
                let (index, other, delay) = peer(&parts, lineno)?;
                let link = Link::new(index, node, other, delay);
                match k {
                    0 => delta.deleted.push(link),
                    1 => delta.updated.push(link),
                    _ => delta.added.push(link),
                }
            }
        }
    }
    if seen != expected {
        return Err(DiffFormatError::NodeCount {
            expected,
            found: seen,
        });
    }
    for list in [&mut delta.added, &mut delta.updated, &mut delta.deleted] {
        list.sort_by_key(|l| l.index);
    }
    Ok(delta)
}

/// Parses one shell's ISL diff file for a grid of `(orbits, slots)`.
pub fn parse_isl(text: &str, shell_idx: u32, grid: (u32, u32)) -> Result<Delta, DiffFormatError> {
    let (orbits, slots) = grid;
    let per_orbit = slots as usize;
    parse_lines(
        text,
        orbits as usize * per_orbit,
        |k| NodeId::sat(shell_idx, (k / per_orbit) as u32, (k % per_orbit) as u32),
        |parts, lineno| {
            let [index, orbit, slot, delay] = parts else {
                return Err(DiffFormatError::malformed(lineno, "ISL entry needs 4 values"));
            };
            let orbit: u32 = parse_num(orbit, "orbit", lineno)?;
            let slot: u32 = parse_num(slot, "slot", lineno)?;
            if orbit >= orbits || slot >= slots {
                return Err(DiffFormatError::malformed(
                    lineno,
                    format!("peer ({}, {}) outside {}x{} shell {}", orbit, slot, orbits, slots, shell_idx + 1),
                ));
            }
            Ok((
                parse_num(index, "index", lineno)?,
                NodeId::sat(shell_idx, orbit, slot),
                parse_num(delay, "delay", lineno)?,
            ))
        },
    )
}

/// Parses the GSL diff file.
pub fn parse_gsl(text: &str, ground_count: usize) -> Result<Delta, DiffFormatError> {
    parse_lines(
        text,
        ground_count,
        |k| NodeId::Ground(k as u32),
        |parts, lineno| {
            let [index, shell, orbit, slot, delay] = parts else {
                return Err(DiffFormatError::malformed(lineno, "GSL entry needs 5 values"));
            };
            let sat = SatId::new(
                parse_num(shell, "shell", lineno)?,
                parse_num(orbit, "orbit", lineno)?,
                parse_num(slot, "slot", lineno)?,
            );
            Ok((
                parse_num(index, "index", lineno)?,
                NodeId::Satellite(sat),
                parse_num(delay, "delay", lineno)?,
            ))
        },
    )
}

/// Writes every diff file of one step under `dir`.
pub fn write_step(dir: &Path, timeline: &Timeline, step: usize) -> std::io::Result<()> {
    for (i, shell) in timeline.shells().iter().enumerate() {
        let delta = timeline.isl_delta(i as u32, step).unwrap_or_default();
        let path = isl_path(dir, &shell.name, step);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, render_isl(i as u32, shell, &delta))?;
    }

    let ground = timeline.ground_stations().len();
    let delta = timeline.gsl_delta(step).unwrap_or_default();
    let path = gsl_path(dir, ground, step);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_gsl(ground, &delta))
}
