//! Relaxation trajectories built from joined calculation tasks
//!
//! Every task document contributes one trajectory: the ionic steps of each of
//! its calculations, in order. Rows that already hold a single step carry
//! their own numbering. Frames are sorted by trajectory, then
//! `relaxation_number`, then `relaxation_step`; the canonical structure is the
//! geometry of the final frame.

use super::normalize::{NormalizeError, Normalizer, Outcome};
use super::optimade::{cross_compatible, matrix3, vec3, Geometry};
use crate::models::{CanonicalRecord, Provenance, RawRecord, TaskRecord};
use matflow_common::fingerprint::json_fingerprint;
use serde_json::{Map, Value};

pub const TRAJECTORY_TRANSFORM_VERSION: &str = "1";

/// One ionic step, ready to serialize
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    trajectory_number: u64,
    relaxation_number: u64,
    relaxation_step: u64,
    value: Map<String, Value>,
}

impl Frame {
    fn key(&self) -> (u64, u64, u64) {
        (self.trajectory_number, self.relaxation_number, self.relaxation_step)
    }
}

/// Geometry of a pymatgen `Structure` dict or of an OPTIMADE-style object
fn geometry_of(structure: &Value) -> Result<Geometry, NormalizeError> {
    if let Some(lattice) = structure.get("lattice_vectors") {
        let species = structure
            .get("species_at_sites")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField("species_at_sites".to_string()))?
            .iter()
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect();
        let positions = structure
            .get("cartesian_site_positions")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::MissingField("cartesian_site_positions".to_string()))?
            .iter()
            .map(|p| vec3(p, "cartesian_site_positions"))
            .collect::<Result<Vec<_>, _>>()?;
        return Geometry::new(matrix3(lattice, "lattice_vectors")?, species, positions);
    }

    let lattice = structure
        .pointer("/lattice/matrix")
        .ok_or_else(|| NormalizeError::MissingField("structure.lattice.matrix".to_string()))?;
    let sites = structure
        .get("sites")
        .and_then(Value::as_array)
        .ok_or_else(|| NormalizeError::MissingField("structure.sites".to_string()))?;

    let mut species = Vec::with_capacity(sites.len());
    let mut positions = Vec::with_capacity(sites.len());
    for site in sites {
        let element = site
            .pointer("/species/0/element")
            .or_else(|| site.get("label"))
            .and_then(Value::as_str)
            .ok_or_else(|| NormalizeError::invalid("structure.sites", "site without species"))?;
        let xyz = site
            .get("xyz")
            .ok_or_else(|| NormalizeError::invalid("structure.sites", "site without xyz"))?;
        species.push(element.to_string());
        positions.push(vec3(xyz, "structure.sites.xyz")?);
    }
    Geometry::new(matrix3(lattice, "structure.lattice.matrix")?, species, positions)
}

fn frame(
    task: &TaskRecord,
    trajectory_number: u64,
    relaxation_number: u64,
    relaxation_step: u64,
    step: &Value,
) -> Result<Frame, NormalizeError> {
    let structure = step
        .get("structure")
        .ok_or_else(|| NormalizeError::MissingField("ionic_step.structure".to_string()))?;
    let mut value = geometry_of(structure)?.to_map();
    value.insert("task_id".into(), task.task_id.clone().into());
    value.insert("trajectory_number".into(), trajectory_number.into());
    value.insert("relaxation_number".into(), relaxation_number.into());
    value.insert("relaxation_step".into(), relaxation_step.into());
    for (from, to) in [
        ("e_fr_energy", "energy"),
        ("energy", "energy"),
        ("forces", "forces"),
        ("stress", "stress_tensor"),
        ("stress_tensor", "stress_tensor"),
    ] {
        if let Some(v) = step.get(from).filter(|v| !v.is_null()) {
            value.entry(to).or_insert_with(|| v.clone());
        }
    }
    Ok(Frame {
        trajectory_number,
        relaxation_number,
        relaxation_step,
        value,
    })
}

/// All frames of one task
fn task_frames(task: &TaskRecord, trajectory_number: u64) -> Result<Vec<Frame>, NormalizeError> {
    let payload = &task.payload;

    // Already flattened: one row per ionic step
    if let (Some(number), Some(step)) = (
        payload.get("relaxation_number").and_then(Value::as_u64),
        payload.get("relaxation_step").and_then(Value::as_u64),
    ) {
        let trajectory = payload
            .get("trajectory_number")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        return Ok(vec![frame(task, trajectory, number, step, payload)?]);
    }

    let Some(calcs) = payload.get("calcs_reversed").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut frames = Vec::new();
    let mut relaxation_step = 0u64;
    for (relaxation_number, calc) in calcs.iter().enumerate() {
        let steps = calc
            .pointer("/output/ionic_steps")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for step in steps {
            frames.push(frame(
                task,
                trajectory_number,
                relaxation_number as u64,
                relaxation_step,
                step,
            )?);
            relaxation_step += 1;
        }
    }
    Ok(frames)
}

pub struct TrajectoryNormalizer {
    source: String,
}

impl TrajectoryNormalizer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
        }
    }
}

impl Normalizer for TrajectoryNormalizer {
    fn source(&self) -> &str {
        &self.source
    }

    fn version(&self) -> &str {
        TRAJECTORY_TRANSFORM_VERSION
    }

    fn normalize(&self, raw: &RawRecord, tasks: &[TaskRecord]) -> Result<Outcome, NormalizeError> {
        if tasks.is_empty() {
            return Ok(Outcome::Skip("no task data".to_string()));
        }

        let mut frames = Vec::new();
        for (number, task) in tasks.iter().enumerate() {
            frames.extend(task_frames(task, number as u64)?);
        }
        if frames.is_empty() {
            return Ok(Outcome::Skip("tasks contain no ionic steps".to_string()));
        }
        frames.sort_by_key(Frame::key);

        let mut structure = frames
            .last()
            .map(|f| f.value.clone())
            .unwrap_or_default();
        for key in ["task_id", "trajectory_number", "relaxation_number", "relaxation_step"] {
            structure.remove(key);
        }
        let fingerprint = json_fingerprint(&structure)
            .map_err(|e| NormalizeError::invalid("structure", e.to_string()))?;
        let compatible = cross_compatible(&structure);
        structure.insert("cross_compatibility".into(), compatible.into());
        structure.insert("id".into(), raw.id.clone().into());
        structure.insert("source".into(), self.source.clone().into());

        Ok(Outcome::Record(CanonicalRecord {
            id: raw.id.clone(),
            structure: Value::Object(structure),
            trajectory: Some(frames.into_iter().map(|f| Value::Object(f.value)).collect()),
            provenance: Provenance {
                source: self.source.clone(),
                source_id: raw.id.clone(),
                transform_version: self.version().to_string(),
            },
            content_hash: Some(fingerprint),
        }))
    }
}
