//! OPTIMADE attributes to canonical structures
//!
//! Geometry fields are required and validated; descriptive and property
//! fields are copied when present. Source-prefixed property names (for
//! example `_alexandria_energy`) are mapped through an alias table.

use super::normalize::{NormalizeError, Normalizer, Outcome};
use crate::models::{CanonicalRecord, Provenance, RawRecord, TaskRecord};
use matflow_common::fingerprint::json_fingerprint;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

pub const STRUCTURE_TRANSFORM_VERSION: &str = "1";

/// Copied verbatim when the source provides them
const PASSTHROUGH_FIELDS: &[&str] = &[
    "immutable_id",
    "chemical_formula_reduced",
    "chemical_formula_anonymous",
    "chemical_formula_descriptive",
    "species",
    "nperiodic_dimensions",
    "dimension_types",
    "last_modified",
    "energy",
    "forces",
    "stress_tensor",
    "magnetic_moments",
    "total_magnetization",
    "dos_ef",
];

const ALEXANDRIA_ALIASES: &[(&str, &str)] = &[
    ("_alexandria_forces", "forces"),
    ("_alexandria_stress_tensor", "stress_tensor"),
    ("_alexandria_dos_ef", "dos_ef"),
    ("_alexandria_energy", "energy"),
    ("_alexandria_magnetic_moments", "magnetic_moments"),
    ("_alexandria_magnetization", "total_magnetization"),
];

/// Validated periodic geometry shared by structure and trajectory output
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Geometry {
    pub lattice: [[f64; 3]; 3],
    pub species: Vec<String>,
    pub positions: Vec<[f64; 3]>,
}

impl Geometry {
    pub(crate) fn new(
        lattice: [[f64; 3]; 3],
        species: Vec<String>,
        positions: Vec<[f64; 3]>,
    ) -> Result<Self, NormalizeError> {
        if species.is_empty() {
            return Err(NormalizeError::invalid("species_at_sites", "no sites"));
        }
        if species.len() != positions.len() {
            return Err(NormalizeError::invalid(
                "cartesian_site_positions",
                format!("{} positions for {} sites", positions.len(), species.len()),
            ));
        }
        Ok(Self {
            lattice,
            species,
            positions,
        })
    }

    pub(crate) fn to_map(&self) -> Map<String, Value> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for species in &self.species {
            *counts.entry(species.as_str()).or_default() += 1;
        }
        let nsites = self.species.len();
        let elements: Vec<&str> = counts.keys().copied().collect();
        let ratios: Vec<f64> = counts.values().map(|&n| n as f64 / nsites as f64).collect();

        let mut map = Map::new();
        map.insert("lattice_vectors".into(), serde_json::json!(self.lattice));
        map.insert("cartesian_site_positions".into(), serde_json::json!(self.positions));
        map.insert("species_at_sites".into(), serde_json::json!(self.species));
        map.insert("nsites".into(), nsites.into());
        map.insert("nelements".into(), elements.len().into());
        map.insert("elements".into(), serde_json::json!(elements));
        map.insert("elements_ratios".into(), serde_json::json!(ratios));
        map
    }
}

pub(crate) fn vec3(value: &Value, field: &str) -> Result<[f64; 3], NormalizeError> {
    let items = value
        .as_array()
        .filter(|a| a.len() == 3)
        .ok_or_else(|| NormalizeError::invalid(field, "expected three numbers"))?;
    let mut out = [0.0; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item
            .as_f64()
            .ok_or_else(|| NormalizeError::invalid(field, format!("non-numeric component {item}")))?;
    }
    Ok(out)
}

pub(crate) fn matrix3(value: &Value, field: &str) -> Result<[[f64; 3]; 3], NormalizeError> {
    let rows = value
        .as_array()
        .filter(|a| a.len() == 3)
        .ok_or_else(|| NormalizeError::invalid(field, "expected a 3x3 matrix"))?;
    Ok([
        vec3(&rows[0], field)?,
        vec3(&rows[1], field)?,
        vec3(&rows[2], field)?,
    ])
}

fn required<'a>(attrs: &'a Value, field: &str) -> Result<&'a Value, NormalizeError> {
    attrs
        .get(field)
        .filter(|v| !v.is_null())
        .ok_or_else(|| NormalizeError::MissingField(field.to_string()))
}

fn present<'a>(attrs: &'a Value, field: &str) -> Option<&'a Value> {
    attrs.get(field).filter(|v| !v.is_null())
}

/// Elements whose pseudopotentials differ from the rest of the database
const NON_COMPATIBLE_ELEMENTS: &[&str] = &["V", "Cs"];

/// Whether a structure map may be mixed with other sources' entries
pub(crate) fn cross_compatible(structure: &Map<String, Value>) -> bool {
    structure
        .get("species_at_sites")
        .and_then(Value::as_array)
        .is_none_or(|sites| {
            !sites
                .iter()
                .filter_map(Value::as_str)
                .any(|s| NON_COMPATIBLE_ELEMENTS.contains(&s))
        })
}

fn functional_name(raw: &str) -> Option<&'static str> {
    let lower = raw.to_lowercase();
    // pbesol before pbe: one contains the other
    if lower.contains("pbesol") {
        Some("pbesol")
    } else if lower.contains("pbe") {
        Some("pbe")
    } else if lower.contains("scan") {
        Some("scan")
    } else {
        None
    }
}

pub struct OptimadeNormalizer {
    source: String,
    aliases: HashMap<String, String>,
    functional_field: Option<String>,
}

impl OptimadeNormalizer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            aliases: HashMap::new(),
            functional_field: None,
        }
    }

    /// Alexandria's `_alexandria_*` property names and XC functional field
    pub fn alexandria() -> Self {
        ALEXANDRIA_ALIASES
            .iter()
            .fold(Self::new("alexandria"), |n, (from, to)| n.with_alias(from, to))
            .with_functional_field("_alexandria_xc_functional")
    }

    pub fn with_alias(mut self, from: &str, to: &str) -> Self {
        self.aliases.insert(from.to_string(), to.to_string());
        self
    }

    pub fn with_functional_field(mut self, field: &str) -> Self {
        self.functional_field = Some(field.to_string());
        self
    }

    /// Canonical structure object and the fingerprint of its geometry
    pub(crate) fn structure(&self, id: &str, attrs: &Value) -> Result<(Value, String), NormalizeError> {
        let lattice = matrix3(required(attrs, "lattice_vectors")?, "lattice_vectors")?;
        let species = required(attrs, "species_at_sites")?
            .as_array()
            .ok_or_else(|| NormalizeError::invalid("species_at_sites", "expected a list"))?
            .iter()
            .map(|s| {
                s.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| NormalizeError::invalid("species_at_sites", "expected strings"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let positions = required(attrs, "cartesian_site_positions")?
            .as_array()
            .ok_or_else(|| NormalizeError::invalid("cartesian_site_positions", "expected a list"))?
            .iter()
            .map(|p| vec3(p, "cartesian_site_positions"))
            .collect::<Result<Vec<_>, _>>()?;

        let geometry = Geometry::new(lattice, species, positions)?.to_map();
        let fingerprint = json_fingerprint(&geometry)
            .map_err(|e| NormalizeError::invalid("structure", e.to_string()))?;

        let mut structure = geometry;
        let compatible = cross_compatible(&structure);
        structure.insert("cross_compatibility".into(), compatible.into());
        for field in PASSTHROUGH_FIELDS {
            if let Some(value) = present(attrs, field) {
                structure.insert((*field).to_string(), value.clone());
            }
        }
        for (from, to) in &self.aliases {
            if let Some(value) = present(attrs, from) {
                structure.insert(to.clone(), value.clone());
            }
        }
        if let Some(field) = &self.functional_field {
            if let Some(raw) = present(attrs, field) {
                let text = raw.as_str().unwrap_or_default();
                let functional = functional_name(text)
                    .ok_or_else(|| NormalizeError::invalid(field, format!("unknown functional '{text}'")))?;
                structure.insert("functional".into(), functional.into());
            }
        }
        structure.insert("id".into(), id.into());
        structure.insert("source".into(), self.source.clone().into());

        Ok((Value::Object(structure), fingerprint))
    }
}

/// OPTIMADE responses nest fields under `attributes`; dumps often do not
pub(crate) fn attributes_of(payload: &Value) -> &Value {
    match payload.get("attributes") {
        Some(attrs) if attrs.is_object() => attrs,
        _ => payload,
    }
}

impl Normalizer for OptimadeNormalizer {
    fn source(&self) -> &str {
        &self.source
    }

    fn version(&self) -> &str {
        STRUCTURE_TRANSFORM_VERSION
    }

    fn normalize(&self, raw: &RawRecord, _tasks: &[TaskRecord]) -> Result<Outcome, NormalizeError> {
        let (structure, fingerprint) = self.structure(&raw.id, attributes_of(&raw.payload))?;
        Ok(Outcome::Record(CanonicalRecord {
            id: raw.id.clone(),
            structure,
            trajectory: None,
            provenance: Provenance {
                source: self.source.clone(),
                source_id: raw.id.clone(),
                transform_version: self.version().to_string(),
            },
            content_hash: Some(fingerprint),
        }))
    }
}
