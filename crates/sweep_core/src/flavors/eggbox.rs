//! Eggbox-effect sweeps: rigid shifts of the atomic-coordinates origin
//! across one real-space mesh cell.
//!
//! A first run with the origin at zero determines the mesh; the origin
//! shifts are then swept as a single axis whose values are complete
//! `%block AtomicCoordinatesOrigin` bodies.

use serde_json::Value;

use crate::contract::Axis;
use crate::error::{ConfigurationError, TransformError};
use crate::inputs::{set_parameter, JobInputs};
use crate::keys::FdfKeyNormalizer;

pub const ORIGIN_BLOCK_KEY: &str = "%block AtomicCoordinatesOrigin";
pub const DEFAULT_SHIFT_STEPS: usize = 10;
pub const DEFAULT_SHIFT_MASK: [f64; 3] = [1.0, 1.0, 1.0];

const MASK_TOLERANCE: f64 = 1e-8;

pub type Cell = [[f64; 3]; 3];

/// Each entry enables (1) or disables (0) shifting along one lattice vector.
pub fn validate_shift_mask(mask: &[f64]) -> Result<[f64; 3], ConfigurationError> {
    let [x, y, z] = mask else {
        return Err(ConfigurationError::InvalidInput {
            field: "shift_mask".to_string(),
            reason: "must contain exactly three numbers, one for each dimension".to_string(),
        });
    };
    let mask = [*x, *y, *z];
    if mask
        .iter()
        .any(|entry| (entry - 0.0).abs() > MASK_TOLERANCE && (entry - 1.0).abs() > MASK_TOLERANCE)
    {
        return Err(ConfigurationError::InvalidInput {
            field: "shift_mask".to_string(),
            reason: "must contain only zeroes or ones".to_string(),
        });
    }
    Ok(mask)
}

pub fn validate_shift_steps(steps: usize) -> Result<usize, ConfigurationError> {
    if steps == 0 {
        return Err(ConfigurationError::InvalidInput {
            field: "shift_steps".to_string(),
            reason: "must be a positive number greater than zero".to_string(),
        });
    }
    Ok(steps)
}

/// Origin shifts `1..=steps`, each a fraction `i / (mesh_k * steps)` of
/// the enabled lattice vectors.
pub fn origin_shifts(
    cell: &Cell,
    mesh: [u64; 3],
    steps: usize,
    mask: &[f64],
) -> Result<Vec<String>, ConfigurationError> {
    let steps = validate_shift_steps(steps)?;
    let mask = validate_shift_mask(mask)?;
    if mesh.contains(&0) {
        return Err(ConfigurationError::InvalidInput {
            field: "mesh".to_string(),
            reason: "every mesh dimension must be positive".to_string(),
        });
    }

    let shifts = (1..=steps)
        .map(|step| {
            let mut shift = [0.0f64; 3];
            for (vector, (points, enabled)) in cell.iter().zip(mesh.iter().zip(mask)) {
                let fraction = enabled * step as f64 / (*points as f64 * steps as f64);
                for (component, value) in shift.iter_mut().zip(vector) {
                    *component += fraction * value;
                }
            }
            format!(
                "\n    {:.8} {:.8} {:.8}\n%endblock AtomicCoordinatesOrigin",
                shift[0], shift[1], shift[2]
            )
        })
        .collect();
    Ok(shifts)
}

pub fn origin_shift_axis(
    cell: &Cell,
    mesh: [u64; 3],
    steps: usize,
    mask: &[f64],
) -> Result<Axis, ConfigurationError> {
    let values = origin_shifts(cell, mesh, steps, mask)?
        .into_iter()
        .map(Value::String)
        .collect();
    Ok(Axis::new(ORIGIN_BLOCK_KEY, values))
}

/// Block body for the mesh-determination run.
pub fn zero_origin_block() -> String {
    "\n    0.0 0.0 0.0\n%endblock AtomicCoordinatesOrigin".to_string()
}

/// Inputs of the mesh-determination run: the job's own inputs with the
/// origin pinned at zero.
pub fn with_zero_origin(job: &JobInputs) -> Result<JobInputs, TransformError> {
    let mut inputs = job.clone();
    let mut parameters = inputs.object_at("parameters", ORIGIN_BLOCK_KEY)?;
    set_parameter(
        &mut parameters,
        ORIGIN_BLOCK_KEY,
        Value::String(zero_origin_block()),
        &FdfKeyNormalizer,
    );
    inputs.insert("parameters", Value::Object(parameters));
    Ok(inputs)
}
