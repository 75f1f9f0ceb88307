use serde::{Deserialize, Serialize};
use sweep_core::contract::SweepRequest;
use sweep_core::controller::{FailurePolicy, SweepPlan};
use sweep_core::error::ConfigurationError;
use sweep_core::flavors::eggbox::{
    origin_shift_axis, Cell, DEFAULT_SHIFT_MASK, DEFAULT_SHIFT_STEPS,
};
use sweep_core::flavors::Flavor;
use sweep_core::inputs::JobInputs;

fn default_shift_steps() -> usize {
    DEFAULT_SHIFT_STEPS
}

fn default_shift_mask() -> Vec<f64> {
    DEFAULT_SHIFT_MASK.to_vec()
}

/// Eggbox origin-shift axis, appended after the declared axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginShifts {
    pub cell: Cell,
    /// Real-space mesh found by the zero-origin run.
    pub mesh: [u64; 3],
    #[serde(default = "default_shift_steps")]
    pub steps: usize,
    #[serde(default = "default_shift_mask")]
    pub mask: Vec<f64>,
}

/// Everything needed to rebuild a sweep's plan, stored next to its state so
/// `resume` needs nothing but the run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepManifest {
    #[serde(flatten)]
    pub request: SweepRequest,
    #[serde(default)]
    pub flavor: Flavor,
    #[serde(default)]
    pub base_inputs: JobInputs,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_shifts: Option<OriginShifts>,
}

impl SweepManifest {
    pub fn run_id(&self) -> &str {
        &self.request.run_id
    }

    /// Request with any generated axes added.
    pub fn effective_request(&self) -> Result<SweepRequest, ConfigurationError> {
        let mut request = self.request.clone();
        if let Some(shifts) = &self.origin_shifts {
            let axis = origin_shift_axis(&shifts.cell, shifts.mesh, shifts.steps, &shifts.mask)?;
            if request.iterate_over.contains_key(&axis.name) {
                return Err(ConfigurationError::InvalidInput {
                    field: "origin_shifts".to_string(),
                    reason: format!("axis '{}' is already declared in iterate_over", axis.name),
                });
            }
            request.iterate_over.insert(axis.name, axis.values);
        }
        Ok(request)
    }

    pub fn plan(&self) -> Result<SweepPlan, ConfigurationError> {
        let request = self.effective_request()?;
        let router = self
            .flavor
            .router(request.iterate_over.keys().map(String::as_str))?;
        Ok(SweepPlan::new(request, &router, self.base_inputs.clone())?
            .with_failure_policy(self.failure_policy))
    }
}
