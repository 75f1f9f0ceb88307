//! Stage-input preparation for multi-run jobs, for commands that drive the
//! stages themselves and call back into `sweep_runtime prepare`.

use serde::Deserialize;
use serde_json::{Map, Value};
use sweep_core::error::StageError;
use sweep_core::flavors::bdg::{prepare_bdg_inputs, prepare_soc_inputs, FermiEnergySource};
use sweep_core::flavors::eggbox::with_zero_origin;
use sweep_core::inputs::JobInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StageKind {
    /// Spin-orbit run of a two-stage job.
    Soc,
    /// Nambu run, restarted from a finished SOC run.
    Bdg,
    /// Zero-origin run that determines the real-space mesh for eggbox shifts.
    EggboxMesh,
}

/// Outputs of a finished SOC run, as written by the job command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SocRunOutput {
    #[serde(default)]
    pub output_parameters: Map<String, Value>,
    #[serde(default)]
    pub ion_files: Option<Value>,
    #[serde(default)]
    pub remote_folder: Option<Value>,
}

impl FermiEnergySource for SocRunOutput {
    fn fermi_energy(&self) -> Result<f64, StageError> {
        self.output_parameters
            .get("E_Fermi")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                StageError::FermiEnergy("SOC output_parameters has no numeric 'E_Fermi'".to_string())
            })
    }

    fn carried_inputs(&self) -> Map<String, Value> {
        let mut carried = Map::new();
        if let Some(ions) = &self.ion_files {
            carried.insert("ions".to_string(), ions.clone());
        }
        if let Some(folder) = &self.remote_folder {
            carried.insert("parent_calc_folder".to_string(), folder.clone());
        }
        carried
    }
}

pub fn prepare_stage(
    kind: StageKind,
    job: &JobInputs,
    soc_output: Option<&SocRunOutput>,
) -> Result<JobInputs, StageError> {
    match kind {
        StageKind::Soc => prepare_soc_inputs(job),
        StageKind::Bdg => {
            let soc = soc_output.ok_or_else(|| {
                StageError::FermiEnergy("the BdG stage needs the SOC run output".to_string())
            })?;
            prepare_bdg_inputs(job, soc)
        }
        StageKind::EggboxMesh => Ok(with_zero_origin(job)?),
    }
}
