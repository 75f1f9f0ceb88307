//! Two-stage spin-orbit (SOC) then Nambu (BdG) sweeps.
//!
//! Each job carries two nested stage groups, `soc` and `bdg`, each holding
//! its own `parameters`, `options`, `bandskpoints` and `settings`. Axis names
//! pick a stage by prefix:
//!
//! - `soc-parameters-<flag>` / `bdg-parameters-<flag>` set an fdf flag of that
//!   stage;
//! - `soc-<port>` / `bdg-<port>` replace a whole stage input.
//!
//! The `*-parameters-*` groups must stay ahead of the port groups, which in
//! turn must stay ahead of any generic parameter group.

use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{ConfigurationError, StageError};
use crate::inputs::{get_parameter, set_parameter, JobInputs};
use crate::keys::{FdfKeyNormalizer, KeyNormalizer};
use crate::router::{KeyRouter, RouterRule};

use super::siesta::{basis_rule, kpoints_rule, parameters_rule};

pub const SOC_STAGE: &str = "soc";
pub const BDG_STAGE: &str = "bdg";

/// Inputs shared by both stages. Stage-specific ports live in the groups.
pub const SHARED_INPUT_SLOTS: [&str; 5] = ["code", "structure", "pseudos", "basis", "kpoints"];
pub const STAGE_PORTS: [&str; 4] = ["parameters", "bandskpoints", "options", "settings"];

const NAMBU_CHEMPOT: &str = "Nambu.ChemPot";

fn stage_parameters_router() -> Result<KeyRouter, ConfigurationError> {
    KeyRouter::builder().rule(parameters_rule()).build()
}

fn stage_ports_router() -> Result<KeyRouter, ConfigurationError> {
    KeyRouter::builder().pass_through(STAGE_PORTS).build()
}

pub fn bdg_rules() -> Result<Vec<RouterRule>, ConfigurationError> {
    Ok(vec![
        kpoints_rule(),
        basis_rule(),
        RouterRule::nested(
            "FDF parameters SOC",
            SOC_STAGE,
            "soc-parameters-",
            stage_parameters_router()?,
        ),
        RouterRule::nested(
            "FDF parameters BdG",
            BDG_STAGE,
            "bdg-parameters-",
            stage_parameters_router()?,
        ),
        RouterRule::nested(
            "Nested input ports BdG",
            BDG_STAGE,
            "bdg-",
            stage_ports_router()?,
        ),
        RouterRule::nested(
            "Nested input ports SOC",
            SOC_STAGE,
            "soc-",
            stage_ports_router()?,
        ),
    ])
}

pub fn bdg_router() -> Result<KeyRouter, ConfigurationError> {
    KeyRouter::builder()
        .pass_through(SHARED_INPUT_SLOTS)
        .rules(bdg_rules()?)
        .build()
}

/// Result of the finished SOC stage that the BdG stage builds on.
pub trait FermiEnergySource {
    /// Fermi energy in eV.
    fn fermi_energy(&self) -> Result<f64, StageError>;

    /// Outputs the BdG run restarts from, e.g. ion files or the remote folder.
    fn carried_inputs(&self) -> Map<String, Value> {
        Map::new()
    }
}

/// Rejects a BdG parameter document that sets the chemical potential; it is
/// always taken from the SOC run.
pub fn validate_bdg_parameters(parameters: &Map<String, Value>) -> Result<(), StageError> {
    if get_parameter(parameters, NAMBU_CHEMPOT, &FdfKeyNormalizer).is_some() {
        return Err(StageError::ForbiddenParameter {
            namespace: BDG_STAGE.to_string(),
            key: NAMBU_CHEMPOT.to_string(),
            reason: "the chemical potential is taken from the SOC run".to_string(),
        });
    }
    Ok(())
}

/// Launch-time check of a two-stage job's inputs.
pub fn validate_job_inputs(inputs: &JobInputs) -> Result<(), StageError> {
    for stage in [SOC_STAGE, BDG_STAGE] {
        let group = stage_group(inputs, stage)?;
        for port in ["parameters", "options", "settings"] {
            object_port(&group, stage, port)?;
        }
    }
    let bdg = stage_group(inputs, BDG_STAGE)?;
    validate_bdg_parameters(&object_port(&bdg, BDG_STAGE, "parameters")?)
}

pub fn prepare_soc_inputs(job: &JobInputs) -> Result<JobInputs, StageError> {
    info!("Preparing inputs for SOC run");
    let group = stage_group(job, SOC_STAGE)?;
    let mut parameters = object_port(&group, SOC_STAGE, "parameters")?;
    set_parameter(
        &mut parameters,
        "Spin",
        json!("spin-orbit"),
        &FdfKeyNormalizer,
    );

    let mut inputs = shared_inputs(job);
    inputs.insert("parameters", Value::Object(parameters));
    copy_stage_ports(&group, SOC_STAGE, &mut inputs)?;
    inputs.insert("clean_workdir", json!(false));
    Ok(inputs)
}

pub fn prepare_bdg_inputs(
    job: &JobInputs,
    soc: &dyn FermiEnergySource,
) -> Result<JobInputs, StageError> {
    info!("Collecting Fermi energy from SOC run and preparing BdG inputs");
    let group = stage_group(job, BDG_STAGE)?;
    let mut parameters = object_port(&group, BDG_STAGE, "parameters")?;
    validate_bdg_parameters(&parameters)?;

    let fermi_energy = soc.fermi_energy()?;
    let normalizer = FdfKeyNormalizer;
    set_parameter(&mut parameters, "Spin", json!("Nambu"), &normalizer);
    set_parameter(
        &mut parameters,
        NAMBU_CHEMPOT,
        json!(format!("{fermi_energy:.6} eV")),
        &normalizer,
    );
    // Ef is not updated during the BdG run.
    set_parameter(
        &mut parameters,
        "DM.Normalization.Tolerance",
        json!("1.D-1"),
        &normalizer,
    );

    let mut inputs = shared_inputs(job);
    inputs.insert("parameters", Value::Object(parameters));
    for (port, value) in soc.carried_inputs() {
        inputs.insert(port, value);
    }
    copy_stage_ports(&group, BDG_STAGE, &mut inputs)?;
    Ok(inputs)
}

fn shared_inputs(job: &JobInputs) -> JobInputs {
    let mut shared = job.clone();
    shared.remove(SOC_STAGE);
    shared.remove(BDG_STAGE);
    shared
}

fn stage_group(job: &JobInputs, stage: &str) -> Result<Map<String, Value>, StageError> {
    match job.get(stage) {
        Some(Value::Object(group)) => Ok(group.clone()),
        Some(_) => Err(StageError::NotAnObject {
            namespace: stage.to_string(),
            port: stage.to_string(),
        }),
        None => Err(StageError::MissingStage {
            namespace: stage.to_string(),
        }),
    }
}

fn object_port(
    group: &Map<String, Value>,
    stage: &str,
    port: &str,
) -> Result<Map<String, Value>, StageError> {
    match stage_port(group, port) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(object)) => Ok(object.clone()),
        Some(_) => Err(StageError::NotAnObject {
            namespace: stage.to_string(),
            port: port.to_string(),
        }),
    }
}

fn stage_port<'a>(group: &'a Map<String, Value>, port: &str) -> Option<&'a Value> {
    let canonical = FdfKeyNormalizer.normalize(port);
    group
        .iter()
        .find(|(key, _)| FdfKeyNormalizer.normalize(key) == canonical)
        .map(|(_, value)| value)
}

fn copy_stage_ports(
    group: &Map<String, Value>,
    stage: &str,
    inputs: &mut JobInputs,
) -> Result<(), StageError> {
    let options = stage_port(group, "options").ok_or_else(|| StageError::MissingPort {
        namespace: stage.to_string(),
        port: "options".to_string(),
    })?;
    inputs.insert("options", options.clone());
    for port in ["bandskpoints", "settings"] {
        if let Some(value) = stage_port(group, port) {
            inputs.insert(port, value.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::enumerator::Combination;
    use crate::inputs::build_job_inputs;

    struct FixedFermiEnergy(f64);

    impl FermiEnergySource for FixedFermiEnergy {
        fn fermi_energy(&self) -> Result<f64, StageError> {
            Ok(self.0)
        }

        fn carried_inputs(&self) -> Map<String, Value> {
            let mut carried = Map::new();
            carried.insert("parent_calc_folder".to_string(), json!("remote://soc-run"));
            carried
        }
    }

    fn job() -> JobInputs {
        let mut job = JobInputs::new();
        job.insert("code", json!("siesta@cluster"));
        job.insert(
            SOC_STAGE,
            json!({
                "parameters": {"MeshCutoff": "200 Ry"},
                "options": {"resources": {"num_machines": 1}},
            }),
        );
        job.insert(
            BDG_STAGE,
            json!({
                "parameters": {"nambu-matrix": "on"},
                "options": {"resources": {"num_machines": 2}},
                "settings": {"cmdline": ["-n", "4"]},
            }),
        );
        job
    }

    #[test]
    fn stage_parameter_axes_route_into_their_stage() {
        let router = bdg_router().expect("router should build");

        let soc = router.resolve("soc-parameters-meshcutoff").expect("route");
        assert_eq!(soc.namespace(), SOC_STAGE);
        assert_eq!(soc.nested().map(|inner| inner.namespace()), Some("parameters"));

        let bdg_options = router.resolve("bdg-options").expect("route");
        assert_eq!(bdg_options.namespace(), BDG_STAGE);
        assert_eq!(bdg_options.nested().map(|inner| inner.namespace()), Some("options"));

        let whole = router.resolve("soc-parameters").expect("route");
        assert_eq!(whole.group(), Some("Nested input ports SOC"));

        assert_eq!(router.resolve("pao-energy-shift").expect("route").namespace(), "basis");
        assert!(router.resolve("meshcutoff").is_err());
        assert!(router.resolve("soc-unknown").is_err());
    }

    #[test]
    fn combination_fills_both_stage_groups() {
        let router = bdg_router().expect("router should build");
        let routes = router
            .route_table(["soc-parameters-meshcutoff", "bdg-parameters-meshcutoff", "bdg-settings"])
            .expect("routes");
        let combination = Combination {
            index: 0,
            values: [
                ("soc-parameters-meshcutoff".to_string(), json!(300)),
                ("bdg-parameters-meshcutoff".to_string(), json!(400)),
                ("bdg-settings".to_string(), json!({"cmdline": []})),
            ]
            .into_iter()
            .collect(),
        };

        let inputs = build_job_inputs(&job(), &combination, &routes).expect("inputs");
        assert_eq!(
            inputs.get(SOC_STAGE).and_then(|soc| soc.get("parameters")),
            Some(&json!({"meshcutoff": "300 Ry"}))
        );
        assert_eq!(
            inputs.get(BDG_STAGE).and_then(|bdg| bdg.get("parameters")),
            Some(&json!({"nambu-matrix": "on", "meshcutoff": "400 Ry"}))
        );
        assert_eq!(
            inputs.get(BDG_STAGE).and_then(|bdg| bdg.get("settings")),
            Some(&json!({"cmdline": []}))
        );
        validate_job_inputs(&inputs).expect("inputs should validate");
    }

    #[test]
    fn soc_stage_forces_spin_orbit_and_keeps_workdir() {
        let inputs = prepare_soc_inputs(&job()).expect("soc inputs");

        assert_eq!(
            inputs.get("parameters"),
            Some(&json!({"MeshCutoff": "200 Ry", "spin": "spin-orbit"}))
        );
        assert_eq!(inputs.get("clean_workdir"), Some(&json!(false)));
        assert_eq!(inputs.get("options"), Some(&json!({"resources": {"num_machines": 1}})));
        assert_eq!(inputs.get("code"), Some(&json!("siesta@cluster")));
        assert!(!inputs.contains(SOC_STAGE));
        assert!(!inputs.contains(BDG_STAGE));
    }

    #[test]
    fn bdg_stage_sets_chemical_potential_from_soc_run() {
        let inputs = prepare_bdg_inputs(&job(), &FixedFermiEnergy(-4.25)).expect("bdg inputs");

        assert_eq!(
            inputs.get("parameters"),
            Some(&json!({
                "nambu-matrix": "on",
                "spin": "Nambu",
                "nambuchempot": "-4.250000 eV",
                "dmnormalizationtolerance": "1.D-1",
            }))
        );
        assert_eq!(inputs.get("parent_calc_folder"), Some(&json!("remote://soc-run")));
        assert_eq!(inputs.get("settings"), Some(&json!({"cmdline": ["-n", "4"]})));
    }

    #[test]
    fn user_supplied_chemical_potential_is_rejected() {
        let mut job = job();
        job.insert(
            BDG_STAGE,
            json!({"parameters": {"Nambu.ChemPot": "0.1 eV"}, "options": {}}),
        );

        let error = prepare_bdg_inputs(&job, &FixedFermiEnergy(0.0))
            .expect_err("chemical potential is managed by the workflow");
        assert!(matches!(error, StageError::ForbiddenParameter { .. }));
        assert!(validate_job_inputs(&job).is_err());
    }

    #[test]
    fn missing_stage_options_are_reported() {
        let mut job = job();
        job.insert(SOC_STAGE, json!({"parameters": {}}));

        let error = prepare_soc_inputs(&job).expect_err("options are required");
        assert_eq!(
            error,
            StageError::MissingPort {
                namespace: SOC_STAGE.to_string(),
                port: "options".to_string(),
            }
        );
    }
}
