//! Single-stage SIESTA routing.
//!
//! Input slots are replaced as-is, `kpoints_*` axes edit the k-point grid,
//! `pao*` flags go to the basis document and anything else is an fdf flag in
//! `parameters`.

use serde_json::json;

use crate::error::ConfigurationError;
use crate::router::{
    Condition, KeyOverride, KeyRouter, KpointMode, ParamDefaults, RouterRule, Transform,
};

pub const INPUT_SLOTS: [&str; 8] = [
    "code",
    "structure",
    "parameters",
    "pseudos",
    "basis",
    "settings",
    "parent_calc_folder",
    "kpoints",
];

pub fn kpoints_rule() -> RouterRule {
    let mut rule = RouterRule::new(
        "k-point grid",
        "kpoints",
        Condition::OverridesOnly,
        Transform::KpointGrid(KpointMode::Density),
    )
    .with_override("kpoints_density", KeyOverride::new());
    for component in 0..3 {
        rule = rule.with_override(
            format!("kpoints_{component}"),
            KeyOverride::new().with_transform(Transform::KpointGrid(KpointMode::Component(
                component,
            ))),
        );
    }
    rule
}

pub fn basis_rule() -> RouterRule {
    RouterRule::new(
        "basis",
        "basis",
        Condition::Prefix("pao".to_string()),
        Transform::SetParameter,
    )
    .with_override("paobasissize", KeyOverride::new())
    .with_override(
        "paoenergyshift",
        KeyOverride::new().with_defaults(ParamDefaults::with_units("Ry")),
    )
}

/// Catch-all for raw fdf flags; keep it last.
pub fn parameters_rule() -> RouterRule {
    RouterRule::new(
        "FDF parameters",
        "parameters",
        Condition::Always,
        Transform::SetParameter,
    )
    .with_override(
        "meshcutoff",
        KeyOverride::new().with_defaults(
            ParamDefaults::with_units("Ry")
                .init_value(json!(100))
                .step(json!(100)),
        ),
    )
}

pub fn siesta_rules() -> Vec<RouterRule> {
    vec![kpoints_rule(), basis_rule(), parameters_rule()]
}

pub fn siesta_router() -> Result<KeyRouter, ConfigurationError> {
    KeyRouter::builder()
        .pass_through(INPUT_SLOTS)
        .rules(siesta_rules())
        .build()
}
