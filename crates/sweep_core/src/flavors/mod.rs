//! Concrete sweep flavors as router configurations.

pub mod bdg;
pub mod eggbox;
pub mod siesta;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, StageError};
use crate::inputs::JobInputs;
use crate::router::KeyRouter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// Every axis names a top-level input slot and replaces it wholesale.
    Plain,
    #[default]
    Siesta,
    /// Two-stage spin-orbit then Nambu run.
    Bdg,
}

impl Flavor {
    pub fn router<'a>(
        self,
        axis_names: impl IntoIterator<Item = &'a str>,
    ) -> Result<KeyRouter, ConfigurationError> {
        match self {
            Self::Plain => KeyRouter::builder().pass_through(axis_names).build(),
            Self::Siesta => siesta::siesta_router(),
            Self::Bdg => bdg::bdg_router(),
        }
    }

    /// Flavor-specific checks on built job inputs, run before launch.
    pub fn validate_inputs(self, inputs: &JobInputs) -> Result<(), StageError> {
        match self {
            Self::Plain | Self::Siesta => Ok(()),
            Self::Bdg => bdg::validate_job_inputs(inputs),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Siesta => "siesta",
            Self::Bdg => "bdg",
        }
    }
}
