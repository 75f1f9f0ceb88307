use std::fmt;

/// Canonicalizes axis and document keys before any comparison.
///
/// Implementations must be deterministic and idempotent:
/// `normalize(normalize(x)) == normalize(x)`.
pub trait KeyNormalizer: Send + Sync + fmt::Debug {
    fn normalize(&self, key: &str) -> String;
}

/// FDF-style keys: case-insensitive, with `-`, `_` and `.` ignored.
///
/// `Mesh-Cutoff`, `mesh_cutoff` and `MeshCutoff` all become `meshcutoff`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdfKeyNormalizer;

impl KeyNormalizer for FdfKeyNormalizer {
    fn normalize(&self, key: &str) -> String {
        let canonical: String = key
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | '.'))
            .flat_map(char::to_lowercase)
            .collect();
        canonical.trim().to_string()
    }
}
