// Model file discovery
// Probes bundled (read-only) resources first, then the writable documents directory

use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use super::models::ModelCandidate;
use crate::config::AssistantConfig;
use crate::error::EngineError;

/// Where a model file was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// Read-only resources shipped with the application
    Bundled,
    /// Writable per-app storage the user can drop a model into
    Documents,
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKind::Bundled => write!(f, "bundled resources"),
            LocationKind::Documents => write!(f, "documents"),
        }
    }
}

/// A directory searched for model candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchLocation {
    pub kind: LocationKind,
    pub dir: PathBuf,
}

/// Absolute path to an existing model file, plus how it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModelPath {
    path: PathBuf,
    kind: LocationKind,
    candidate: ModelCandidate,
}

impl ResolvedModelPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    pub fn candidate(&self) -> &ModelCandidate {
        &self.candidate
    }
}

impl fmt::Display for ResolvedModelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.kind)
    }
}

/// Resolves the first usable model file from a ranked candidate list.
///
/// Locations are searched in order; within a location candidates are tried
/// in order. The first existing file wins even if a later candidate also
/// exists. Resolution is pure filesystem probing and may be repeated freely.
#[derive(Debug, Clone)]
pub struct ModelLocator {
    locations: Vec<SearchLocation>,
    candidates: Vec<ModelCandidate>,
}

impl ModelLocator {
    pub fn new(locations: Vec<SearchLocation>, candidates: Vec<ModelCandidate>) -> Self {
        Self {
            locations,
            candidates,
        }
    }

    /// Bundled directory first, documents directory second
    pub fn from_config(config: &AssistantConfig) -> Self {
        let mut locations = Vec::with_capacity(2);
        if let Some(dir) = &config.bundled_dir {
            locations.push(SearchLocation {
                kind: LocationKind::Bundled,
                dir: dir.clone(),
            });
        }
        if let Some(dir) = &config.documents_dir {
            locations.push(SearchLocation {
                kind: LocationKind::Documents,
                dir: dir.clone(),
            });
        }
        Self::new(locations, config.candidates.clone())
    }

    pub fn locations(&self) -> &[SearchLocation] {
        &self.locations
    }

    /// Every path `resolve` probes, in probe order
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.locations
            .iter()
            .flat_map(|location| {
                self.candidates
                    .iter()
                    .map(move |candidate| location.dir.join(candidate.file_name()))
            })
            .collect()
    }

    /// Find the first existing candidate.
    ///
    /// Returns `EngineError::ModelNotFound` when nothing matches; that is an
    /// expected, recoverable outcome (the user has not installed a model yet).
    pub fn resolve(&self) -> Result<ResolvedModelPath, EngineError> {
        for location in &self.locations {
            for candidate in &self.candidates {
                let path = location.dir.join(candidate.file_name());
                debug!("Checking for model at: {}", path.display());
                if path.is_file() {
                    let path = std::fs::canonicalize(&path).unwrap_or(path);
                    return Ok(ResolvedModelPath {
                        path,
                        kind: location.kind,
                        candidate: candidate.clone(),
                    });
                }
            }
        }

        Err(EngineError::ModelNotFound {
            searched: self.search_paths(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::default_candidates;
    use std::fs;
    use tempfile::TempDir;

    fn locator(bundled: &TempDir, documents: &TempDir) -> ModelLocator {
        ModelLocator::new(
            vec![
                SearchLocation {
                    kind: LocationKind::Bundled,
                    dir: bundled.path().to_path_buf(),
                },
                SearchLocation {
                    kind: LocationKind::Documents,
                    dir: documents.path().to_path_buf(),
                },
            ],
            default_candidates(),
        )
    }

    #[test]
    fn test_not_found_when_empty() {
        let bundled = TempDir::new().unwrap();
        let documents = TempDir::new().unwrap();

        match locator(&bundled, &documents).resolve() {
            Err(EngineError::ModelNotFound { searched }) => assert_eq!(searched.len(), 4),
            other => panic!("expected ModelNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_first_candidate_wins_over_later_one() {
        let bundled = TempDir::new().unwrap();
        let documents = TempDir::new().unwrap();
        fs::write(bundled.path().join("medgemma-4b-instruct.gguf"), b"generic").unwrap();
        fs::write(bundled.path().join("medgemma-4b-instruct.Q4_K_M.gguf"), b"q4").unwrap();

        let resolved = locator(&bundled, &documents).resolve().unwrap();
        assert_eq!(resolved.candidate().base_name, "medgemma-4b-instruct.Q4_K_M");
        assert_eq!(resolved.kind(), LocationKind::Bundled);
    }

    #[test]
    fn test_bundled_location_searched_before_documents() {
        let bundled = TempDir::new().unwrap();
        let documents = TempDir::new().unwrap();
        // Better quantization in documents, generic in bundle: bundle still wins
        fs::write(documents.path().join("medgemma-4b-instruct.Q4_K_M.gguf"), b"q4").unwrap();
        fs::write(bundled.path().join("medgemma-4b-instruct.gguf"), b"generic").unwrap();

        let resolved = locator(&bundled, &documents).resolve().unwrap();
        assert_eq!(resolved.kind(), LocationKind::Bundled);
        assert_eq!(resolved.candidate().base_name, "medgemma-4b-instruct");
    }

    #[test]
    fn test_falls_back_to_documents() {
        let bundled = TempDir::new().unwrap();
        let documents = TempDir::new().unwrap();
        fs::write(documents.path().join("medgemma-4b-instruct.gguf"), b"generic").unwrap();

        let resolved = locator(&bundled, &documents).resolve().unwrap();
        assert_eq!(resolved.kind(), LocationKind::Documents);
        assert!(resolved.path().is_absolute());
        assert!(resolved.path().ends_with("medgemma-4b-instruct.gguf"));
    }

    #[test]
    fn test_directory_with_candidate_name_is_ignored() {
        let bundled = TempDir::new().unwrap();
        let documents = TempDir::new().unwrap();
        fs::create_dir(bundled.path().join("medgemma-4b-instruct.Q4_K_M.gguf")).unwrap();

        assert!(locator(&bundled, &documents).resolve().is_err());
    }

    #[test]
    fn test_missing_directories_are_not_an_error() {
        let locator = ModelLocator::new(
            vec![SearchLocation {
                kind: LocationKind::Documents,
                dir: PathBuf::from("/definitely/not/here"),
            }],
            default_candidates(),
        );
        assert!(matches!(
            locator.resolve(),
            Err(EngineError::ModelNotFound { .. })
        ));
    }
}
