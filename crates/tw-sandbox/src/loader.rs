use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use tw_types::SetupError;

use crate::codec::{decode_frame, DEFAULT_MAX_FRAME_LEN};
use crate::module::StrategyModule;
use crate::runtime::StrategyRuntime;
use crate::strategies::{BuyAndHold, SmaCross};

/// Describes which module to instantiate and how to parameterize it.
///
/// YAML when loaded from a file, a single codec frame when loaded from
/// bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyManifest {
    pub identifier: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub type StrategyFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn StrategyModule>, SetupError> + Send + Sync>;

/// Registry of strategy factories keyed by identifier.
pub struct StrategyLoader {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyLoader {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Loader with the shipped strategies pre-registered.
    pub fn with_builtins() -> Self {
        let mut loader = Self::new();
        loader.register("buy-and-hold", Box::new(|params| BuyAndHold::from_params(params)));
        loader.register("sma-cross", Box::new(|params| SmaCross::from_params(params)));
        loader
    }

    pub fn register(&mut self, identifier: impl Into<String>, factory: StrategyFactory) {
        self.factories.insert(identifier.into(), factory);
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn load_manifest(&self, manifest: &StrategyManifest) -> Result<StrategyRuntime, SetupError> {
        let factory =
            self.factories
                .get(&manifest.identifier)
                .ok_or_else(|| SetupError::UnknownStrategy {
                    identifier: manifest.identifier.clone(),
                })?;
        let module = factory(&manifest.params)?;
        info!(identifier = %manifest.identifier, "instantiated strategy from manifest");
        StrategyRuntime::load(module)
    }

    /// Parse a manifest file: YAML for `.yaml`/`.yml`, a codec frame
    /// otherwise.
    pub fn manifest_from_file(path: &Path) -> Result<StrategyManifest, SetupError> {
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        if is_yaml {
            let text = std::fs::read_to_string(path).map_err(|e| SetupError::StrategyLoad {
                message: format!("read {}: {}", path.display(), e),
            })?;
            serde_yaml::from_str(&text).map_err(|e| SetupError::StrategyLoad {
                message: format!("parse {}: {}", path.display(), e),
            })
        } else {
            let bytes = std::fs::read(path).map_err(|e| SetupError::StrategyLoad {
                message: format!("read {}: {}", path.display(), e),
            })?;
            Self::manifest_from_bytes(&bytes)
        }
    }

    pub fn manifest_from_bytes(bytes: &[u8]) -> Result<StrategyManifest, SetupError> {
        let (manifest, _): (StrategyManifest, usize) = decode_frame(bytes, DEFAULT_MAX_FRAME_LEN)
            .map_err(|e| SetupError::StrategyLoad {
                message: e.to_string(),
            })?;
        Ok(manifest)
    }

    pub fn load_from_file(&self, path: &Path) -> Result<StrategyRuntime, SetupError> {
        self.load_manifest(&Self::manifest_from_file(path)?)
    }

    pub fn load_from_bytes(&self, bytes: &[u8]) -> Result<StrategyRuntime, SetupError> {
        self.load_manifest(&Self::manifest_from_bytes(bytes)?)
    }
}

impl Default for StrategyLoader {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;

    #[test]
    fn test_builtin_identifiers() {
        let loader = StrategyLoader::with_builtins();
        assert_eq!(loader.identifiers(), vec!["buy-and-hold", "sma-cross"]);
    }

    #[test]
    fn test_unknown_identifier() {
        let loader = StrategyLoader::with_builtins();
        let manifest = StrategyManifest {
            identifier: "martingale".to_string(),
            params: serde_json::Value::Null,
        };
        assert!(matches!(
            loader.load_manifest(&manifest),
            Err(SetupError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn test_load_from_framed_bytes() {
        let loader = StrategyLoader::with_builtins();
        let manifest = StrategyManifest {
            identifier: "buy-and-hold".to_string(),
            params: serde_json::Value::Null,
        };
        let bytes = encode_frame(&manifest, DEFAULT_MAX_FRAME_LEN).unwrap();
        let runtime = loader.load_from_bytes(&bytes).unwrap();
        assert_eq!(runtime.identifier(), "buy-and-hold");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = std::env::temp_dir().join(format!("tw-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("strategy.yaml");
        std::fs::write(&path, "identifier: sma-cross\nparams:\n  short_period: 5\n  long_period: 20\n")
            .unwrap();

        let loader = StrategyLoader::with_builtins();
        let runtime = loader.load_from_file(&path).unwrap();
        assert_eq!(runtime.identifier(), "sma-cross");
        std::fs::remove_dir_all(&dir).ok();
    }
}
