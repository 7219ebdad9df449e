//! Configuração em TOML.
//!
//! Todos os campos têm valor padrão; um arquivo ausente equivale à configuração padrão.
//!
//! ```toml
//! [review]
//! confidence_threshold = 0.5
//! case_insensitive_grouping = true
//!
//! [templates]
//! layout_tolerance = 0.02
//! default_ttl_secs = 86400
//!
//! [export]
//! style = "placeholder"
//! include_text = true
//!
//! [storage]
//! classification_path = "data/classifications.json"
//! template_path = "data/templates.json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::export::{ExportOptions, ExportStyle};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("falha ao ler {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML inválido: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("valor inválido para {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactConfig {
    pub review: ReviewConfig,
    pub templates: TemplateConfig,
    pub export: ExportConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Limiar inicial de visibilidade, em `[0, 1]`
    pub confidence_threshold: f64,
    pub case_insensitive_grouping: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            case_insensitive_grouping: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Diferença relativa aceita nas dimensões de página
    pub layout_tolerance: f64,
    /// TTL dos templates novos; `None` = permanentes
    pub default_ttl_secs: Option<u64>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            layout_tolerance: 0.02,
            default_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub style: ExportStyle,
    pub include_text: bool,
}

impl ExportConfig {
    pub fn options(&self) -> ExportOptions {
        ExportOptions {
            style: self.style,
            include_text: self.include_text,
        }
    }
}

/// Caminhos de persistência; `None` mantém o estado só em memória.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub classification_path: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
}

impl RedactConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RedactConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Lê `path`; se o arquivo não existir, devolve os padrões.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "arquivo de configuração ausente, usando padrões");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.review.confidence_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(ConfigError::Invalid {
                field: "review.confidence_threshold",
                reason: format!("{t} fora de [0, 1]"),
            });
        }
        let tol = self.templates.layout_tolerance;
        if !tol.is_finite() || tol < 0.0 {
            return Err(ConfigError::Invalid {
                field: "templates.layout_tolerance",
                reason: format!("{tol} deve ser >= 0"),
            });
        }
        Ok(())
    }

    pub fn template_ttl(&self) -> Option<chrono::Duration> {
        self.templates
            .default_ttl_secs
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let cfg = RedactConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, RedactConfig::default());
        assert_eq!(cfg.review.confidence_threshold, 0.5);
        assert!(cfg.template_ttl().is_none());
    }

    #[test]
    fn test_partial_sections() {
        let cfg = RedactConfig::from_toml_str(
            "[export]\nstyle = \"placeholder\"\n[templates]\ndefault_ttl_secs = 60\n",
        )
        .unwrap();
        assert_eq!(cfg.export.style, ExportStyle::Placeholder);
        assert!(!cfg.export.include_text);
        assert_eq!(cfg.templates.layout_tolerance, 0.02);
        assert_eq!(cfg.template_ttl(), Some(chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_invalid_threshold() {
        let err = RedactConfig::from_toml_str("[review]\nconfidence_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "review.confidence_threshold", .. }));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            RedactConfig::from_toml_str("[review\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RedactConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, RedactConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redact.toml");
        std::fs::write(&path, "[storage]\nclassification_path = \"c.json\"\n").unwrap();
        let cfg = RedactConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.classification_path, Some(PathBuf::from("c.json")));
    }
}
