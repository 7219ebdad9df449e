//! # Erros e Avisos
//!
//! Duas categorias bem separadas:
//!
//! - **Erros** (`Result::Err`): só quando uma pré-condição da operação inteira falha
//!   (nenhum detector disponível, layout incompatível com o template, arquivo ilegível).
//! - **Avisos** ([`Warning`]): problemas de um único item (uma detecção, uma região, uma
//!   localização). O item é descartado, o resto é processado e o aviso volta junto com o
//!   resultado. Nada é descartado em silêncio.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::classification::StoreError;
use crate::config::ConfigError;
use crate::detector::DetectorError;
use crate::entity::EntityId;
use crate::geometry::GeometryError;
use crate::template::TemplateError;

pub type Result<T> = std::result::Result<T, RedactError>;

#[derive(Debug, Error)]
pub enum RedactError {
    #[error("geometria: {0}")]
    Geometry(#[from] GeometryError),

    #[error("memória de classificação: {0}")]
    Store(#[from] StoreError),

    #[error("template: {0}")]
    Template(#[from] TemplateError),

    #[error("detector: {0}")]
    Detector(#[from] DetectorError),

    #[error("configuração: {0}")]
    Config(#[from] ConfigError),

    #[error("nenhum detector disponível")]
    NoDetectors,

    #[error("entidade não encontrada: {0}")]
    EntityNotFound(EntityId),
}

/// Problema não fatal ligado a um único item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Um detector não respondeu; a reconciliação seguiu com os demais.
    DetectorUnavailable { detector: String, reason: String },
    /// Detecção ou região com coordenadas inválidas; o item foi descartado.
    MalformedGeometry {
        text: String,
        page: Option<usize>,
        reason: String,
    },
    /// Região de template sem nenhuma palavra no documento alvo.
    EmptyRegion { region_id: Uuid, field_name: String },
    /// Localização numa página que não existe no documento exportado.
    ExportLocationOutOfRange {
        entity_id: EntityId,
        page: usize,
        page_count: usize,
    },
    /// Entidade sem posição cujo texto não aparece no documento; nada foi redigido.
    ExportTextNotFound { entity_id: EntityId, text: String },
}

impl Warning {
    pub fn malformed(text: impl Into<String>, page: Option<usize>, reason: impl ToString) -> Self {
        Warning::MalformedGeometry {
            text: text.into(),
            page,
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Warning::DetectorUnavailable { detector, reason } => {
                write!(f, "detector '{detector}' indisponível: {reason}")
            }
            Warning::MalformedGeometry { text, page, reason } => match page {
                Some(p) => write!(f, "geometria inválida para '{text}' na página {p}: {reason}"),
                None => write!(f, "geometria inválida para '{text}': {reason}"),
            },
            Warning::EmptyRegion { field_name, .. } => {
                write!(f, "região '{field_name}' sem texto no documento")
            }
            Warning::ExportLocationOutOfRange { entity_id, page, page_count } => write!(
                f,
                "entidade {entity_id}: página {page} fora do documento ({page_count} páginas)"
            ),
            Warning::ExportTextNotFound { entity_id, text } => {
                write!(f, "entidade {entity_id}: '{text}' não encontrado no documento")
            }
        }
    }
}
