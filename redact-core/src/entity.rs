//! # Modelo de Entidades
//!
//! Uma [`Entity`] é **uma ocorrência** de dado pessoal no documento: detectada por um
//! detector, declarada manualmente pelo usuário ou extraída de um template.
//!
//! ## Identidade
//!
//! Cada entidade recebe um [`EntityId`] (UUID v7) no momento em que entra na sessão.
//! O id nunca é reutilizado, nem quando a entidade é editada ou desmarcada. Identificadores
//! fornecidos pelos detectores são ignorados.
//!
//! ## Origem
//!
//! Os campos que dependem da origem ficam em [`EntityOrigin`], uma enum fechada:
//!
//! | Variante    | Campos obrigatórios                        | Score                |
//! |-------------|--------------------------------------------|----------------------|
//! | `Detected`  | fonte (`local`/`cloud`), score, span?      | o do detector        |
//! | `Manual`    | nenhum                                     | sempre `1.0`         |
//! | `Template`  | template_id, region_id, field_name         | confiança da região  |

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{PagePoint, PageRect};

/// Identificador opaco e estável de uma entidade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EntityId {
    fn from(u: Uuid) -> Self {
        Self(u)
    }
}

/// Tipo de entidade. Vocabulário aberto: qualquer rótulo em maiúsculas é aceito.
///
/// As constantes cobrem os tipos mais comuns em documentos jurídicos.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EntityType(Cow<'static, str>);

impl EntityType {
    pub const PERSON: EntityType = EntityType(Cow::Borrowed("PERSON"));
    pub const ORGANIZATION: EntityType = EntityType(Cow::Borrowed("ORGANIZATION"));
    pub const TAX_ID: EntityType = EntityType(Cow::Borrowed("TAX_ID"));
    pub const VAT_NUMBER: EntityType = EntityType(Cow::Borrowed("VAT_NUMBER"));
    pub const PHONE: EntityType = EntityType(Cow::Borrowed("PHONE"));
    pub const EMAIL: EntityType = EntityType(Cow::Borrowed("EMAIL"));
    pub const BANK_ACCOUNT: EntityType = EntityType(Cow::Borrowed("BANK_ACCOUNT"));
    pub const ADDRESS: EntityType = EntityType(Cow::Borrowed("ADDRESS"));
    pub const DATE: EntityType = EntityType(Cow::Borrowed("DATE"));
    pub const MANUAL: EntityType = EntityType(Cow::Borrowed("MANUAL"));

    /// Normaliza o rótulo (trim + maiúsculas, espaços e hífens viram `_`).
    pub fn new(label: &str) -> Self {
        let norm: String = label
            .trim()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect::<String>()
            .to_uppercase();
        Self(Cow::Owned(norm))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType::new(&s)
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.0.into_owned()
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        EntityType::new(s)
    }
}

/// Detector que produziu uma entidade detectada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    /// Pipeline local (padrões/gazetteers/ML)
    Local,
    /// Detector de visão na nuvem
    Cloud,
}

/// Fonte de uma entidade, incluindo as que não vêm de detectores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Local,
    Cloud,
    Manual,
    Template,
}

impl From<DetectorSource> for Source {
    fn from(s: DetectorSource) -> Self {
        match s {
            DetectorSource::Local => Source::Local,
            DetectorSource::Cloud => Source::Cloud,
        }
    }
}

/// Intervalo `[start, end)` em bytes no texto plano do documento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start: start.min(end), end: start.max(end) }
    }

    pub fn overlaps(&self, other: &TextSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Representação legada `(start, end)`, com `(-1, -1)` para entidades sem posição.
    pub fn as_offsets(span: Option<TextSpan>) -> (i64, i64) {
        match span {
            Some(s) => (s.start as i64, s.end as i64),
            None => (-1, -1),
        }
    }
}

/// Uma localização física: página (base 0) + retângulo em espaço de página.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub page: usize,
    pub rect: PageRect,
}

impl Location {
    pub fn new(page: usize, rect: PageRect) -> Self {
        Self { page, rect }
    }

    pub fn overlaps(&self, other: &Location) -> bool {
        self.page == other.page && self.rect.intersects(&other.rect)
    }

    pub fn contains(&self, page: usize, p: PagePoint) -> bool {
        self.page == page && self.rect.contains_point(p)
    }
}

/// Dados que dependem de como a entidade nasceu.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EntityOrigin {
    Detected {
        detector: DetectorSource,
        score: f64,
        span: Option<TextSpan>,
        /// Aceitação imposta pela memória de classificação (`always`/`flag`)
        #[serde(default)]
        forced: bool,
    },
    Manual,
    Template {
        template_id: Uuid,
        region_id: Uuid,
        field_name: String,
        confidence: f64,
    },
}

/// Uma ocorrência de dado pessoal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub text: String,
    pub locations: Vec<Location>,
    /// Marcada para redação
    pub accepted: bool,
    /// Classificada como `flag`: aparece destacada na revisão
    #[serde(default)]
    pub needs_review: bool,
    pub origin: EntityOrigin,
}

impl Entity {
    /// Entidade detectada. Score é limitado a `[0, 1]`.
    pub fn detected(
        detector: DetectorSource,
        entity_type: EntityType,
        text: impl Into<String>,
        score: f64,
        span: Option<TextSpan>,
        locations: Vec<Location>,
    ) -> Self {
        Self {
            id: EntityId::new(),
            entity_type,
            text: text.into(),
            locations,
            accepted: true,
            needs_review: false,
            origin: EntityOrigin::Detected {
                detector,
                score: clamp_score(score),
                span,
                forced: false,
            },
        }
    }

    /// Entidade declarada pelo usuário: score fixo em `1.0`, pode não ter posição.
    pub fn manual(entity_type: EntityType, text: impl Into<String>, locations: Vec<Location>) -> Self {
        Self {
            id: EntityId::new(),
            entity_type,
            text: text.into(),
            locations,
            accepted: true,
            needs_review: false,
            origin: EntityOrigin::Manual,
        }
    }

    pub fn from_template(
        template_id: Uuid,
        region_id: Uuid,
        field_name: impl Into<String>,
        entity_type: EntityType,
        text: impl Into<String>,
        confidence: f64,
        location: Location,
    ) -> Self {
        Self {
            id: EntityId::new(),
            entity_type,
            text: text.into(),
            locations: vec![location],
            accepted: true,
            needs_review: false,
            origin: EntityOrigin::Template {
                template_id,
                region_id,
                field_name: field_name.into(),
                confidence: clamp_score(confidence),
            },
        }
    }

    pub fn score(&self) -> f64 {
        match &self.origin {
            EntityOrigin::Detected { score, .. } => *score,
            EntityOrigin::Manual => 1.0,
            EntityOrigin::Template { confidence, .. } => *confidence,
        }
    }

    pub fn source(&self) -> Source {
        match &self.origin {
            EntityOrigin::Detected { detector, .. } => (*detector).into(),
            EntityOrigin::Manual => Source::Manual,
            EntityOrigin::Template { .. } => Source::Template,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.origin, EntityOrigin::Manual)
    }

    pub fn span(&self) -> Option<TextSpan> {
        match &self.origin {
            EntityOrigin::Detected { span, .. } => *span,
            _ => None,
        }
    }

    /// Visível na revisão com o limiar `threshold`.
    ///
    /// Entidades manuais, de template ou forçadas pela memória de classificação
    /// nunca são escondidas pelo limiar.
    pub fn is_visible(&self, threshold: f64) -> bool {
        match &self.origin {
            EntityOrigin::Detected { score, forced, .. } => *forced || *score >= threshold,
            EntityOrigin::Manual | EntityOrigin::Template { .. } => true,
        }
    }

    /// Chave de agrupamento/classificação: `(texto normalizado, tipo)`.
    pub fn key(&self, case_insensitive: bool) -> (String, EntityType) {
        (normalize_text(&self.text, case_insensitive), self.entity_type.clone())
    }
}

/// Normalização usada como chave: espaços colapsados e, opcionalmente, minúsculas.
pub fn normalize_text(text: &str, case_insensitive: bool) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_insensitive {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Entity::manual(EntityType::PERSON, "Mario Rossi", vec![]);
        let b = Entity::manual(EntityType::PERSON, "Mario Rossi", vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_manual_score_is_one() {
        let e = Entity::manual(EntityType::MANUAL, "segreto", vec![]);
        assert_eq!(e.score(), 1.0);
        assert_eq!(e.source(), Source::Manual);
        assert!(e.accepted);
        assert_eq!(TextSpan::as_offsets(e.span()), (-1, -1));
    }

    #[test]
    fn test_detected_score_clamped() {
        let e = Entity::detected(DetectorSource::Cloud, EntityType::EMAIL, "a@b.it", 1.7, None, vec![]);
        assert_eq!(e.score(), 1.0);
        assert_eq!(e.source(), Source::Cloud);
    }

    #[test]
    fn test_entity_type_normalization() {
        assert_eq!(EntityType::new(" tax-id "), EntityType::TAX_ID);
        assert_eq!(EntityType::new("bank account"), EntityType::BANK_ACCOUNT);
        assert_eq!(EntityType::from("person").as_str(), "PERSON");
    }

    #[test]
    fn test_visibility_threshold() {
        let e = Entity::detected(DetectorSource::Local, EntityType::PERSON, "Mario Rossi", 0.6, None, vec![]);
        assert!(!e.is_visible(0.8));
        assert!(e.is_visible(0.5));
        assert!(Entity::manual(EntityType::PERSON, "x", vec![]).is_visible(1.0));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Mario   ROSSI ", true), "mario rossi");
        assert_eq!(normalize_text("Mario  Rossi", false), "Mario Rossi");
    }

    #[test]
    fn test_origin_serialization_tag() {
        let e = Entity::manual(EntityType::PERSON, "x", vec![]);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["origin"]["source"], "manual");
        assert_eq!(v["entity_type"], "PERSON");
    }
}
