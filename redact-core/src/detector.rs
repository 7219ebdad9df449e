//! # Detectores
//!
//! Um detector recebe um [`Document`] e devolve spans candidatos com score. O núcleo não
//! conhece o algoritmo: só consome o contrato [`Detector`]. A configuração é uma "sacola"
//! opaca ([`DetectorConfig`]) repassada sem interpretação.
//!
//! ## Detectores embutidos
//!
//! | Detector               | Fonte   | Como funciona                                               |
//! |------------------------|---------|-------------------------------------------------------------|
//! | [`PatternDetector`]    | local   | Expressões regulares (e-mail, IBAN, código fiscal, ...)     |
//! | [`LearnedTermDetector`]| local   | Gazetteer com os termos ensinados como `always`/`flag`      |
//! | [`CloudDetector`]      | cloud   | Adaptador da resposta do modelo de visão (caixas `[0,1000]`)|
//!
//! Assim como no motor de regras clássico, os padrões são aplicados em ordem de prioridade
//! e um trecho já reconhecido não é reclamado por um padrão posterior.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::classification::ClassificationStore;
use crate::document::Document;
use crate::entity::{DetectorSource, EntityType, TextSpan};
use crate::error::Warning;
use crate::geometry::{NormRect, PageRect};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector indisponível: {0}")]
    Unavailable(String),

    #[error("resposta inválida do detector: {0}")]
    InvalidResponse(String),

    #[error("detecção cancelada")]
    Cancelled,
}

/// Configuração opaca, específica de cada detector (profundidade, palavras-chave, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectorConfig(pub Map<String, Value>);

impl DetectorConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Localização informada pelo detector, em qualquer um dos espaços aceitos na entrada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "space", rename_all = "snake_case")]
pub enum RawLocation {
    Page { page: usize, rect: PageRect },
    Normalized { page: usize, bbox: NormRect },
}

/// Uma detecção crua, antes da reconciliação.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub text: String,
    pub entity_type: EntityType,
    pub score: f64,
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub end: Option<usize>,
    #[serde(default)]
    pub locations: Option<Vec<RawLocation>>,
}

impl RawDetection {
    /// Detecção ancorada no texto plano.
    pub fn from_span(text: impl Into<String>, entity_type: EntityType, score: f64, span: TextSpan) -> Self {
        Self {
            text: text.into(),
            entity_type,
            score,
            start: Some(span.start),
            end: Some(span.end),
            locations: None,
        }
    }

    pub fn span(&self) -> Option<TextSpan> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(TextSpan::new(s, e)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectorOutput {
    pub entities: Vec<RawDetection>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
}

/// Contrato de um detector.
pub trait Detector: Send + Sync {
    /// Nome para logs e avisos
    fn name(&self) -> &str;
    fn source(&self) -> DetectorSource;
    fn detect(&self, document: &Document, config: &DetectorConfig) -> Result<DetectorOutput, DetectorError>;
}

/// Um padrão nomeado do [`PatternDetector`].
#[derive(Debug, Clone)]
pub struct PiiPattern {
    pub name: &'static str,
    pub entity_type: EntityType,
    pub regex: Regex,
    pub score: f64,
}

/// Detector local por expressões regulares.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    patterns: Vec<PiiPattern>,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self { patterns: Vec::new() }
    }

    /// Adiciona um padrão no fim da fila de prioridade.
    pub fn add_pattern(&mut self, name: &'static str, entity_type: EntityType, regex: Regex, score: f64) {
        self.patterns.push(PiiPattern { name, entity_type, regex, score });
    }

    /// Padrões para documentos italianos/europeus, do mais específico ao mais genérico.
    pub fn with_default_patterns() -> Self {
        let mut d = Self::new();
        let defaults: [(&'static str, EntityType, &str, f64); 6] = [
            ("email", EntityType::EMAIL, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}", 0.98),
            ("iban", EntityType::BANK_ACCOUNT, r"\b[A-Z]{2}\d{2}(?: ?[A-Z0-9]{4}){2,7}(?: ?[A-Z0-9]{1,3})?\b", 0.95),
            ("codice_fiscale", EntityType::TAX_ID, r"(?i)\b[A-Z]{6}\d{2}[A-EHLMPR-T]\d{2}[A-Z]\d{3}[A-Z]\b", 0.97),
            ("partita_iva", EntityType::VAT_NUMBER, r"\b(?:IT ?)?\d{11}\b", 0.85),
            ("phone", EntityType::PHONE, r"(?:\+\d{2,3}[ .-]?)?\b\d{2,4}[ .-]?\d{3,4}[ .-]?\d{3,4}\b", 0.75),
            ("date", EntityType::DATE, r"\b\d{1,2}[/.-]\d{1,2}[/.-]\d{2,4}\b", 0.7),
        ];
        for (name, ty, re, score) in defaults {
            if let Ok(regex) = Regex::new(re) {
                d.add_pattern(name, ty, regex, score);
            }
        }
        d
    }

    pub fn patterns(&self) -> &[PiiPattern] {
        &self.patterns
    }

    /// Tipos habilitados via `config["types"]` (ausente = todos).
    fn enabled_types(config: &DetectorConfig) -> Option<Vec<EntityType>> {
        config.get("types").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .map(EntityType::new)
                .collect()
        })
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::with_default_patterns()
    }
}

impl Detector for PatternDetector {
    fn name(&self) -> &str {
        "patterns"
    }

    fn source(&self) -> DetectorSource {
        DetectorSource::Local
    }

    fn detect(&self, document: &Document, config: &DetectorConfig) -> Result<DetectorOutput, DetectorError> {
        let text = document.full_text();
        let enabled = Self::enabled_types(config);
        let mut claimed: Vec<TextSpan> = Vec::new();
        let mut out = DetectorOutput::default();

        for pattern in &self.patterns {
            if let Some(types) = &enabled {
                if !types.contains(&pattern.entity_type) {
                    continue;
                }
            }
            for m in pattern.regex.find_iter(text) {
                let span = TextSpan::new(m.start(), m.end());
                if claimed.iter().any(|c| c.overlaps(&span)) {
                    continue;
                }
                claimed.push(span);
                out.entities.push(RawDetection::from_span(
                    m.as_str(),
                    pattern.entity_type.clone(),
                    pattern.score,
                    span,
                ));
            }
        }
        Ok(out)
    }
}

/// Reconhece, em qualquer documento, os termos ensinados como `always` ou `flag`.
pub struct LearnedTermDetector {
    store: Arc<ClassificationStore>,
}

impl LearnedTermDetector {
    pub fn new(store: Arc<ClassificationStore>) -> Self {
        Self { store }
    }
}

impl Detector for LearnedTermDetector {
    fn name(&self) -> &str {
        "learned_terms"
    }

    fn source(&self) -> DetectorSource {
        DetectorSource::Local
    }

    fn detect(&self, document: &Document, _config: &DetectorConfig) -> Result<DetectorOutput, DetectorError> {
        let snapshot = self
            .store
            .snapshot()
            .map_err(|e| DetectorError::Unavailable(e.to_string()))?;
        let mut out = DetectorOutput::default();
        for (entity_type, record) in snapshot.allowed_terms() {
            for span in document.find_occurrences(&record.term, record.case_sensitive) {
                let literal = document.slice(span).unwrap_or(&record.term).to_string();
                out.entities.push(RawDetection::from_span(literal, entity_type.clone(), 1.0, span));
            }
        }
        Ok(out)
    }
}

/// Entidade no formato de resposta do modelo de visão.
///
/// `box_2d` é `[ymin, xmin, ymax, xmax]` no espaço `[0,1000]`, origem topo-esquerda.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionEntity {
    pub text: String,
    #[serde(alias = "type", alias = "label")]
    pub entity_type: String,
    #[serde(default = "default_vision_score")]
    pub score: f64,
    pub box_2d: Vec<f64>,
}

fn default_vision_score() -> f64 {
    0.9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionPage {
    pub page: usize,
    #[serde(default)]
    pub entities: Vec<VisionEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionResponse {
    #[serde(default)]
    pub pages: Vec<VisionPage>,
}

impl VisionResponse {
    pub fn parse(raw: &str) -> Result<Self, DetectorError> {
        serde_json::from_str(raw).map_err(|e| DetectorError::InvalidResponse(e.to_string()))
    }

    /// Converte para detecções com localização normalizada.
    ///
    /// Caixas sem exatamente quatro números viram `MalformedGeometry`; a conversão para o
    /// espaço de página fica para a reconciliação, que conhece as dimensões das páginas.
    pub fn into_output(self) -> DetectorOutput {
        let mut out = DetectorOutput::default();
        for page in self.pages {
            for e in page.entities {
                let Ok(b) = <[f64; 4]>::try_from(e.box_2d.as_slice()) else {
                    out.warnings.push(Warning::malformed(
                        e.text,
                        Some(page.page),
                        format!("box_2d com {} valores", e.box_2d.len()),
                    ));
                    continue;
                };
                out.entities.push(RawDetection {
                    text: e.text,
                    entity_type: EntityType::new(&e.entity_type),
                    score: e.score,
                    start: None,
                    end: None,
                    locations: Some(vec![RawLocation::Normalized {
                        page: page.page,
                        bbox: NormRect::from_box_2d(b),
                    }]),
                });
            }
        }
        out
    }
}

/// Transporte até o serviço de visão (HTTP, fila, mock de teste...).
pub trait VisionClient: Send + Sync {
    /// Devolve o corpo JSON bruto da resposta.
    fn request(&self, document: &Document, config: &DetectorConfig) -> Result<String, DetectorError>;
}

/// Detector na nuvem: delega a um [`VisionClient`] e adapta a resposta.
pub struct CloudDetector<C: VisionClient> {
    client: C,
}

impl<C: VisionClient> CloudDetector<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C: VisionClient> Detector for CloudDetector<C> {
    fn name(&self) -> &str {
        "cloud_vision"
    }

    fn source(&self) -> DetectorSource {
        DetectorSource::Cloud
    }

    fn detect(&self, document: &Document, config: &DetectorConfig) -> Result<DetectorOutput, DetectorError> {
        let raw = self.client.request(document, config)?;
        Ok(VisionResponse::parse(&raw)?.into_output())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::ClassificationState;
    use crate::geometry::PageSize;

    fn doc(text: &str) -> Document {
        Document::from_page_texts(&[(PageSize::a4(), text)])
    }

    #[test]
    fn test_pattern_detector_finds_common_pii() {
        let d = doc("Scrivere a mario.rossi@example.it, CF RSSMRA80A01H501U, IBAN IT60X0542811101000000123456, nato il 01/01/1980");
        let out = PatternDetector::default().detect(&d, &DetectorConfig::default()).unwrap();
        let types: Vec<&str> = out.entities.iter().map(|e| e.entity_type.as_str()).collect();
        assert!(types.contains(&"EMAIL"));
        assert!(types.contains(&"TAX_ID"));
        assert!(types.contains(&"BANK_ACCOUNT"));
        assert!(types.contains(&"DATE"));
        for e in &out.entities {
            assert_eq!(d.slice(e.span().unwrap()), Some(e.text.as_str()));
        }
    }

    #[test]
    fn test_pattern_priority_prevents_overlap() {
        let d = doc("IBAN IT60X0542811101000000123456");
        let out = PatternDetector::default().detect(&d, &DetectorConfig::default()).unwrap();
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].entity_type, EntityType::BANK_ACCOUNT);
    }

    #[test]
    fn test_pattern_config_restricts_types() {
        let d = doc("mario.rossi@example.it 01/01/1980");
        let mut cfg = DetectorConfig::default();
        cfg.0.insert("types".into(), serde_json::json!(["date"]));
        let out = PatternDetector::default().detect(&d, &cfg).unwrap();
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.entities[0].entity_type, EntityType::DATE);
    }

    #[test]
    fn test_learned_terms_detector() {
        let store = Arc::new(ClassificationStore::in_memory());
        store
            .classify("Studio Bianchi", &EntityType::ORGANIZATION, ClassificationState::Always, false)
            .unwrap();
        store
            .classify("Giudice", &EntityType::PERSON, ClassificationState::Never, false)
            .unwrap();
        let d = doc("Lo studio bianchi rappresenta il Giudice. STUDIO BIANCHI firma.");
        let out = LearnedTermDetector::new(store).detect(&d, &DetectorConfig::default()).unwrap();
        assert_eq!(out.entities.len(), 2);
        assert!(out.entities.iter().all(|e| e.entity_type == EntityType::ORGANIZATION));
        assert_eq!(out.entities[0].text, "studio bianchi");
    }

    #[test]
    fn test_vision_response_adapter() {
        let raw = r#"{"pages":[{"page":0,"entities":[
            {"text":"Mario Rossi","type":"person","score":0.8,"box_2d":[100,100,120,300]},
            {"text":"rotto","type":"person","box_2d":[1,2,3]}
        ]}]}"#;
        let out = VisionResponse::parse(raw).unwrap().into_output();
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.entities[0].entity_type, EntityType::PERSON);
        assert!(matches!(
            out.entities[0].locations.as_deref(),
            Some([RawLocation::Normalized { page: 0, .. }])
        ));
    }

    struct FailingClient;

    impl VisionClient for FailingClient {
        fn request(&self, _: &Document, _: &DetectorConfig) -> Result<String, DetectorError> {
            Err(DetectorError::Unavailable("timeout".into()))
        }
    }

    #[test]
    fn test_cloud_detector_propagates_unavailable() {
        let d = doc("x");
        let res = CloudDetector::new(FailingClient).detect(&d, &DetectorConfig::default());
        assert_eq!(res, Err(DetectorError::Unavailable("timeout".into())));
    }
}
