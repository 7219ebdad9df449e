//! # Templates de Layout
//!
//! Um template é um conjunto de regiões anotadas sobre um documento de referência
//! (ex: o campo "Nome do réu" sempre no mesmo lugar de um formulário). Aplicá-lo a outro
//! documento com o mesmo layout produz entidades sem nenhum passo de detecção: para cada
//! região, o texto é **relido do documento alvo** nas mesmas coordenadas.
//!
//! A técnica depende de congruência de layout. Se as páginas do alvo tiverem dimensões
//! diferentes das de referência (além da tolerância), a aplicação falha com
//! [`TemplateError::LayoutMismatch`] em vez de devolver um resultado vazio.
//!
//! A aplicação em lote ([`apply_template_batch`]) roda em paralelo com Rayon; a falha de
//! um documento não interrompe os outros.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classification::{write_json_atomic, StoreError};
use crate::document::Document;
use crate::entity::{Entity, EntityType, Location};
use crate::error::Warning;
use crate::geometry::{PageRect, PageSize};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("um template precisa de pelo menos uma região")]
    NoRegions,

    #[error("região '{field_name}' inválida: {reason}")]
    MalformedRegion { field_name: String, reason: String },

    #[error("layout incompatível na página {page}: esperado {expected:?}, encontrado {actual:?}")]
    LayoutMismatch {
        page: usize,
        expected: PageSize,
        actual: Option<PageSize>,
    },

    #[error("template não encontrado: {0}")]
    NotFound(Uuid),

    #[error("template expirado: {0}")]
    Expired(Uuid),

    #[error("região não encontrada: {0}")]
    RegionNotFound(Uuid),

    #[error("persistência: {0}")]
    Persistence(#[from] StoreError),

    #[error("lock envenenado no repositório de templates")]
    Poisoned,
}

fn default_confidence() -> f64 {
    1.0
}

/// Uma região anotada. `bbox` está sempre em espaço de página.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRegion {
    #[serde(default = "Uuid::now_v7")]
    pub region_id: Uuid,
    #[serde(default)]
    pub page: usize,
    pub bbox: PageRect,
    pub field_name: String,
    pub entity_type: EntityType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Intenção de quem marcou (usuário, sugestão da IA, ...)
    #[serde(default)]
    pub source_label: String,
}

impl TemplateRegion {
    pub fn new(
        page: usize,
        bbox: PageRect,
        field_name: impl Into<String>,
        entity_type: EntityType,
        confidence: f64,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            region_id: Uuid::now_v7(),
            page,
            bbox,
            field_name: field_name.into(),
            entity_type,
            confidence,
            source_label: source_label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub template_id: Uuid,
    #[serde(default)]
    pub name: String,
    pub regions: Vec<TemplateRegion>,
    /// Dimensões das páginas do documento de referência
    #[serde(default)]
    pub reference_pages: Vec<PageSize>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Template {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Agrega as regiões num template. Validação mínima: ao menos uma região e cada `bbox`
/// dentro da sua página de referência.
pub fn create_template(
    name: impl Into<String>,
    reference_pages: Vec<PageSize>,
    regions: Vec<TemplateRegion>,
    ttl: Option<Duration>,
) -> Result<Template, TemplateError> {
    if regions.is_empty() {
        return Err(TemplateError::NoRegions);
    }
    for r in &regions {
        let Some(size) = reference_pages.get(r.page) else {
            return Err(TemplateError::MalformedRegion {
                field_name: r.field_name.clone(),
                reason: format!("página {} não existe na referência", r.page),
            });
        };
        if !r.bbox.is_within(size) || r.bbox.area() <= 0.0 {
            return Err(TemplateError::MalformedRegion {
                field_name: r.field_name.clone(),
                reason: "bbox fora da página ou vazio".to_string(),
            });
        }
    }
    let created_at = Utc::now();
    Ok(Template {
        template_id: Uuid::now_v7(),
        name: name.into(),
        regions,
        reference_pages,
        created_at,
        expires_at: ttl.map(|d| created_at + d),
    })
}

/// Entidades produzidas por um template num documento.
#[derive(Debug, Clone, Default)]
pub struct TemplateApplication {
    pub document_id: Uuid,
    pub entities: Vec<Entity>,
    pub warnings: Vec<Warning>,
}

/// Relê, no documento alvo, o texto de cada região do template.
///
/// `tolerance` é a diferença relativa máxima aceita nas dimensões de cada página.
pub fn apply_template(
    template: &Template,
    target: &Document,
    tolerance: f64,
) -> Result<TemplateApplication, TemplateError> {
    check_layout(template, target, tolerance)?;

    let mut app = TemplateApplication { document_id: target.id, ..Default::default() };
    for region in &template.regions {
        let Some(size) = target.page_size(region.page) else {
            // coberto por check_layout quando há referência; sem ela, a região é inválida
            app.warnings.push(Warning::malformed(&region.field_name, Some(region.page), "página inexistente"));
            continue;
        };
        if !region.bbox.is_within(&size) {
            app.warnings.push(Warning::malformed(&region.field_name, Some(region.page), "bbox fora da página"));
            continue;
        }
        let text = target.text_in_rect(region.page, &region.bbox).unwrap_or_default();
        if text.trim().is_empty() {
            app.warnings.push(Warning::EmptyRegion {
                region_id: region.region_id,
                field_name: region.field_name.clone(),
            });
            continue;
        }
        app.entities.push(Entity::from_template(
            template.template_id,
            region.region_id,
            region.field_name.clone(),
            region.entity_type.clone(),
            text,
            region.confidence,
            Location::new(region.page, region.bbox),
        ));
    }

    debug!(
        template = %template.template_id,
        document = %target.id,
        entities = app.entities.len(),
        warnings = app.warnings.len(),
        "template aplicado"
    );
    Ok(app)
}

fn check_layout(template: &Template, target: &Document, tolerance: f64) -> Result<(), TemplateError> {
    let mut pages: Vec<usize> = template.regions.iter().map(|r| r.page).collect();
    pages.sort_unstable();
    pages.dedup();
    for page in pages {
        let Some(expected) = template.reference_pages.get(page).copied() else {
            continue;
        };
        let actual = target.page_size(page);
        if !actual.is_some_and(|a| a.congruent_with(&expected, tolerance)) {
            return Err(TemplateError::LayoutMismatch { page, expected, actual });
        }
    }
    Ok(())
}

/// Aplica o template a vários documentos em paralelo. Um resultado por documento, na ordem.
pub fn apply_template_batch(
    template: &Template,
    targets: &[Document],
    tolerance: f64,
) -> Vec<Result<TemplateApplication, TemplateError>> {
    let results: Vec<_> = targets
        .par_iter()
        .map(|doc| apply_template(template, doc, tolerance))
        .collect();
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(
        template = %template.template_id,
        documents = targets.len(),
        failed,
        "aplicação em lote concluída"
    );
    results
}

/// Repositório de templates, com expiração opcional e persistência em JSON.
pub struct TemplateStore {
    templates: RwLock<HashMap<Uuid, Template>>,
    path: Option<PathBuf>,
}

impl TemplateStore {
    pub fn in_memory() -> Self {
        Self { templates: RwLock::new(HashMap::new()), path: None }
    }

    /// Abre (ou cria) o repositório em `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let path = path.into();
        let mut templates = HashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|source| StoreError::Io { path: path.clone(), source })?;
            let list: Vec<Template> = serde_json::from_str(&raw).map_err(StoreError::from)?;
            templates.extend(list.into_iter().map(|t| (t.template_id, t)));
        }
        info!(templates = templates.len(), path = %path.display(), "templates carregados");
        Ok(Self { templates: RwLock::new(templates), path: Some(path) })
    }

    fn persist(&self, templates: &HashMap<Uuid, Template>) -> Result<(), TemplateError> {
        if let Some(path) = &self.path {
            let mut list: Vec<&Template> = templates.values().collect();
            list.sort_by_key(|t| t.created_at);
            write_json_atomic(path, &list)?;
        }
        Ok(())
    }

    pub fn insert(&self, template: Template) -> Result<Uuid, TemplateError> {
        let mut guard = self.templates.write().map_err(|_| TemplateError::Poisoned)?;
        let id = template.template_id;
        guard.insert(id, template);
        self.persist(&guard)?;
        Ok(id)
    }

    /// Template vigente; expirados contam como inexistentes.
    pub fn get(&self, id: Uuid, now: DateTime<Utc>) -> Result<Template, TemplateError> {
        let guard = self.templates.read().map_err(|_| TemplateError::Poisoned)?;
        match guard.get(&id) {
            Some(t) if t.is_expired(now) => Err(TemplateError::Expired(id)),
            Some(t) => Ok(t.clone()),
            None => Err(TemplateError::NotFound(id)),
        }
    }

    pub fn list(&self, now: DateTime<Utc>) -> Result<Vec<Template>, TemplateError> {
        let guard = self.templates.read().map_err(|_| TemplateError::Poisoned)?;
        let mut out: Vec<Template> = guard.values().filter(|t| !t.is_expired(now)).cloned().collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    pub fn remove(&self, id: Uuid) -> Result<Template, TemplateError> {
        let mut guard = self.templates.write().map_err(|_| TemplateError::Poisoned)?;
        let removed = guard.remove(&id).ok_or(TemplateError::NotFound(id))?;
        self.persist(&guard)?;
        Ok(removed)
    }

    /// Remove os templates expirados. Devolve quantos saíram.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, TemplateError> {
        let mut guard = self.templates.write().map_err(|_| TemplateError::Poisoned)?;
        let before = guard.len();
        guard.retain(|_, t| !t.is_expired(now));
        let purged = before - guard.len();
        if purged > 0 {
            self.persist(&guard)?;
            info!(purged, "templates expirados removidos");
        }
        Ok(purged)
    }

    /// Reedição de região: apaga a antiga e cria uma nova (com novo `region_id`).
    pub fn replace_region(
        &self,
        template_id: Uuid,
        region_id: Uuid,
        mut replacement: TemplateRegion,
    ) -> Result<Uuid, TemplateError> {
        let mut guard = self.templates.write().map_err(|_| TemplateError::Poisoned)?;
        let template = guard.get_mut(&template_id).ok_or(TemplateError::NotFound(template_id))?;
        let pos = template
            .regions
            .iter()
            .position(|r| r.region_id == region_id)
            .ok_or(TemplateError::RegionNotFound(region_id))?;

        if let Some(size) = template.reference_pages.get(replacement.page) {
            if !replacement.bbox.is_within(size) {
                warn!(field = %replacement.field_name, "região reeditada fora da página de referência");
                return Err(TemplateError::MalformedRegion {
                    field_name: replacement.field_name,
                    reason: "bbox fora da página".to_string(),
                });
            }
        }

        template.regions.remove(pos);
        replacement.region_id = Uuid::now_v7();
        let new_id = replacement.region_id;
        template.regions.insert(pos, replacement);
        self.persist(&guard)?;
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORM: &str = "Cognome: Rossi\nNome: Mario\nCodice: RSSMRA80A01H501U";

    fn reference() -> Document {
        Document::from_page_texts(&[(PageSize::a4(), FORM)])
    }

    /// Região que cobre a palavra `word` no documento de referência.
    fn region_for(doc: &Document, word: &str, field: &str, ty: EntityType) -> TemplateRegion {
        let w = doc.pages[0].words.iter().find(|w| w.text == word).unwrap();
        let r = w.rect;
        let bbox = PageRect::new(r.x - 1.0, r.y - 1.0, r.width + 40.0, r.height + 2.0);
        TemplateRegion::new(0, bbox, field, ty, 0.9, "user")
    }

    fn template() -> Template {
        let doc = reference();
        create_template(
            "modulo",
            vec![PageSize::a4()],
            vec![
                region_for(&doc, "Rossi", "cognome", EntityType::PERSON),
                region_for(&doc, "RSSMRA80A01H501U", "codice", EntityType::TAX_ID),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_create_requires_regions() {
        assert!(matches!(
            create_template("vazio", vec![PageSize::a4()], vec![], None),
            Err(TemplateError::NoRegions)
        ));
    }

    #[test]
    fn test_create_rejects_region_off_page() {
        let r = TemplateRegion::new(0, PageRect::new(500.0, 0.0, 200.0, 10.0), "x", EntityType::PERSON, 1.0, "");
        assert!(matches!(
            create_template("t", vec![PageSize::a4()], vec![r], None),
            Err(TemplateError::MalformedRegion { .. })
        ));
    }

    #[test]
    fn test_apply_rereads_target_text() {
        let t = template();
        let target = Document::from_page_texts(&[(
            PageSize::a4(),
            "Cognome: Verdi\nNome: Luigi\nCodice: VRDLGU75B12F205X",
        )]);
        let app = apply_template(&t, &target, 0.01).unwrap();
        assert!(app.warnings.is_empty());
        let texts: Vec<&str> = app.entities.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Verdi", "VRDLGU75B12F205X"]);
        for e in &app.entities {
            assert!(e.accepted);
            assert_eq!(e.score(), 0.9);
            assert_eq!(e.source(), crate::entity::Source::Template);
        }
    }

    #[test]
    fn test_layout_mismatch_fails_loudly() {
        let t = template();
        let letter = PageSize::new(612.0, 792.0).unwrap();
        let target = Document::from_page_texts(&[(letter, FORM)]);
        assert!(matches!(
            apply_template(&t, &target, 0.01),
            Err(TemplateError::LayoutMismatch { page: 0, .. })
        ));
    }

    #[test]
    fn test_empty_region_is_a_warning() {
        let t = template();
        let target = Document::from_page_texts(&[(PageSize::a4(), "Cognome: Verdi")]);
        let app = apply_template(&t, &target, 0.01).unwrap();
        assert_eq!(app.entities.len(), 1);
        assert!(matches!(app.warnings[0], Warning::EmptyRegion { .. }));
    }

    #[test]
    fn test_batch_partial_failure() {
        let t = template();
        let ok = Document::from_page_texts(&[(PageSize::a4(), FORM)]);
        let bad = Document::from_page_texts(&[(PageSize::new(612.0, 792.0).unwrap(), FORM)]);
        let results = apply_template_batch(&t, &[ok.clone(), bad, ok], 0.01);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(TemplateError::LayoutMismatch { .. })));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_store_ttl_and_purge() {
        let store = TemplateStore::in_memory();
        let mut t = template();
        t.expires_at = Some(t.created_at + Duration::minutes(5));
        let id = store.insert(t.clone()).unwrap();
        assert!(store.get(id, t.created_at).is_ok());
        let later = t.created_at + Duration::minutes(10);
        assert!(matches!(store.get(id, later), Err(TemplateError::Expired(_))));
        assert_eq!(store.purge_expired(later).unwrap(), 1);
        assert!(matches!(store.get(id, later), Err(TemplateError::NotFound(_))));
    }

    #[test]
    fn test_store_persistence_and_region_reedit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");
        let t = template();
        let old_region = t.regions[0].region_id;
        {
            let store = TemplateStore::open(&path).unwrap();
            store.insert(t.clone()).unwrap();
            let replacement =
                TemplateRegion::new(0, PageRect::new(70.0, 700.0, 100.0, 20.0), "cognome", EntityType::PERSON, 0.8, "user");
            let new_id = store.replace_region(t.template_id, old_region, replacement).unwrap();
            assert_ne!(new_id, old_region);
        }
        let reopened = TemplateStore::open(&path).unwrap();
        let loaded = reopened.get(t.template_id, Utc::now()).unwrap();
        assert_eq!(loaded.regions.len(), 2);
        assert!(loaded.regions.iter().all(|r| r.region_id != old_region));
        assert_eq!(loaded.regions[0].confidence, 0.8);
    }

    #[test]
    fn test_persisted_region_format() {
        let t = template();
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["regions"][0]["bbox"].as_array().unwrap().len(), 4);
        assert_eq!(json["regions"][0]["field_name"], "cognome");
        assert!(json["expires_at"].is_null());
    }
}
