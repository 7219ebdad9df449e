//! # Motor de Reconciliação
//!
//! Transforma a saída crua dos detectores em entidades da sessão, aplicando a política
//! da memória de classificação:
//!
//! | Estado     | Efeito                                                          |
//! |------------|-----------------------------------------------------------------|
//! | `never`    | detecção descartada, nunca chega ao usuário                     |
//! | `always`   | `accepted = true`, visível com qualquer limiar                  |
//! | `flag`     | como `always`, e `needs_review = true`                          |
//! | `neutral`  | `accepted = true`; o limiar de confiança decide só a visibilidade|
//!
//! Reconciliar é aplicar política, não deduplicar: detecções de fontes diferentes sobre o
//! mesmo trecho viram entidades distintas (o agrupamento cuida da visualização). Só a
//! mesma detecção repetida pela **mesma** fonte é descartada.
//!
//! As saídas podem chegar em qualquer ordem e a qualquer momento: cada chamada de
//! [`Reconciler::reconcile`] recebe as entidades já existentes e devolve apenas as novas.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::classification::{ClassificationSnapshot, ClassificationState};
use crate::detector::{Detector, DetectorConfig, DetectorOutput, RawDetection, RawLocation};
use crate::document::Document;
use crate::entity::{DetectorSource, Entity, EntityOrigin, Location};
use crate::error::{RedactError, Warning};
use crate::geometry::normalized_to_page;

/// Resultado de uma rodada de reconciliação.
#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub entities: Vec<Entity>,
    pub warnings: Vec<Warning>,
    /// Detecções descartadas por `never`
    pub denied: usize,
    /// Detecções repetidas da mesma fonte
    pub duplicates: usize,
}

impl Reconciled {
    fn absorb(&mut self, other: Reconciled) {
        self.entities.extend(other.entities);
        self.warnings.extend(other.warnings);
        self.denied += other.denied;
        self.duplicates += other.duplicates;
    }
}

pub struct Reconciler<'a> {
    snapshot: &'a ClassificationSnapshot,
    document: &'a Document,
}

impl<'a> Reconciler<'a> {
    pub fn new(snapshot: &'a ClassificationSnapshot, document: &'a Document) -> Self {
        Self { snapshot, document }
    }

    /// Reconcilia a saída de um detector contra as entidades já presentes na sessão.
    pub fn reconcile(&self, source: DetectorSource, output: DetectorOutput, existing: &[Entity]) -> Reconciled {
        let mut result = Reconciled {
            warnings: output.warnings,
            ..Default::default()
        };

        for raw in output.entities {
            let state = self.snapshot.state_of(&raw.text, &raw.entity_type);
            if state == ClassificationState::Never {
                debug!(text = %raw.text, entity_type = %raw.entity_type, "detecção descartada (never)");
                result.denied += 1;
                continue;
            }

            let locations = match self.resolve_locations(&raw) {
                Ok(locs) => locs,
                Err(w) => {
                    warn!(%w, "detecção com geometria inválida");
                    result.warnings.push(w);
                    continue;
                }
            };

            let mut entity = Entity::detected(
                source,
                raw.entity_type.clone(),
                raw.text.trim(),
                raw.score,
                raw.span(),
                locations,
            );
            apply_policy(&mut entity, state);

            let duplicate = existing
                .iter()
                .chain(result.entities.iter())
                .any(|e| is_same_detection(e, &entity));
            if duplicate {
                result.duplicates += 1;
                continue;
            }
            result.entities.push(entity);
        }

        debug!(
            ?source,
            added = result.entities.len(),
            denied = result.denied,
            duplicates = result.duplicates,
            warnings = result.warnings.len(),
            "reconciliação concluída"
        );
        result
    }

    /// Converte as localizações para espaço de página, ou deriva-as do span.
    fn resolve_locations(&self, raw: &RawDetection) -> Result<Vec<Location>, Warning> {
        if let Some(raw_locs) = &raw.locations {
            return raw_locs.iter().map(|l| self.resolve_one(raw, l)).collect();
        }
        match raw.span() {
            Some(span) => {
                if self.document.slice(span).is_none() {
                    return Err(Warning::malformed(
                        &raw.text,
                        None,
                        format!("span {}..{} fora do texto", span.start, span.end),
                    ));
                }
                Ok(self.document.locate_span(span))
            }
            None => Ok(Vec::new()),
        }
    }

    fn resolve_one(&self, raw: &RawDetection, loc: &RawLocation) -> Result<Location, Warning> {
        let page = match loc {
            RawLocation::Page { page, .. } | RawLocation::Normalized { page, .. } => *page,
        };
        let Some(size) = self.document.page_size(page) else {
            return Err(Warning::malformed(&raw.text, Some(page), "dimensões da página desconhecidas"));
        };
        let rect = match loc {
            RawLocation::Page { rect, .. } => *rect,
            RawLocation::Normalized { bbox, .. } => {
                normalized_to_page(*bbox, size).map_err(|e| Warning::malformed(&raw.text, Some(page), e))?
            }
        };
        if !rect.is_within(&size) {
            return Err(Warning::malformed(&raw.text, Some(page), "retângulo fora da página"));
        }
        Ok(Location::new(page, rect))
    }
}

/// Efeito da classificação sobre uma entidade recém-criada (ou já existente).
pub fn apply_policy(entity: &mut Entity, state: ClassificationState) {
    let forced_now = matches!(state, ClassificationState::Always | ClassificationState::Flag);
    match state {
        ClassificationState::Always => {
            entity.accepted = true;
            entity.needs_review = false;
        }
        ClassificationState::Flag => {
            entity.accepted = true;
            entity.needs_review = true;
        }
        ClassificationState::Never => {
            entity.accepted = false;
            entity.needs_review = false;
        }
        ClassificationState::Neutral => {
            entity.needs_review = false;
        }
    }
    if let EntityOrigin::Detected { forced, .. } = &mut entity.origin {
        *forced = forced_now;
    }
}

/// Mesma fonte, mesmo texto/tipo e mesma posição (span, ou localizações quando não há span).
fn is_same_detection(a: &Entity, b: &Entity) -> bool {
    if a.source() != b.source() || a.entity_type != b.entity_type || a.text != b.text {
        return false;
    }
    match (a.span(), b.span()) {
        (Some(x), Some(y)) => x == y,
        (None, None) => a.locations == b.locations,
        _ => false,
    }
}

/// Saída de um detector que respondeu.
pub struct DetectorRun {
    pub name: String,
    pub source: DetectorSource,
    pub output: DetectorOutput,
}

/// Executa os detectores em paralelo.
///
/// Falhas individuais viram `DetectorUnavailable`; só é erro quando nenhum respondeu.
pub fn run_detectors(
    detectors: &[Arc<dyn Detector>],
    document: &Document,
    config: &DetectorConfig,
) -> Result<(Vec<DetectorRun>, Vec<Warning>), RedactError> {
    let results: Vec<_> = detectors
        .par_iter()
        .map(|d| (d.name().to_string(), d.source(), d.detect(document, config)))
        .collect();

    let mut runs = Vec::new();
    let mut warnings = Vec::new();
    for (name, source, res) in results {
        match res {
            Ok(output) => runs.push(DetectorRun { name, source, output }),
            Err(e) => {
                warn!(detector = %name, error = %e, "detector falhou");
                warnings.push(Warning::DetectorUnavailable { detector: name, reason: e.to_string() });
            }
        }
    }
    if runs.is_empty() {
        return Err(RedactError::NoDetectors);
    }
    Ok((runs, warnings))
}

/// Atalho síncrono: roda todos os detectores e reconcilia tudo de uma vez.
pub fn detect_and_reconcile(
    detectors: &[Arc<dyn Detector>],
    document: &Document,
    config: &DetectorConfig,
    snapshot: &ClassificationSnapshot,
) -> Result<Reconciled, RedactError> {
    let (runs, warnings) = run_detectors(detectors, document, config)?;
    let reconciler = Reconciler::new(snapshot, document);
    let mut all = Reconciled { warnings, ..Default::default() };
    for run in runs {
        let part = reconciler.reconcile(run.source, run.output, &all.entities);
        all.absorb(part);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::ClassificationStore;
    use crate::detector::{DetectorError, PatternDetector};
    use crate::entity::{EntityType, TextSpan};
    use crate::geometry::{NormRect, PageRect, PageSize};

    fn doc() -> Document {
        Document::from_page_texts(&[(
            PageSize::a4(),
            "Il Giudice Mario Rossi ha ricevuto mario.rossi@example.it",
        )])
    }

    fn span_of(d: &Document, needle: &str) -> TextSpan {
        let start = d.text.find(needle).unwrap();
        TextSpan::new(start, start + needle.len())
    }

    fn output(items: Vec<RawDetection>) -> DetectorOutput {
        DetectorOutput { entities: items, warnings: vec![] }
    }

    #[test]
    fn test_deny_drops_regardless_of_score() {
        let store = ClassificationStore::in_memory();
        store.classify("Giudice", &EntityType::PERSON, ClassificationState::Never, false).unwrap();
        let d = doc();
        let snap = store.snapshot().unwrap();
        let raw = RawDetection::from_span("Giudice", EntityType::PERSON, 0.99, span_of(&d, "Giudice"));
        let res = Reconciler::new(&snap, &d).reconcile(DetectorSource::Local, output(vec![raw]), &[]);
        assert!(res.entities.is_empty());
        assert_eq!(res.denied, 1);
    }

    #[test]
    fn test_always_forces_acceptance_below_threshold() {
        let store = ClassificationStore::in_memory();
        store.classify("mario rossi", &EntityType::PERSON, ClassificationState::Always, false).unwrap();
        let d = doc();
        let snap = store.snapshot().unwrap();
        let raw = RawDetection::from_span("Mario Rossi", EntityType::PERSON, 0.1, span_of(&d, "Mario Rossi"));
        let res = Reconciler::new(&snap, &d).reconcile(DetectorSource::Local, output(vec![raw]), &[]);
        let e = &res.entities[0];
        assert!(e.accepted);
        assert!(e.is_visible(0.8));
        assert!(!e.needs_review);
        assert_eq!(e.locations.len(), 1);
    }

    #[test]
    fn test_flag_forces_and_marks_review() {
        let store = ClassificationStore::in_memory();
        store.classify("Mario Rossi", &EntityType::PERSON, ClassificationState::Flag, false).unwrap();
        let d = doc();
        let snap = store.snapshot().unwrap();
        let raw = RawDetection::from_span("Mario Rossi", EntityType::PERSON, 0.2, span_of(&d, "Mario Rossi"));
        let res = Reconciler::new(&snap, &d).reconcile(DetectorSource::Cloud, output(vec![raw]), &[]);
        assert!(res.entities[0].accepted);
        assert!(res.entities[0].needs_review);
    }

    #[test]
    fn test_cross_source_duplicates_are_kept() {
        let d = doc();
        let snap = ClassificationSnapshot::default();
        let r = Reconciler::new(&snap, &d);
        let span = span_of(&d, "Mario Rossi");
        let local = r.reconcile(
            DetectorSource::Local,
            output(vec![RawDetection::from_span("Mario Rossi", EntityType::PERSON, 0.9, span)]),
            &[],
        );
        let cloud = r.reconcile(
            DetectorSource::Cloud,
            output(vec![RawDetection::from_span("Mario Rossi", EntityType::PERSON, 0.7, span)]),
            &local.entities,
        );
        let again = r.reconcile(
            DetectorSource::Local,
            output(vec![RawDetection::from_span("Mario Rossi", EntityType::PERSON, 0.9, span)]),
            &local.entities,
        );
        assert_eq!(cloud.entities.len(), 1);
        assert_ne!(cloud.entities[0].id, local.entities[0].id);
        assert!(again.entities.is_empty());
        assert_eq!(again.duplicates, 1);
    }

    #[test]
    fn test_normalized_locations_and_missing_page() {
        let d = doc();
        let snap = ClassificationSnapshot::default();
        let good = RawDetection {
            text: "Mario Rossi".into(),
            entity_type: EntityType::PERSON,
            score: 0.9,
            start: None,
            end: None,
            locations: Some(vec![RawLocation::Normalized {
                page: 0,
                bbox: NormRect { x_min: 100.0, y_min: 100.0, x_max: 300.0, y_max: 120.0 },
            }]),
        };
        let mut missing_page = good.clone();
        missing_page.locations = Some(vec![RawLocation::Normalized {
            page: 3,
            bbox: NormRect { x_min: 0.0, y_min: 0.0, x_max: 10.0, y_max: 10.0 },
        }]);
        let mut off_page = good.clone();
        off_page.locations = Some(vec![RawLocation::Page { page: 0, rect: PageRect::new(500.0, 10.0, 400.0, 10.0) }]);

        let res = Reconciler::new(&snap, &d).reconcile(
            DetectorSource::Cloud,
            output(vec![missing_page, good, off_page]),
            &[],
        );
        assert_eq!(res.entities.len(), 1);
        assert_eq!(res.warnings.len(), 2);
        assert!(res.warnings.iter().all(|w| matches!(w, Warning::MalformedGeometry { .. })));
        let rect = res.entities[0].locations[0].rect;
        assert!((rect.top() - (842.0 - 84.2)).abs() < 1e-6);
    }

    #[test]
    fn test_span_out_of_text_is_malformed() {
        let d = doc();
        let snap = ClassificationSnapshot::default();
        let raw = RawDetection::from_span("x", EntityType::PERSON, 0.9, TextSpan::new(9_000, 9_001));
        let res = Reconciler::new(&snap, &d).reconcile(DetectorSource::Local, output(vec![raw]), &[]);
        assert!(res.entities.is_empty());
        assert_eq!(res.warnings.len(), 1);
    }

    struct Down;

    impl Detector for Down {
        fn name(&self) -> &str {
            "down"
        }
        fn source(&self) -> DetectorSource {
            DetectorSource::Cloud
        }
        fn detect(&self, _: &Document, _: &DetectorConfig) -> Result<DetectorOutput, DetectorError> {
            Err(DetectorError::Unavailable("503".into()))
        }
    }

    #[test]
    fn test_unavailable_detector_is_a_warning() {
        let d = doc();
        let snap = ClassificationSnapshot::default();
        let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(PatternDetector::default()), Arc::new(Down)];
        let res = detect_and_reconcile(&detectors, &d, &DetectorConfig::default(), &snap).unwrap();
        assert!(res.entities.iter().any(|e| e.entity_type == EntityType::EMAIL));
        assert!(res
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::DetectorUnavailable { detector, .. } if detector == "down")));
    }

    #[test]
    fn test_no_detectors_is_an_error() {
        let d = doc();
        let detectors: Vec<Arc<dyn Detector>> = vec![Arc::new(Down)];
        assert!(matches!(
            run_detectors(&detectors, &d, &DetectorConfig::default()),
            Err(RedactError::NoDetectors)
        ));
        assert!(matches!(
            run_detectors(&[], &d, &DetectorConfig::default()),
            Err(RedactError::NoDetectors)
        ));
    }
}
