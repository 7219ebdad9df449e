//! # Sessão de Revisão
//!
//! Uma [`ReviewSession`] é dona do documento e da lista de entidades enquanto o usuário
//! revisa. Tudo o que acontece durante a revisão passa por aqui:
//!
//! ```text
//! detectores ──► ingest() ──► entidades ──► groups() ──► toggle/add/edit/classify
//!                  ▲                                            │
//!   templates ─────┘                                            ▼
//!                                                         export()
//! ```
//!
//! As saídas dos detectores podem chegar em qualquer ordem e a qualquer momento; cada uma é
//! reconciliada contra o que já está na sessão.
//!
//! O limiar de confiança é só um filtro de **visibilidade**: mudá-lo nunca altera
//! `accepted`. A exportação leva as entidades `accepted` **e** visíveis no limiar atual.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::classification::{ClassificationSnapshot, ClassificationState};
use crate::config::ReviewConfig;
use crate::detector::DetectorOutput;
use crate::document::Document;
use crate::entity::{normalize_text, DetectorSource, Entity, EntityId, EntityType, Location};
use crate::error::{RedactError, Result, Warning};
use crate::export::{export, ExportOptions, RedactedExport};
use crate::grouping::{self, EntityGroup};
use crate::reconcile::{apply_policy, Reconciler};
use crate::template::TemplateApplication;

/// Eventos de progresso de uma sessão, enviados à interface em tempo real.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// Um detector começou a rodar
    DetectorStarted { detector: String },
    /// Uma saída de detector foi reconciliada na sessão
    EntitiesIngested {
        detector: String,
        report: IngestReport,
    },
    /// Um detector não respondeu
    DetectorFailed { detector: String, reason: String },
    /// Todos os detectores agendados terminaram
    DetectionDone { total_entities: usize },
    /// Trabalho pendente cancelado (sessão fechada)
    Cancelled,
}

/// Resumo de uma ingestão.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub added: usize,
    pub denied: usize,
    pub duplicates: usize,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone)]
pub struct ReviewSession {
    pub id: Uuid,
    document: Document,
    entities: Vec<Entity>,
    threshold: f64,
    case_insensitive: bool,
    warnings: Vec<Warning>,
}

impl ReviewSession {
    pub fn new(document: Document, config: &ReviewConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            document,
            entities: Vec::new(),
            threshold: config.confidence_threshold.clamp(0.0, 1.0),
            case_insensitive: config.case_insensitive_grouping,
            warnings: Vec::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Todos os avisos acumulados na sessão.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Registra um aviso produzido fora da reconciliação (ex: detector que falhou).
    pub fn record_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Reconcilia a saída de um detector e a incorpora à sessão.
    pub fn ingest(
        &mut self,
        source: DetectorSource,
        output: DetectorOutput,
        snapshot: &ClassificationSnapshot,
    ) -> IngestReport {
        let reconciled = Reconciler::new(snapshot, &self.document).reconcile(source, output, &self.entities);
        let report = IngestReport {
            added: reconciled.entities.len(),
            denied: reconciled.denied,
            duplicates: reconciled.duplicates,
            warnings: reconciled.warnings.clone(),
        };
        self.entities.extend(reconciled.entities);
        self.warnings.extend(reconciled.warnings);
        debug!(session = %self.id, ?source, added = report.added, total = self.entities.len(), "detecções incorporadas");
        report
    }

    /// Incorpora o resultado de um template aplicado a este documento.
    ///
    /// A memória de classificação vale também aqui: termos `never` não entram.
    pub fn ingest_template(&mut self, application: TemplateApplication, snapshot: &ClassificationSnapshot) -> IngestReport {
        let mut report = IngestReport {
            warnings: application.warnings,
            ..Default::default()
        };
        for mut e in application.entities {
            let state = snapshot.state_of(&e.text, &e.entity_type);
            if state == ClassificationState::Never {
                report.denied += 1;
                continue;
            }
            apply_policy(&mut e, state);
            self.entities.push(e);
            report.added += 1;
        }
        self.warnings.extend(report.warnings.iter().cloned());
        report
    }

    /// Entidade declarada pelo usuário (score 1.0). `locations` pode ser vazio.
    pub fn add_manual(&mut self, entity_type: EntityType, text: &str, locations: Vec<Location>) -> EntityId {
        let e = Entity::manual(entity_type, text.trim(), locations);
        let id = e.id;
        info!(session = %self.id, entity = %id, "entidade manual adicionada");
        self.entities.push(e);
        id
    }

    /// Altera texto e/ou tipo; o id é mantido.
    ///
    /// Se a chave `(texto, tipo)` mudar, `needs_review` e `forced` passam a refletir a
    /// classificação da chave nova.
    pub fn edit(
        &mut self,
        id: EntityId,
        text: Option<&str>,
        entity_type: Option<EntityType>,
        snapshot: &ClassificationSnapshot,
    ) -> Result<()> {
        let e = self.entity_mut(id)?;
        let before = (e.text.clone(), e.entity_type.clone());
        if let Some(t) = text {
            e.text = t.trim().to_string();
        }
        if let Some(ty) = entity_type {
            e.entity_type = ty;
        }
        if (&e.text, &e.entity_type) != (&before.0, &before.1) {
            let state = snapshot.state_of(&e.text, &e.entity_type);
            apply_policy(e, state);
        }
        Ok(())
    }

    pub fn remove(&mut self, id: EntityId) -> Result<Entity> {
        let pos = self
            .entities
            .iter()
            .position(|e| e.id == id)
            .ok_or(RedactError::EntityNotFound(id))?;
        Ok(self.entities.remove(pos))
    }

    pub fn toggle_entity(&mut self, id: EntityId, accepted: bool) -> Result<()> {
        self.entity_mut(id)?.accepted = accepted;
        Ok(())
    }

    /// Alterna o grupo `(texto, tipo)` exibido na revisão. Devolve quantas entidades mudaram.
    ///
    /// Só os membros visíveis no limiar atual (os mesmos de [`Self::groups`]) são tocados;
    /// entidades ocultas mantêm `accepted`.
    pub fn toggle_group(&mut self, text: &str, entity_type: &EntityType, accepted: bool) -> usize {
        let visible: Vec<Entity> = self.visible_entities().cloned().collect();
        let groups = grouping::group(&visible, self.case_insensitive);
        match grouping::find_group(&groups, text, entity_type, self.case_insensitive) {
            Some(g) => grouping::toggle_group(&mut self.entities, g, accepted),
            None => 0,
        }
    }

    /// Novo limiar de visibilidade, limitado a `[0, 1]`. `NaN` é ignorado.
    pub fn set_threshold(&mut self, threshold: f64) {
        if !threshold.is_nan() {
            self.threshold = threshold.clamp(0.0, 1.0);
        }
    }

    pub fn set_case_insensitive(&mut self, case_insensitive: bool) {
        self.case_insensitive = case_insensitive;
    }

    pub fn visible_entities(&self) -> impl Iterator<Item = &Entity> {
        let t = self.threshold;
        self.entities.iter().filter(move |e| e.is_visible(t))
    }

    /// Grupos das entidades visíveis, com o estado de aprendizado de cada um.
    pub fn groups(&self, snapshot: &ClassificationSnapshot) -> Vec<EntityGroup> {
        let visible: Vec<Entity> = self.visible_entities().cloned().collect();
        let mut groups = grouping::group(&visible, self.case_insensitive);
        grouping::annotate_learning(&mut groups, snapshot);
        groups
    }

    /// Reflete na sessão uma classificação que o usuário acabou de gravar.
    ///
    /// As entidades permanecem na lista; `never` só desmarca. Devolve quantas mudaram.
    pub fn apply_classification(
        &mut self,
        text: &str,
        entity_type: &EntityType,
        state: ClassificationState,
        case_sensitive: bool,
    ) -> usize {
        let key = normalize_text(text, !case_sensitive);
        let mut touched = 0;
        for e in self
            .entities
            .iter_mut()
            .filter(|e| &e.entity_type == entity_type && normalize_text(&e.text, !case_sensitive) == key)
        {
            apply_policy(e, state);
            touched += 1;
        }
        touched
    }

    /// Entidades que a exportação levaria agora.
    pub fn export_candidates(&self) -> Vec<Entity> {
        self.visible_entities().filter(|e| e.accepted).cloned().collect()
    }

    pub fn export(&self, options: &ExportOptions) -> RedactedExport {
        export(&self.document, &self.export_candidates(), options)
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RedactError::EntityNotFound(id))
    }
}
