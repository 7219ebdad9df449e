//! # Agrupamento e Deduplicação
//!
//! Agrupa as ocorrências pela chave `(texto normalizado, tipo)` para a tela de revisão:
//! "Mario Rossi" encontrado 12 vezes, por dois detectores, vira **um** grupo com 12 membros.
//!
//! - A ordem de primeira aparição é preservada (grupos e `canonical_text`).
//! - `accepted` do grupo é o OU dos membros (só para exibição).
//! - Alternar um grupo **sobrescreve** `accepted` em todos os membros.
//! - Entidades sem posição (manuais) agrupam só por texto + tipo, junto com as detectadas.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::classification::{ClassificationSnapshot, ClassificationState};
use crate::entity::{normalize_text, Entity, EntityId, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityGroup {
    /// Texto normalizado usado como chave
    pub key: String,
    pub canonical_text: String,
    /// Formas literais que caem na mesma chave, em ordem de aparição
    pub variations: Vec<String>,
    pub entity_type: EntityType,
    pub member_ids: Vec<EntityId>,
    pub average_score: f64,
    pub accepted: bool,
    /// Algum membro precisa de revisão (`flag`)
    pub needs_review: bool,
    pub learning_status: Option<ClassificationState>,
}

impl EntityGroup {
    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.member_ids.contains(id)
    }
}

/// Agrupa as entidades. Função pura.
pub fn group(entities: &[Entity], case_insensitive: bool) -> Vec<EntityGroup> {
    let mut index: HashMap<(String, EntityType), usize> = HashMap::new();
    let mut groups: Vec<EntityGroup> = Vec::new();
    let mut score_sums: Vec<f64> = Vec::new();

    for e in entities {
        let key = (normalize_text(&e.text, case_insensitive), e.entity_type.clone());
        let idx = *index.entry(key.clone()).or_insert_with(|| {
            groups.push(EntityGroup {
                key: key.0.clone(),
                canonical_text: e.text.clone(),
                variations: Vec::new(),
                entity_type: key.1.clone(),
                member_ids: Vec::new(),
                average_score: 0.0,
                accepted: false,
                needs_review: false,
                learning_status: None,
            });
            score_sums.push(0.0);
            groups.len() - 1
        });

        let g = &mut groups[idx];
        if !g.variations.contains(&e.text) {
            g.variations.push(e.text.clone());
        }
        g.member_ids.push(e.id);
        g.accepted |= e.accepted;
        g.needs_review |= e.needs_review;
        score_sums[idx] += e.score();
    }

    for (g, sum) in groups.iter_mut().zip(score_sums) {
        g.average_score = sum / g.member_ids.len() as f64;
    }
    groups
}

/// Desfaz o agrupamento: os membros de cada grupo, na ordem dos grupos.
///
/// Ids que não estão em `entities` são ignorados.
pub fn group_back_to_entities(groups: &[EntityGroup], entities: &[Entity]) -> Vec<Entity> {
    let by_id: HashMap<EntityId, &Entity> = entities.iter().map(|e| (e.id, e)).collect();
    groups
        .iter()
        .flat_map(|g| g.member_ids.iter())
        .filter_map(|id| by_id.get(id).map(|e| (*e).clone()))
        .collect()
}

/// Define `accepted` em **todos** os membros do grupo. Devolve quantos foram tocados.
pub fn toggle_group(entities: &mut [Entity], group: &EntityGroup, accepted: bool) -> usize {
    let mut touched = 0;
    for e in entities.iter_mut().filter(|e| group.contains(&e.id)) {
        e.accepted = accepted;
        touched += 1;
    }
    touched
}

/// Preenche `learning_status` com o estado vigente na memória de classificação.
pub fn annotate_learning(groups: &mut [EntityGroup], snapshot: &ClassificationSnapshot) {
    for g in groups {
        g.learning_status = snapshot.lookup(&g.canonical_text, &g.entity_type).map(|r| r.state);
    }
}

/// Procura o grupo de uma chave `(texto, tipo)` já normalizada conforme `case_insensitive`.
pub fn find_group<'a>(
    groups: &'a [EntityGroup],
    text: &str,
    entity_type: &EntityType,
    case_insensitive: bool,
) -> Option<&'a EntityGroup> {
    let key = normalize_text(text, case_insensitive);
    groups.iter().find(|g| g.key == key && &g.entity_type == entity_type)
}
