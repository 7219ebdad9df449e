//! # Exportação
//!
//! Recebe o documento de origem e as entidades aceitas e produz:
//!
//! 1. uma cópia redigida do documento: caixas opacas ([`RedactionMark`]) sobre cada
//!    localização, e as palavras cobertas **removidas** (nada de texto residual sob a caixa);
//! 2. a tabela de mapeamento `original_text, entity_type, placeholder_label`, uma linha por
//!    literal distinto;
//! 3. opcionalmente, o texto plano com as substituições aplicadas em linha.
//!
//! No estilo `placeholder`, cada literal distinto recebe um rótulo por tipo: `PERSON_A`,
//! `PERSON_B`, ..., `PERSON_Z`, `PERSON_AA`. O mesmo literal (mesmo tipo) recebe sempre o
//! mesmo rótulo dentro de uma exportação.
//!
//! Entidades sem posição (adicionadas à mão, por exemplo) são redigidas em todas as
//! ocorrências exatas do literal; se não houver nenhuma, ficam fora do mapeamento com
//! [`Warning::ExportTextNotFound`].
//!
//! Uma localização numa página inexistente é pulada com
//! [`Warning::ExportLocationOutOfRange`]; a exportação nunca aborta.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::document::{Document, RedactionMark};
use crate::entity::{Entity, EntityType, Location, TextSpan};
use crate::error::Warning;

/// Preenchimento ASCII usado no texto do documento redigido; preserva os offsets em bytes.
const FILL: &str = "#";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStyle {
    #[default]
    SolidBlack,
    Placeholder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default)]
    pub style: ExportStyle,
    /// Gera também o texto plano com substituições
    #[serde(default)]
    pub include_text: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRow {
    pub original_text: String,
    pub entity_type: EntityType,
    pub placeholder_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedExport {
    pub document: Document,
    pub mapping: Vec<MappingRow>,
    pub text: Option<String>,
    pub warnings: Vec<Warning>,
    /// Localizações efetivamente redigidas
    pub redacted_locations: usize,
}

/// Rótulos por tipo: o n-ésimo literal distinto de um tipo recebe a n-ésima sequência de letras.
#[derive(Debug, Default)]
struct PlaceholderLabels {
    counters: HashMap<EntityType, usize>,
    assigned: HashMap<(EntityType, String), String>,
}

impl PlaceholderLabels {
    /// Devolve o rótulo e se ele acabou de ser criado.
    fn assign(&mut self, entity_type: &EntityType, literal: &str) -> (String, bool) {
        let key = (entity_type.clone(), literal.trim().to_string());
        if let Some(label) = self.assigned.get(&key) {
            return (label.clone(), false);
        }
        let n = self.counters.entry(entity_type.clone()).or_insert(0);
        let label = format!("{}_{}", entity_type, letters(*n));
        *n += 1;
        self.assigned.insert(key, label.clone());
        (label, true)
    }
}

/// 0 -> A, 25 -> Z, 26 -> AA, 27 -> AB, ...
fn letters(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(char::from(b'A' + (n % 26) as u8));
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.iter().rev().collect()
}

/// Localizações de todas as ocorrências exatas de um literal sem posição.
fn locate_literal(source: &Document, text: &str) -> Vec<Location> {
    source
        .find_occurrences(text, true)
        .into_iter()
        .flat_map(|span| source.locate_span(span))
        .collect()
}

/// Exporta as entidades com `accepted = true`. Os demais filtros (limiar, tipos) são
/// responsabilidade de quem chama.
pub fn export(source: &Document, entities: &[Entity], options: &ExportOptions) -> RedactedExport {
    let mut labels = PlaceholderLabels::default();
    let mut doc = source.clone();
    doc.id = Uuid::now_v7();
    let page_count = doc.page_count();

    let mut mapping = Vec::new();
    let mut warnings = Vec::new();
    let mut removed: Vec<TextSpan> = Vec::new();
    let mut substitutions: Vec<(TextSpan, String)> = Vec::new();
    let mut redacted_locations = 0;

    for e in entities.iter().filter(|e| e.accepted) {
        let locations = if e.locations.is_empty() {
            locate_literal(source, &e.text)
        } else {
            e.locations.clone()
        };
        if locations.is_empty() {
            warn!(entity = %e.id, text = %e.text, "entidade sem posição e sem ocorrência no documento");
            warnings.push(Warning::ExportTextNotFound {
                entity_id: e.id,
                text: e.text.clone(),
            });
            continue;
        }

        let (label, is_new) = labels.assign(&e.entity_type, &e.text);
        let mark_label = match options.style {
            ExportStyle::Placeholder => Some(label),
            ExportStyle::SolidBlack => None,
        };
        if is_new {
            mapping.push(MappingRow {
                original_text: e.text.trim().to_string(),
                entity_type: e.entity_type.clone(),
                placeholder_label: mark_label.clone(),
            });
        }

        for loc in &locations {
            let Some(page) = doc.pages.get_mut(loc.page) else {
                warn!(entity = %e.id, page = loc.page, page_count, "localização fora do documento");
                warnings.push(Warning::ExportLocationOutOfRange {
                    entity_id: e.id,
                    page: loc.page,
                    page_count,
                });
                continue;
            };
            page.words.retain(|w| {
                let covered = loc.rect.contains_point(w.rect.center());
                if covered {
                    removed.push(w.span);
                }
                !covered
            });
            doc.redactions.push(RedactionMark {
                page: loc.page,
                rect: loc.rect,
                label: mark_label.clone(),
            });
            redacted_locations += 1;
        }

        if options.include_text {
            let display = mark_label.clone().unwrap_or_else(|| format!("[{}]", e.entity_type));
            match e.span() {
                Some(span) => substitutions.push((span, display)),
                None => substitutions.extend(
                    source
                        .find_occurrences(&e.text, true)
                        .into_iter()
                        .map(|span| (span, display.clone())),
                ),
            }
        }
    }

    doc.text = splice(
        &source.text,
        removed.into_iter().map(|s| (s, FILL.repeat(s.end - s.start))).collect(),
    );
    let text = options.include_text.then(|| splice(&source.text, substitutions));

    info!(
        document = %source.id,
        style = ?options.style,
        redacted_locations,
        literals = mapping.len(),
        warnings = warnings.len(),
        "exportação concluída"
    );

    RedactedExport {
        document: doc,
        mapping,
        text,
        warnings,
        redacted_locations,
    }
}

/// Aplica substituições em `text`. Em caso de sobreposição vence a que começa primeiro
/// (e, no empate, a mais longa); intervalos inválidos são ignorados.
fn splice(text: &str, mut edits: Vec<(TextSpan, String)>) -> String {
    edits.sort_by(|a, b| a.0.start.cmp(&b.0.start).then(b.0.end.cmp(&a.0.end)));
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, replacement) in edits {
        if span.start < cursor || text.get(span.start..span.end).is_none() {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        out.push_str(&replacement);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Tabela de mapeamento em CSV (RFC 4180), com cabeçalho.
pub fn mapping_to_csv(rows: &[MappingRow]) -> String {
    let mut out = String::from("original_text,entity_type,placeholder_label\n");
    for r in rows {
        out.push_str(&csv_field(&r.original_text));
        out.push(',');
        out.push_str(&csv_field(r.entity_type.as_str()));
        out.push(',');
        out.push_str(&csv_field(r.placeholder_label.as_deref().unwrap_or("")));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DetectorSource;
    use crate::geometry::{PageRect, PageSize};

    fn doc() -> Document {
        Document::from_page_texts(&[
            (PageSize::a4(), "Il sig. Mario Rossi e Luigi Verdi\nemail mario@example.it"),
            (PageSize::a4(), "Firmato: Mario Rossi"),
        ])
    }

    fn detected(doc: &Document, text: &str, nth: usize, ty: EntityType) -> Entity {
        let start = doc.text.match_indices(text).nth(nth).unwrap().0;
        let span = TextSpan::new(start, start + text.len());
        Entity::detected(DetectorSource::Local, ty, text, 0.9, Some(span), doc.locate_span(span))
    }

    #[test]
    fn test_letters() {
        assert_eq!(letters(0), "A");
        assert_eq!(letters(25), "Z");
        assert_eq!(letters(26), "AA");
        assert_eq!(letters(27), "AB");
        assert_eq!(letters(26 * 27), "AAA");
    }

    #[test]
    fn test_export_completeness_with_bad_location() {
        let d = doc();
        let mut locations: Vec<Location> = d.pages[0]
            .words
            .iter()
            .take(4)
            .map(|w| Location::new(0, w.rect))
            .collect();
        locations.push(Location::new(7, PageRect::new(10.0, 10.0, 10.0, 10.0)));
        let e = Entity::manual(EntityType::MANUAL, "misc", locations);

        let out = export(&d, &[e], &ExportOptions::default());
        assert_eq!(out.redacted_locations, 4);
        assert_eq!(out.document.redactions.len(), 4);
        assert_eq!(out.warnings.len(), 1);
        assert!(matches!(
            out.warnings[0],
            Warning::ExportLocationOutOfRange { page: 7, page_count: 2, .. }
        ));
    }

    #[test]
    fn test_placeholder_labels_per_literal() {
        let d = doc();
        let entities = vec![
            detected(&d, "Mario Rossi", 0, EntityType::PERSON),
            detected(&d, "Luigi Verdi", 0, EntityType::PERSON),
            detected(&d, "Mario Rossi", 1, EntityType::PERSON),
            detected(&d, "mario@example.it", 0, EntityType::EMAIL),
        ];
        let opts = ExportOptions { style: ExportStyle::Placeholder, include_text: true };
        let out = export(&d, &entities, &opts);

        let labels: Vec<_> = out.document.redactions.iter().map(|m| m.label.clone().unwrap()).collect();
        assert_eq!(labels, vec!["PERSON_A", "PERSON_B", "PERSON_A", "EMAIL_A"]);
        assert_eq!(out.mapping.len(), 3);
        assert_eq!(out.mapping[0].original_text, "Mario Rossi");
        assert_eq!(out.mapping[0].placeholder_label.as_deref(), Some("PERSON_A"));
        assert_eq!(
            out.text.as_deref(),
            Some("Il sig. PERSON_A e PERSON_B\nemail EMAIL_A\nFirmato: PERSON_A")
        );
    }

    #[test]
    fn test_solid_black_leaves_no_residual_text() {
        let d = doc();
        let entities = vec![detected(&d, "Mario Rossi", 0, EntityType::PERSON)];
        let out = export(&d, &entities, &ExportOptions::default());

        assert!(out.document.redactions.iter().all(|m| m.label.is_none()));
        assert!(out.mapping[0].placeholder_label.is_none());
        assert!(out.text.is_none());
        assert!(!out.document.pages[0].words.iter().any(|w| w.text == "Rossi"));
        // segunda ocorrência não estava nas localizações
        assert_eq!(out.document.text.matches("Rossi").count(), 1);
        assert_eq!(out.document.text.len(), d.text.len());
        for w in &out.document.pages[1].words {
            assert_eq!(out.document.slice(w.span), Some(w.text.as_str()));
        }
    }

    #[test]
    fn test_spanless_entity_substituted_by_literal() {
        let d = doc();
        let manual = Entity::manual(EntityType::PERSON, "Mario Rossi", vec![]);
        let opts = ExportOptions { style: ExportStyle::SolidBlack, include_text: true };
        let out = export(&d, &[manual], &opts);
        let text = out.text.unwrap();
        assert_eq!(text.matches("[PERSON]").count(), 2);
        assert!(!text.contains("Rossi"));
    }

    #[test]
    fn test_spanless_entity_is_redacted_in_document() {
        let d = Document::from_page_texts(&[(PageSize::a4(), "Firma di Luigi Verdi")]);
        let manual = Entity::manual(EntityType::PERSON, "Luigi Verdi", vec![]);
        let out = export(&d, &[manual], &ExportOptions::default());

        assert_eq!(out.mapping.len(), 1);
        assert_eq!(out.redacted_locations, 1);
        assert_eq!(out.document.redactions.len(), 1);
        assert!(!out.document.text.contains("Luigi"));
        assert!(!out.document.text.contains("Verdi"));
        assert!(out.document.text.starts_with("Firma di "));
        assert!(out.document.pages[0].words.iter().all(|w| w.text != "Verdi"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_spanless_entity_not_in_document_is_reported() {
        let d = doc();
        let manual = Entity::manual(EntityType::PERSON, "Anna Bianchi", vec![]);
        let out = export(&d, &[manual], &ExportOptions::default());

        assert!(out.mapping.is_empty());
        assert_eq!(out.redacted_locations, 0);
        assert_eq!(out.document.text, d.text);
        assert!(matches!(&out.warnings[..], [Warning::ExportTextNotFound { text, .. }] if text == "Anna Bianchi"));
    }

    #[test]
    fn test_rejected_entities_are_not_exported() {
        let d = doc();
        let mut e = detected(&d, "Luigi Verdi", 0, EntityType::PERSON);
        e.accepted = false;
        let out = export(&d, &[e], &ExportOptions::default());
        assert_eq!(out.redacted_locations, 0);
        assert!(out.mapping.is_empty());
    }

    #[test]
    fn test_mapping_csv_quoting() {
        let rows = vec![
            MappingRow {
                original_text: "Rossi, Mario".into(),
                entity_type: EntityType::PERSON,
                placeholder_label: Some("PERSON_A".into()),
            },
            MappingRow {
                original_text: "say \"hi\"".into(),
                entity_type: EntityType::MANUAL,
                placeholder_label: None,
            },
        ];
        assert_eq!(
            mapping_to_csv(&rows),
            "original_text,entity_type,placeholder_label\n\
             \"Rossi, Mario\",PERSON,PERSON_A\n\
             \"say \"\"hi\"\"\",MANUAL,\n"
        );
    }
}
