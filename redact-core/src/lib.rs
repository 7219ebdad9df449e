//! # redact-core — Redação de Dados Pessoais em Documentos
//!
//! Núcleo do sistema de redação: recebe detecções de dados pessoais (PII) vindas de
//! detectores heterogêneos, reconcilia tudo numa lista única de entidades, deixa o usuário
//! revisar e ensinar o sistema, e exporta uma cópia redigida com tabela de mapeamento.
//!
//! ## Fluxo
//!
//! 1.  **Detecção** ([`detector`]): detectores locais (regex, termos aprendidos) e de visão
//!     na nuvem produzem [`RawDetection`]s em qualquer espaço de coordenadas.
//! 2.  **Reconciliação** ([`reconcile`]): cada detecção vira uma [`Entity`] com id estável,
//!     geometria em espaço de página e a política da memória de classificação aplicada.
//! 3.  **Agrupamento** ([`grouping`]): ocorrências do mesmo `(texto, tipo)` viram um grupo.
//! 4.  **Revisão** ([`session`]): alternar, adicionar, editar, classificar, ajustar limiar.
//! 5.  **Exportação** ([`export`]): caixas opacas ou rótulos (`PERSON_A`) + mapeamento.
//!
//! Os [`template`]s são uma entrada alternativa: regiões fixas relidas num documento de
//! layout idêntico, sem detecção.
//!
//! ## Espaços de coordenadas
//!
//! | Espaço        | Origem              | Unidade          | Tipo            |
//! |---------------|---------------------|------------------|-----------------|
//! | Normalizado   | topo-esquerda       | `[0,1000]`       | [`NormRect`]    |
//! | Página        | **base-esquerda**   | pontos           | [`PageRect`]    |
//! | Renderização  | topo-esquerda       | pixels (× zoom)  | [`RenderRect`]  |
//!
//! Entidades só guardam [`PageRect`]. Ver [`geometry`].
//!
//! ## Exemplo de Uso
//!
//! ```rust
//! use redact_core::{
//!     ClassificationStore, Detector, DetectorConfig, DetectorSource, Document, ExportOptions,
//!     ExportStyle, PageSize, PatternDetector, ReviewConfig, ReviewSession,
//! };
//!
//! let doc = Document::from_page_texts(&[(PageSize::a4(), "Scrivere a mario.rossi@example.it")]);
//! let store = ClassificationStore::in_memory();
//! let mut session = ReviewSession::new(doc, &ReviewConfig::default());
//!
//! let output = PatternDetector::default().detect(session.document(), &DetectorConfig::default())?;
//! session.ingest(DetectorSource::Local, output, &*store.snapshot()?);
//!
//! let result = session.export(&ExportOptions { style: ExportStyle::Placeholder, include_text: true });
//! assert_eq!(result.text.as_deref(), Some("Scrivere a EMAIL_A"));
//! assert_eq!(result.mapping[0].placeholder_label.as_deref(), Some("EMAIL_A"));
//! # Ok::<(), redact_core::RedactError>(())
//! ```

pub mod classification;
pub mod config;
pub mod detector;
pub mod document;
pub mod entity;
pub mod error;
pub mod export;
pub mod geometry;
pub mod grouping;
pub mod reconcile;
pub mod session;
pub mod template;

pub use classification::{
    ClassificationBackend, ClassificationSnapshot, ClassificationState, ClassificationStore,
    JsonFileBackend, MemoryBackend, PersistedClassifications, StoreError,
};
pub use config::{ConfigError, RedactConfig, ReviewConfig};
pub use detector::{
    CloudDetector, Detector, DetectorConfig, DetectorError, DetectorOutput, LearnedTermDetector,
    PatternDetector, RawDetection, RawLocation, VisionClient, VisionResponse,
};
pub use document::{Document, Page, RedactionMark, Word};
pub use entity::{DetectorSource, Entity, EntityId, EntityOrigin, EntityType, Location, Source, TextSpan};
pub use error::{RedactError, Result, Warning};
pub use export::{export, mapping_to_csv, ExportOptions, ExportStyle, MappingRow, RedactedExport};
pub use geometry::{
    normalized_to_page, page_to_render, render_rect_to_page, render_to_page, GeometryError, NormRect,
    PagePoint, PageRect, PageSize, RenderPoint, RenderRect, Zoom,
};
pub use grouping::EntityGroup;
pub use reconcile::{detect_and_reconcile, run_detectors, Reconciled, Reconciler};
pub use session::{IngestReport, ReviewSession, SessionEvent};
pub use template::{
    apply_template, apply_template_batch, create_template, Template, TemplateApplication,
    TemplateError, TemplateRegion, TemplateStore,
};
