//! Rotas HTTP e WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::Utc;
use redact_core::{
    apply_template_batch, create_template, mapping_to_csv, ClassificationState, DetectorConfig,
    DetectorOutput, DetectorSource, Document, Entity, EntityGroup, EntityId, EntityType, ExportStyle,
    IngestReport, Location, MappingRow, PageSize, PersistedClassifications, RawDetection,
    RedactError, ReviewSession, SessionEvent, Template, TemplateRegion, VisionResponse, Warning,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

use crate::detection::spawn_detection;
use crate::error::{AppError, AppResult};
use crate::state::{AppState, SessionHandle};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/detections", post(push_detections))
        .route("/sessions/:id/groups", get(list_groups))
        .route("/sessions/:id/groups/toggle", post(toggle_group))
        .route("/sessions/:id/entities", post(add_entity))
        .route(
            "/sessions/:id/entities/:entity_id",
            patch(update_entity).delete(delete_entity),
        )
        .route("/sessions/:id/threshold", post(set_threshold))
        .route("/sessions/:id/export", post(export_session))
        .route("/sessions/:id/events", get(session_events))
        .route("/classifications", get(list_classifications).post(classify))
        .route("/templates", get(list_templates).post(create_template_handler))
        .route("/templates/:id", delete(delete_template))
        .route("/templates/:id/apply", post(apply_template_handler))
        .route("/templates/:id/batch", post(apply_batch_handler))
        .with_state(state)
}

// === Documentos ===

#[derive(Debug, Deserialize)]
pub struct PageInput {
    #[serde(default)]
    pub size: Option<PageSize>,
    pub text: String,
}

/// Documento já diagramado, ou páginas de texto puro para diagramar.
#[derive(Debug, Default, Deserialize)]
pub struct DocumentInput {
    #[serde(default)]
    pub pages: Vec<PageInput>,
    #[serde(default)]
    pub document: Option<Document>,
}

impl DocumentInput {
    fn into_document(self) -> AppResult<Document> {
        if let Some(doc) = self.document {
            return Ok(doc);
        }
        if self.pages.is_empty() {
            return Err(AppError::BadRequest("documento sem páginas".into()));
        }
        let mut pages = Vec::with_capacity(self.pages.len());
        for p in &self.pages {
            let size = match p.size {
                Some(s) => PageSize::new(s.width, s.height).map_err(RedactError::from)?,
                None => PageSize::a4(),
            };
            pages.push((size, p.text.as_str()));
        }
        Ok(Document::from_page_texts(&pages))
    }
}

// === Sessões ===

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(flatten)]
    pub input: DocumentInput,
    #[serde(default)]
    pub detector_config: DetectorConfig,
    #[serde(default = "yes")]
    pub run_detectors: bool,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub page_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub threshold: f64,
    pub case_insensitive: bool,
    pub visible: usize,
    pub entities: Vec<Entity>,
    pub warnings: Vec<Warning>,
}

impl SessionView {
    fn of(s: &ReviewSession) -> Self {
        Self {
            session_id: s.id,
            threshold: s.threshold(),
            case_insensitive: s.case_insensitive(),
            visible: s.visible_entities().count(),
            entities: s.entities().to_vec(),
            warnings: s.warnings().to_vec(),
        }
    }
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> AppResult<(StatusCode, Json<SessionCreated>)> {
    if req.run_detectors && state.detectors.is_empty() {
        return Err(RedactError::NoDetectors.into());
    }
    let document = req.input.into_document()?;
    let mut session = ReviewSession::new(document, &state.config.review);
    if let Some(t) = req.threshold {
        session.set_threshold(t);
    }
    let created = SessionCreated {
        session_id: session.id,
        document_id: session.document().id,
        page_count: session.document().page_count(),
    };
    let snapshot_doc = Arc::new(session.document().clone());
    let handle = state.insert_session(session).await;
    info!(session = %created.session_id, pages = created.page_count, "sessão criada");

    if req.run_detectors {
        spawn_detection(&state, handle, snapshot_doc, req.detector_config);
    }
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<SessionView>> {
    let handle = state.session(id).await?;
    let session = handle.session.read().await;
    Ok(Json(SessionView::of(&session)))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.close_session(id).await?;
    info!(session = %id, "sessão fechada");
    Ok(StatusCode::NO_CONTENT)
}

fn cloud() -> DetectorSource {
    DetectorSource::Cloud
}

/// Detecções empurradas por um detector externo, possivelmente bem depois da criação.
#[derive(Debug, Deserialize)]
pub struct ExternalDetections {
    #[serde(default = "cloud")]
    pub source: DetectorSource,
    #[serde(default)]
    pub detector: Option<String>,
    #[serde(default)]
    pub entities: Vec<RawDetection>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    /// Resposta bruta do modelo de visão
    #[serde(default)]
    pub vision: Option<VisionResponse>,
}

async fn push_detections(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExternalDetections>,
) -> AppResult<Json<IngestReport>> {
    let handle = state.session(id).await?;
    let mut output = DetectorOutput { entities: req.entities, warnings: req.warnings };
    if let Some(vision) = req.vision {
        let adapted = vision.into_output();
        output.entities.extend(adapted.entities);
        output.warnings.extend(adapted.warnings);
    }
    let snapshot = state.classifications.snapshot()?;
    let report = handle.session.write().await.ingest(req.source, output, &snapshot);
    handle.publish(SessionEvent::EntitiesIngested {
        detector: req.detector.unwrap_or_else(|| format!("{:?}", req.source).to_lowercase()),
        report: report.clone(),
    });
    Ok(Json(report))
}

async fn list_groups(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<Vec<EntityGroup>>> {
    let handle = state.session(id).await?;
    let snapshot = state.classifications.snapshot()?;
    let groups = handle.session.read().await.groups(&snapshot);
    Ok(Json(groups))
}

#[derive(Debug, Deserialize)]
pub struct ToggleGroupRequest {
    pub text: String,
    pub entity_type: EntityType,
    pub accepted: bool,
}

async fn toggle_group(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ToggleGroupRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let handle = state.session(id).await?;
    let touched = handle
        .session
        .write()
        .await
        .toggle_group(&req.text, &req.entity_type, req.accepted);
    Ok(Json(serde_json::json!({ "touched": touched })))
}

#[derive(Debug, Deserialize)]
pub struct AddEntityRequest {
    pub entity_type: EntityType,
    pub text: String,
    #[serde(default)]
    pub locations: Vec<Location>,
    /// Sem localizações: procura o texto no documento e marca todas as ocorrências
    #[serde(default)]
    pub locate: bool,
}

async fn add_entity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AddEntityRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("texto vazio".into()));
    }
    let handle = state.session(id).await?;
    let mut session = handle.session.write().await;
    let mut locations = req.locations;
    if locations.is_empty() && req.locate {
        let doc = session.document();
        locations = doc
            .find_occurrences(&req.text, false)
            .into_iter()
            .flat_map(|span| doc.locate_span(span))
            .collect();
    }
    let entity_id = session.add_manual(req.entity_type, &req.text, locations);
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": entity_id }))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEntityRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub accepted: Option<bool>,
}

async fn update_entity(
    State(state): State<AppState>,
    Path((id, entity_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateEntityRequest>,
) -> AppResult<Json<Entity>> {
    let handle = state.session(id).await?;
    let snapshot = state.classifications.snapshot()?;
    let mut session = handle.session.write().await;
    let entity_id = EntityId::from(entity_id);
    session.edit(entity_id, req.text.as_deref(), req.entity_type, &snapshot)?;
    if let Some(accepted) = req.accepted {
        session.toggle_entity(entity_id, accepted)?;
    }
    let entity = session
        .entity(entity_id)
        .cloned()
        .ok_or(RedactError::EntityNotFound(entity_id))?;
    Ok(Json(entity))
}

async fn delete_entity(
    State(state): State<AppState>,
    Path((id, entity_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    let handle = state.session(id).await?;
    handle.session.write().await.remove(EntityId::from(entity_id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ThresholdRequest {
    pub threshold: f64,
}

async fn set_threshold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ThresholdRequest>,
) -> AppResult<Json<SessionView>> {
    if !(0.0..=1.0).contains(&req.threshold) {
        return Err(AppError::BadRequest(format!("limiar {} fora de [0, 1]", req.threshold)));
    }
    let handle = state.session(id).await?;
    let mut session = handle.session.write().await;
    session.set_threshold(req.threshold);
    Ok(Json(SessionView::of(&session)))
}

// === Exportação ===

#[derive(Debug, Default, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub style: Option<ExportStyle>,
    #[serde(default)]
    pub include_text: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub document: Document,
    pub mapping: Vec<MappingRow>,
    pub mapping_csv: String,
    pub text: Option<String>,
    pub warnings: Vec<Warning>,
    pub redacted_locations: usize,
}

async fn export_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    req: Option<Json<ExportRequest>>,
) -> AppResult<Json<ExportResponse>> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let mut options = state.config.export.options();
    if let Some(style) = req.style {
        options.style = style;
    }
    if let Some(include_text) = req.include_text {
        options.include_text = include_text;
    }

    let handle = state.session(id).await?;
    let result = handle.session.read().await.export(&options);
    for w in &result.warnings {
        warn!(session = %id, warning = %w, "aviso na exportação");
    }
    Ok(Json(ExportResponse {
        mapping_csv: mapping_to_csv(&result.mapping),
        document: result.document,
        mapping: result.mapping,
        text: result.text,
        warnings: result.warnings,
        redacted_locations: result.redacted_locations,
    }))
}

// === Memória de classificação ===

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
    pub entity_type: EntityType,
    pub state: ClassificationState,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Sessão em que a decisão foi tomada; recebe o efeito imediatamente
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClassifyResponse {
    pub previous: ClassificationState,
    pub applied: usize,
}

async fn classify(State(state): State<AppState>, Json(req): Json<ClassifyRequest>) -> AppResult<Json<ClassifyResponse>> {
    if req.text.trim().is_empty() {
        return Err(AppError::BadRequest("termo vazio".into()));
    }
    let store = Arc::clone(&state.classifications);
    let (text, entity_type, new_state, cs) = (req.text.clone(), req.entity_type.clone(), req.state, req.case_sensitive);
    let previous =
        tokio::task::spawn_blocking(move || store.classify(&text, &entity_type, new_state, cs)).await??;

    let mut applied = 0;
    if let Some(session_id) = req.session_id {
        let handle = state.session(session_id).await?;
        applied = handle
            .session
            .write()
            .await
            .apply_classification(&req.text, &req.entity_type, req.state, req.case_sensitive);
    }
    info!(term = %req.text, entity_type = %req.entity_type, ?previous, state = ?req.state, applied, "termo classificado");
    Ok(Json(ClassifyResponse { previous, applied }))
}

async fn list_classifications(State(state): State<AppState>) -> AppResult<Json<PersistedClassifications>> {
    Ok(Json(state.classifications.export()?))
}

// === Templates ===

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    #[serde(default)]
    pub name: String,
    /// Sessão cujo documento serve de referência
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub reference_pages: Option<Vec<PageSize>>,
    pub regions: Vec<TemplateRegion>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

async fn create_template_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateTemplateRequest>,
) -> AppResult<(StatusCode, Json<Template>)> {
    let reference_pages = match (req.reference_pages, req.session_id) {
        (Some(pages), _) => pages,
        (None, Some(session_id)) => {
            let handle = state.session(session_id).await?;
            let session = handle.session.read().await;
            session.document().pages.iter().map(|p| p.size).collect()
        }
        (None, None) => return Err(AppError::BadRequest("informe reference_pages ou session_id".into())),
    };
    let ttl = match req.ttl_secs {
        Some(s) => i64::try_from(s).ok().map(chrono::Duration::seconds),
        None => state.config.template_ttl(),
    };
    let template = create_template(req.name, reference_pages, req.regions, ttl)?;
    state.templates.insert(template.clone())?;
    info!(template = %template.template_id, regions = template.regions.len(), "template criado");
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_templates(State(state): State<AppState>) -> AppResult<Json<Vec<Template>>> {
    Ok(Json(state.templates.list(Utc::now())?))
}

async fn delete_template(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<StatusCode> {
    state.templates.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ApplyTemplateRequest {
    pub session_id: Uuid,
}

async fn apply_template_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApplyTemplateRequest>,
) -> AppResult<Json<IngestReport>> {
    let template = state.templates.get(id, Utc::now())?;
    let handle: Arc<SessionHandle> = state.session(req.session_id).await?;
    let snapshot = state.classifications.snapshot()?;
    let tolerance = state.config.templates.layout_tolerance;

    let mut session = handle.session.write().await;
    let application = redact_core::apply_template(&template, session.document(), tolerance)?;
    let report = session.ingest_template(application, &snapshot);
    handle.publish(SessionEvent::EntitiesIngested {
        detector: format!("template:{}", template.template_id),
        report: report.clone(),
    });
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub documents: Vec<DocumentInput>,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub document_id: Option<Uuid>,
    pub entities: Vec<Entity>,
    pub warnings: Vec<Warning>,
    pub error: Option<String>,
}

async fn apply_batch_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<BatchRequest>,
) -> AppResult<Json<Vec<BatchItem>>> {
    let template = state.templates.get(id, Utc::now())?;
    let documents = req
        .documents
        .into_iter()
        .map(DocumentInput::into_document)
        .collect::<AppResult<Vec<_>>>()?;
    let tolerance = state.config.templates.layout_tolerance;

    let results =
        tokio::task::spawn_blocking(move || apply_template_batch(&template, &documents, tolerance)).await?;
    let items = results
        .into_iter()
        .map(|r| match r {
            Ok(app) => BatchItem {
                document_id: Some(app.document_id),
                entities: app.entities,
                warnings: app.warnings,
                error: None,
            },
            Err(e) => BatchItem {
                document_id: None,
                entities: Vec::new(),
                warnings: Vec::new(),
                error: Some(e.to_string()),
            },
        })
        .collect();
    Ok(Json(items))
}

// === Eventos ===

async fn session_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let handle = state.session(id).await?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, handle)))
}

/// Repassa os eventos da sessão ao cliente até ele desconectar ou a sessão fechar.
async fn stream_events(mut socket: WebSocket, handle: Arc<SessionHandle>) {
    let mut rx = handle.events.subscribe();
    let cancel = handle.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Ok(json) = serde_json::to_string(&SessionEvent::Cancelled) {
                    let _ = socket.send(Message::Text(json.into())).await;
                }
                break;
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cliente WebSocket atrasado, eventos descartados");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use redact_core::RedactConfig;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let state = AppState::new(RedactConfig::default(), CancellationToken::new()).unwrap();
        (router(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    async fn new_session(app: &Router, text: &str, run_detectors: bool) -> Uuid {
        let (status, body) = call(
            app,
            "POST",
            "/sessions",
            Some(json!({ "pages": [{ "text": text }], "run_detectors": run_detectors })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        serde_json::from_value::<SessionCreated>(body).unwrap().session_id
    }

    #[tokio::test]
    async fn test_review_flow_with_pushed_detections() {
        let (app, _) = app();
        let text = "Il sig. Mario Rossi abita a Roma";
        let id = new_session(&app, text, false).await;
        let start = text.find("Mario Rossi").unwrap();

        let (status, report) = call(
            &app,
            "POST",
            &format!("/sessions/{id}/detections"),
            Some(json!({
                "source": "cloud",
                "entities": [{ "text": "Mario Rossi", "entity_type": "person", "score": 0.9,
                               "start": start, "end": start + 11 }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["added"], 1);

        let (_, groups) = call(&app, "GET", &format!("/sessions/{id}/groups"), None).await;
        assert_eq!(groups.as_array().unwrap().len(), 1);
        assert_eq!(groups[0]["entity_type"], "PERSON");

        let (status, export) = call(
            &app,
            "POST",
            &format!("/sessions/{id}/export"),
            Some(json!({ "style": "placeholder", "include_text": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(export["text"], "Il sig. PERSON_A abita a Roma");
        assert!(export["mapping_csv"].as_str().unwrap().contains("Mario Rossi,PERSON,PERSON_A"));
    }

    #[tokio::test]
    async fn test_local_detectors_run_in_background() {
        let (app, state) = app();
        let id = new_session(&app, "Scrivere a mario.rossi@example.it", true).await;

        let handle = state.session(id).await.unwrap();
        let mut found = false;
        for _ in 0..100 {
            if !handle.session.read().await.entities().is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(found);
        let (_, view) = call(&app, "GET", &format!("/sessions/{id}"), None).await;
        assert_eq!(view["entities"][0]["entity_type"], "EMAIL");
    }

    #[tokio::test]
    async fn test_classify_never_applies_to_session_and_future_detections() {
        let (app, _) = app();
        let text = "Il Giudice ha deciso";
        let id = new_session(&app, text, false).await;
        let start = text.find("Giudice").unwrap();
        let detection = json!({
            "source": "local",
            "entities": [{ "text": "Giudice", "entity_type": "PERSON", "score": 0.8,
                           "start": start, "end": start + 7 }]
        });
        call(&app, "POST", &format!("/sessions/{id}/detections"), Some(detection.clone())).await;

        let (status, resp) = call(
            &app,
            "POST",
            "/classifications",
            Some(json!({ "text": "Giudice", "entity_type": "PERSON", "state": "never", "session_id": id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["previous"], "neutral");
        assert_eq!(resp["applied"], 1);

        let other = new_session(&app, text, false).await;
        let (_, report) = call(&app, "POST", &format!("/sessions/{other}/detections"), Some(detection)).await;
        assert_eq!(report["added"], 0);
        assert_eq!(report["denied"], 1);

        let (_, persisted) = call(&app, "GET", "/classifications", None).await;
        assert_eq!(persisted["deny"]["PERSON"][0], "Giudice");
    }

    #[tokio::test]
    async fn test_template_layout_mismatch_is_unprocessable() {
        let (app, _) = app();
        let (status, template) = call(
            &app,
            "POST",
            "/templates",
            Some(json!({
                "name": "modulo",
                "reference_pages": [{ "width": 595.0, "height": 842.0 }],
                "regions": [{ "bbox": [70.0, 740.0, 200.0, 30.0], "field_name": "nome", "entity_type": "PERSON" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let template_id = template["template_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            "/sessions",
            Some(json!({ "pages": [{ "size": { "width": 612.0, "height": 792.0 }, "text": "Nome: Mario" }],
                         "run_detectors": false })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, err) = call(
            &app,
            "POST",
            &format!("/templates/{template_id}/apply"),
            Some(json!({ "session_id": session_id })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["code"], "LAYOUT_MISMATCH");
    }

    #[tokio::test]
    async fn test_delete_session_cancels_work() {
        let (app, state) = app();
        let id = new_session(&app, "testo", false).await;
        let handle = state.session(id).await.unwrap();

        let (status, _) = call(&app, "DELETE", &format!("/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(handle.cancel.is_cancelled());

        let (status, err) = call(&app, "GET", &format!("/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_manual_entity_located_and_edited() {
        let (app, _) = app();
        let id = new_session(&app, "Firma di Luigi Verdi e di Luigi Verdi", false).await;
        let (status, created) = call(
            &app,
            "POST",
            &format!("/sessions/{id}/entities"),
            Some(json!({ "entity_type": "PERSON", "text": "Luigi Verdi", "locate": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let entity_id = created["id"].as_str().unwrap().to_string();

        let (status, entity) = call(
            &app,
            "PATCH",
            &format!("/sessions/{id}/entities/{entity_id}"),
            Some(json!({ "accepted": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entity["accepted"], false);
        assert_eq!(entity["locations"].as_array().unwrap().len(), 2);

        let (_, export) = call(&app, "POST", &format!("/sessions/{id}/export"), Some(json!({}))).await;
        assert_eq!(export["redacted_locations"], 0);
    }
}
