use std::collections::HashMap;
use std::sync::Arc;

use redact_core::{
    ClassificationStore, Detector, JsonFileBackend, LearnedTermDetector, PatternDetector,
    RedactConfig, ReviewSession, SessionEvent, TemplateStore,
};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Capacidade do canal de eventos de cada sessão.
const EVENT_CAPACITY: usize = 256;

/// Uma sessão de revisão aberta, com o trabalho em andamento ligado a ela.
pub struct SessionHandle {
    pub session: RwLock<ReviewSession>,
    /// Cancelado quando a sessão é fechada; interrompe detectores pendentes.
    pub cancel: CancellationToken,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn new(session: ReviewSession, parent: &CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: RwLock::new(session),
            cancel: parent.child_token(),
            events,
        }
    }

    /// Publica um evento; sem assinantes, o evento é descartado.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Estado compartilhado por todos os handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RedactConfig>,
    pub classifications: Arc<ClassificationStore>,
    pub templates: Arc<TemplateStore>,
    pub detectors: Arc<Vec<Arc<dyn Detector>>>,
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<SessionHandle>>>>,
    /// Token raiz: cancelado no desligamento do servidor
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: RedactConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let classifications = Arc::new(match &config.storage.classification_path {
            Some(path) => ClassificationStore::open(Box::new(JsonFileBackend::new(path)))?,
            None => ClassificationStore::in_memory(),
        });
        let templates = Arc::new(match &config.storage.template_path {
            Some(path) => TemplateStore::open(path)?,
            None => TemplateStore::in_memory(),
        });
        let detectors: Vec<Arc<dyn Detector>> = vec![
            Arc::new(PatternDetector::default()),
            Arc::new(LearnedTermDetector::new(Arc::clone(&classifications))),
        ];
        Ok(Self {
            config: Arc::new(config),
            classifications,
            templates,
            detectors: Arc::new(detectors),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
        })
    }

    pub async fn session(&self, id: Uuid) -> AppResult<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("sessão {id}")))
    }

    pub async fn insert_session(&self, session: ReviewSession) -> Arc<SessionHandle> {
        let id = session.id;
        let handle = Arc::new(SessionHandle::new(session, &self.shutdown));
        self.sessions.write().await.insert(id, Arc::clone(&handle));
        handle
    }

    /// Remove a sessão e cancela o trabalho pendente.
    pub async fn close_session(&self, id: Uuid) -> AppResult<()> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("sessão {id}")))?;
        handle.cancel.cancel();
        handle.publish(SessionEvent::Cancelled);
        Ok(())
    }
}
