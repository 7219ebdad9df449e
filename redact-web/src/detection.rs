//! Execução assíncrona dos detectores de uma sessão.
//!
//! Cada detector roda numa thread de bloqueio (`spawn_blocking`); assim que um termina,
//! sua saída é reconciliada na sessão e um evento é publicado. Fechar a sessão cancela a
//! espera: resultados que chegarem depois são descartados.

use std::sync::Arc;

use redact_core::{ClassificationStore, Detector, DetectorConfig, Document, SessionEvent, Warning};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::state::{AppState, SessionHandle};

pub fn spawn_detection(
    state: &AppState,
    handle: Arc<SessionHandle>,
    document: Arc<Document>,
    config: DetectorConfig,
) -> JoinHandle<()> {
    let detectors = Arc::clone(&state.detectors);
    let store = Arc::clone(&state.classifications);
    let config = Arc::new(config);

    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        for detector in detectors.iter() {
            tasks.spawn(run_one(
                Arc::clone(detector),
                Arc::clone(&handle),
                Arc::clone(&document),
                Arc::clone(&store),
                Arc::clone(&config),
            ));
        }

        let mut responded = 0;
        while let Some(res) = tasks.join_next().await {
            if matches!(res, Ok(true)) {
                responded += 1;
            }
        }
        if handle.cancel.is_cancelled() {
            return;
        }
        if responded == 0 {
            warn!(document = %document.id, "nenhum detector respondeu");
        }
        let total_entities = handle.session.read().await.entities().len();
        info!(document = %document.id, responded, total_entities, "detecção concluída");
        handle.publish(SessionEvent::DetectionDone { total_entities });
    })
}

/// Roda um detector. Devolve `true` se ele respondeu.
async fn run_one(
    detector: Arc<dyn Detector>,
    handle: Arc<SessionHandle>,
    document: Arc<Document>,
    store: Arc<ClassificationStore>,
    config: Arc<DetectorConfig>,
) -> bool {
    let name = detector.name().to_string();
    handle.publish(SessionEvent::DetectorStarted { detector: name.clone() });

    let work = {
        let detector = Arc::clone(&detector);
        tokio::task::spawn_blocking(move || detector.detect(&document, &config))
    };

    let result = tokio::select! {
        _ = handle.cancel.cancelled() => {
            debug!(detector = %name, "detecção cancelada");
            return false;
        }
        r = work => r,
    };

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            fail(&handle, name, e.to_string()).await;
            return false;
        }
        Err(join) => {
            fail(&handle, name, join.to_string()).await;
            return false;
        }
    };

    let snapshot = match store.snapshot() {
        Ok(s) => s,
        Err(e) => {
            fail(&handle, name, e.to_string()).await;
            return false;
        }
    };
    let report = handle
        .session
        .write()
        .await
        .ingest(detector.source(), output, &snapshot);
    debug!(detector = %name, added = report.added, denied = report.denied, "saída incorporada");
    handle.publish(SessionEvent::EntitiesIngested { detector: name, report });
    true
}

async fn fail(handle: &SessionHandle, detector: String, reason: String) {
    warn!(detector = %detector, reason = %reason, "detector indisponível");
    handle
        .session
        .write()
        .await
        .record_warning(Warning::DetectorUnavailable { detector: detector.clone(), reason: reason.clone() });
    handle.publish(SessionEvent::DetectorFailed { detector, reason });
}
