//! # Memória de Classificação (Aprendizado)
//!
//! Guarda a decisão do usuário para cada par `(texto normalizado, tipo)` e a reaplica
//! em todos os documentos futuros.
//!
//! ## Máquina de Estados
//!
//! ```text
//! qualquer --classify(always)--> always
//! qualquer --classify(flag)----> flag
//! qualquer --classify(never)---> never
//! qualquer --classify(neutral)-> (ausente)
//! ```
//!
//! `always` e `flag` vivem na lista de permissão (allow-list, com `flag_for_review`);
//! `never` vive na lista de bloqueio (deny-list). `neutral` é a ausência de registro.
//!
//! ## Atomicidade
//!
//! O estado atual é um [`ClassificationSnapshot`] imutável atrás de um `Arc`. Uma transição:
//!
//! 1. serializa escritores (um por vez);
//! 2. copia o snapshot e, na cópia, **remove** das duas listas todo registro do mesmo termo
//!    que a decisão substitui e só então insere na lista alvo;
//! 3. persiste a cópia no backend;
//! 4. troca o `Arc` publicado.
//!
//! Leitores (a reconciliação de outro documento, por exemplo) pegam um `Arc` e enxergam
//! sempre um estado completo: nunca uma chave fora de `never` e ainda não em `always`.
//! Se a persistência falhar, nada é publicado.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::entity::{normalize_text, EntityType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("erro de E/S em {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    /// Só acontece ao carregar dados persistidos inconsistentes.
    #[error("'{term}' ({entity_type}) aparece ao mesmo tempo na allow-list e na deny-list")]
    ClassificationConflict { entity_type: EntityType, term: String },

    #[error("lock envenenado na memória de classificação")]
    Poisoned,
}

/// Decisão do usuário para um termo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationState {
    /// Sempre redigir, independentemente do score
    Always,
    /// Redigir, mas destacar para revisão
    Flag,
    /// Sem decisão (equivale a não ter registro)
    Neutral,
    /// Nunca redigir: a detecção é descartada
    Never,
}

/// Chave de um registro. Registros sensíveis a maiúsculas guardam o texto literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassificationKey {
    pub entity_type: EntityType,
    pub text: String,
    pub case_sensitive: bool,
}

impl ClassificationKey {
    pub fn new(text: &str, entity_type: &EntityType, case_sensitive: bool) -> Self {
        Self {
            entity_type: entity_type.clone(),
            text: normalize_text(text, !case_sensitive),
            case_sensitive,
        }
    }
}

/// Resultado de uma consulta: nunca `Neutral`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub state: ClassificationState,
    pub case_sensitive: bool,
    /// Forma literal ensinada pelo usuário
    pub term: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AllowEntry {
    term: String,
    flag_for_review: bool,
}

/// Estado imutável da memória num instante.
#[derive(Debug, Clone, Default)]
pub struct ClassificationSnapshot {
    allow: HashMap<ClassificationKey, AllowEntry>,
    deny: HashMap<ClassificationKey, String>,
}

impl ClassificationSnapshot {
    /// Decisão vigente para `text`: um registro sensível a maiúsculas com o texto exato
    /// tem precedência sobre o registro insensível.
    pub fn lookup(&self, text: &str, entity_type: &EntityType) -> Option<ClassificationRecord> {
        [true, false]
            .into_iter()
            .find_map(|cs| self.get(&ClassificationKey::new(text, entity_type, cs)))
    }

    pub fn state_of(&self, text: &str, entity_type: &EntityType) -> ClassificationState {
        self.lookup(text, entity_type)
            .map(|r| r.state)
            .unwrap_or(ClassificationState::Neutral)
    }

    fn get(&self, key: &ClassificationKey) -> Option<ClassificationRecord> {
        if let Some(a) = self.allow.get(key) {
            return Some(ClassificationRecord {
                state: if a.flag_for_review {
                    ClassificationState::Flag
                } else {
                    ClassificationState::Always
                },
                case_sensitive: key.case_sensitive,
                term: a.term.clone(),
            });
        }
        self.deny.get(key).map(|term| ClassificationRecord {
            state: ClassificationState::Never,
            case_sensitive: key.case_sensitive,
            term: term.clone(),
        })
    }

    /// Termos em `always`/`flag`, usados pelo detector de termos aprendidos.
    pub fn allowed_terms(&self) -> Vec<(EntityType, ClassificationRecord)> {
        let mut out: Vec<_> = self
            .allow
            .keys()
            .filter_map(|k| self.get(k).map(|r| (k.entity_type.clone(), r)))
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1.term).cmp(&(&b.0, &b.1.term)));
        out
    }

    /// Quantos estados a chave ocupa (0 ou 1 se o invariante vale).
    pub fn states_held(&self, key: &ClassificationKey) -> usize {
        usize::from(self.allow.contains_key(key)) + usize::from(self.deny.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.allow.len() + self.deny.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove das duas listas os registros que a nova decisão substitui e só então insere
    /// no estado alvo.
    ///
    /// Uma decisão insensível a maiúsculas vale para todas as grafias do termo, então apaga
    /// também os registros sensíveis do mesmo termo. Uma decisão sensível substitui o
    /// registro exato; se for `neutral`, apaga também o insensível, para que o literal fique
    /// de fato sem decisão.
    fn transition(&mut self, key: ClassificationKey, term: &str, state: ClassificationState) {
        let folded = normalize_text(&key.text, true);
        let clear_all_spellings = !key.case_sensitive || state == ClassificationState::Neutral;
        let superseded = |k: &ClassificationKey| {
            k.entity_type == key.entity_type
                && (k == &key
                    || (clear_all_spellings && !k.case_sensitive && k.text == folded)
                    || (!key.case_sensitive && k.case_sensitive && normalize_text(&k.text, true) == folded))
        };
        self.allow.retain(|k, _| !superseded(k));
        self.deny.retain(|k, _| !superseded(k));
        let term = term.trim().to_string();
        match state {
            ClassificationState::Always | ClassificationState::Flag => {
                self.allow.insert(
                    key,
                    AllowEntry { term, flag_for_review: state == ClassificationState::Flag },
                );
            }
            ClassificationState::Never => {
                self.deny.insert(key, term);
            }
            ClassificationState::Neutral => {}
        }
    }

    fn from_persisted(p: &PersistedClassifications) -> Result<Self, StoreError> {
        let mut snap = ClassificationSnapshot::default();
        for a in &p.allow {
            let key = ClassificationKey::new(&a.term, &a.entity_type, a.case_sensitive);
            snap.allow.insert(
                key,
                AllowEntry { term: a.term.clone(), flag_for_review: a.flag_for_review },
            );
        }
        for (entity_type, terms) in &p.deny {
            for t in terms {
                let key = ClassificationKey::new(t.term(), entity_type, t.case_sensitive());
                if snap.allow.contains_key(&key) {
                    return Err(StoreError::ClassificationConflict {
                        entity_type: entity_type.clone(),
                        term: t.term().to_string(),
                    });
                }
                snap.deny.insert(key, t.term().to_string());
            }
        }
        Ok(snap)
    }

    pub fn to_persisted(&self) -> PersistedClassifications {
        let mut allow: Vec<AllowRecord> = self
            .allow
            .iter()
            .map(|(k, a)| AllowRecord {
                entity_type: k.entity_type.clone(),
                term: a.term.clone(),
                case_sensitive: k.case_sensitive,
                flag_for_review: a.flag_for_review,
            })
            .collect();
        allow.sort_by(|a, b| (&a.entity_type, &a.term).cmp(&(&b.entity_type, &b.term)));

        let mut deny: BTreeMap<EntityType, Vec<DenyTerm>> = BTreeMap::new();
        for (k, term) in &self.deny {
            let t = if k.case_sensitive {
                DenyTerm::Detailed { term: term.clone(), case_sensitive: true }
            } else {
                DenyTerm::Plain(term.clone())
            };
            deny.entry(k.entity_type.clone()).or_default().push(t);
        }
        for terms in deny.values_mut() {
            terms.sort_by(|a, b| a.term().cmp(b.term()));
        }
        PersistedClassifications { allow, deny }
    }
}

/// Entrada da allow-list no formato persistido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowRecord {
    pub entity_type: EntityType,
    pub term: String,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub flag_for_review: bool,
}

/// Termo da deny-list: string simples (insensível) ou objeto com `case_sensitive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DenyTerm {
    Plain(String),
    Detailed {
        term: String,
        #[serde(default)]
        case_sensitive: bool,
    },
}

impl DenyTerm {
    pub fn term(&self) -> &str {
        match self {
            DenyTerm::Plain(t) | DenyTerm::Detailed { term: t, .. } => t,
        }
    }

    pub fn case_sensitive(&self) -> bool {
        matches!(self, DenyTerm::Detailed { case_sensitive: true, .. })
    }
}

/// Formato plano (JSON) da memória: allow-list + deny-list por tipo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedClassifications {
    #[serde(default)]
    pub allow: Vec<AllowRecord>,
    #[serde(default)]
    pub deny: BTreeMap<EntityType, Vec<DenyTerm>>,
}

/// Transporte da persistência (armazenamento local, banco, ...).
pub trait ClassificationBackend: Send + Sync {
    fn load(&self) -> Result<PersistedClassifications, StoreError>;
    fn save(&self, data: &PersistedClassifications) -> Result<(), StoreError>;
}

/// Backend em memória, para testes e sessões efêmeras.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<PersistedClassifications>,
}

impl MemoryBackend {
    pub fn new(initial: PersistedClassifications) -> Self {
        Self { data: Mutex::new(initial) }
    }
}

impl ClassificationBackend for MemoryBackend {
    fn load(&self) -> Result<PersistedClassifications, StoreError> {
        self.data.lock().map(|d| d.clone()).map_err(|_| StoreError::Poisoned)
    }

    fn save(&self, data: &PersistedClassifications) -> Result<(), StoreError> {
        let mut guard = self.data.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = data.clone();
        Ok(())
    }
}

/// Backend em arquivo JSON. A escrita vai para um arquivo temporário e depois é renomeada.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClassificationBackend for JsonFileBackend {
    fn load(&self) -> Result<PersistedClassifications, StoreError> {
        if !self.path.exists() {
            return Ok(PersistedClassifications::default());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|source| StoreError::Io { path: self.path.clone(), source })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, data: &PersistedClassifications) -> Result<(), StoreError> {
        write_json_atomic(&self.path, data)
    }
}

/// Grava `data` como JSON em `path` via arquivo temporário + rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io { path: path.to_path_buf(), source };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(data)?;
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

/// Memória de classificação compartilhada entre sessões.
pub struct ClassificationStore {
    current: RwLock<Arc<ClassificationSnapshot>>,
    writer: Mutex<()>,
    backend: Box<dyn ClassificationBackend>,
}

impl ClassificationStore {
    /// Carrega o estado do backend.
    pub fn open(backend: Box<dyn ClassificationBackend>) -> Result<Self, StoreError> {
        let persisted = backend.load()?;
        let snapshot = ClassificationSnapshot::from_persisted(&persisted)?;
        info!(records = snapshot.len(), "memória de classificação carregada");
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            backend,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(ClassificationSnapshot::default())),
            writer: Mutex::new(()),
            backend: Box::new(MemoryBackend::default()),
        }
    }

    /// Estado consistente atual. Barato: clona apenas o `Arc`.
    pub fn snapshot(&self) -> Result<Arc<ClassificationSnapshot>, StoreError> {
        self.current.read().map(|s| Arc::clone(&*s)).map_err(|_| StoreError::Poisoned)
    }

    /// Aplica a transição para `state` e devolve o estado anterior da chave.
    ///
    /// Reclassificar é idêntico a classificar pela primeira vez.
    pub fn classify(
        &self,
        text: &str,
        entity_type: &EntityType,
        state: ClassificationState,
        case_sensitive: bool,
    ) -> Result<ClassificationState, StoreError> {
        let _guard = self.writer.lock().map_err(|_| StoreError::Poisoned)?;

        let base = self.snapshot()?;
        let key = ClassificationKey::new(text, entity_type, case_sensitive);
        let previous = base.state_of(text, entity_type);

        let mut next = (*base).clone();
        next.transition(key, text, state);
        self.backend.save(&next.to_persisted())?;

        let mut published = self.current.write().map_err(|_| StoreError::Poisoned)?;
        *published = Arc::new(next);

        debug!(term = text, %entity_type, ?previous, ?state, case_sensitive, "classificação aplicada");
        Ok(previous)
    }

    pub fn export(&self) -> Result<PersistedClassifications, StoreError> {
        Ok(self.snapshot()?.to_persisted())
    }
}
