//! Test doubles shared by the editor tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use server_api::CatalogService;
use shared::{
    domain::{EntityKind, EntityRef},
    protocol::{ActionBatch, MultiResponse, ServiceAction},
};
use tokio::sync::Notify;

use crate::{
    collaborators::{ConfirmRequest, Dialogs, Navigator},
    transport::{Transport, TransportError},
};

pub(crate) const SPORTS: i64 = 1;
pub(crate) const FOOTBALL: i64 = 2;
pub(crate) const TENNIS: i64 = 3;
pub(crate) const WEEKEND_PLAYLIST: i64 = 8;

type Matcher = Box<dyn Fn(&ServiceAction) -> bool + Send + Sync>;

/// In-process transport backed by a seeded catalogue. Records every batch.
#[derive(Default)]
pub(crate) struct CatalogTransport {
    pub(crate) service: CatalogService,
    batches: Mutex<Vec<ActionBatch>>,
    failures: Mutex<Vec<(Matcher, String)>>,
    gates: Mutex<Vec<(Matcher, Arc<Notify>)>>,
}

impl CatalogTransport {
    pub(crate) async fn seeded() -> Arc<Self> {
        let transport = Self::default();
        transport
            .service
            .seed_demo_data()
            .await
            .expect("seed catalogue");
        Arc::new(transport)
    }

    pub(crate) fn batches(&self) -> Vec<ActionBatch> {
        self.batches.lock().unwrap().clone()
    }

    /// Batches that change data.
    pub(crate) fn writes(&self) -> Vec<ActionBatch> {
        self.batches()
            .into_iter()
            .filter(|batch| {
                batch.actions.iter().any(|action| {
                    matches!(
                        action,
                        ServiceAction::Add { .. }
                            | ServiceAction::Update { .. }
                            | ServiceAction::Delete { .. }
                    )
                })
            })
            .collect()
    }

    /// The next request fails at the transport level.
    pub(crate) fn fail_next(&self, message: &str) {
        self.fail_when(|_| true, message);
    }

    /// The next request containing a matching action fails at the transport level.
    pub(crate) fn fail_when(
        &self,
        matcher: impl Fn(&ServiceAction) -> bool + Send + Sync + 'static,
        message: &str,
    ) {
        self.failures
            .lock()
            .unwrap()
            .push((Box::new(matcher), message.to_string()));
    }

    /// Holds every request containing a matching action until the notify is signalled.
    pub(crate) fn gate_when(
        &self,
        matcher: impl Fn(&ServiceAction) -> bool + Send + Sync + 'static,
    ) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .push((Box::new(matcher), Arc::clone(&gate)));
        gate
    }

    pub(crate) fn gate_get(&self, id: i64) -> Arc<Notify> {
        self.gate_when(move |action| {
            matches!(action, ServiceAction::Get { id: EntityRef::Id(got), .. } if *got == id)
        })
    }

    fn gate_for(&self, batch: &ActionBatch) -> Option<Arc<Notify>> {
        self.gates
            .lock()
            .unwrap()
            .iter()
            .find(|(matcher, _)| batch.actions.iter().any(|action| matcher(action)))
            .map(|(_, gate)| Arc::clone(gate))
    }

    fn take_failure(&self, batch: &ActionBatch) -> Option<String> {
        let mut failures = self.failures.lock().unwrap();
        let position = failures
            .iter()
            .position(|(matcher, _)| batch.actions.iter().any(|action| matcher(action)))?;
        Some(failures.remove(position).1)
    }
}

#[async_trait]
impl Transport for CatalogTransport {
    async fn multi_request(&self, batch: ActionBatch) -> Result<MultiResponse, TransportError> {
        self.batches.lock().unwrap().push(batch.clone());
        if let Some(gate) = self.gate_for(&batch) {
            gate.notified().await;
        }
        if let Some(message) = self.take_failure(&batch) {
            return Err(TransportError::Http(message));
        }
        Ok(self.service.execute(&batch).await)
    }
}

pub(crate) fn lists(kind: EntityKind) -> impl Fn(&ServiceAction) -> bool + Send + Sync + 'static {
    move |action| matches!(action, ServiceAction::List { kind: listed, .. } if *listed == kind)
}

#[derive(Default)]
pub(crate) struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
    params: Mutex<Vec<(String, String)>>,
}

impl RecordingNavigator {
    pub(crate) fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    pub(crate) fn set_param(&self, name: &str, value: &str) {
        self.params
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_to(&self, path: &str, _params: &[(&str, String)]) {
        self.visits.lock().unwrap().push(path.to_string());
    }

    fn route_param(&self, name: &str) -> Option<String> {
        self.params
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.clone())
    }
}

pub(crate) struct ScriptedDialogs {
    answer: AtomicBool,
    confirms: AtomicUsize,
    alerts: Mutex<Vec<String>>,
}

impl ScriptedDialogs {
    pub(crate) fn answering(answer: bool) -> Self {
        Self {
            answer: AtomicBool::new(answer),
            confirms: AtomicUsize::new(0),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_answer(&self, answer: bool) {
        self.answer.store(answer, Ordering::SeqCst);
    }

    pub(crate) fn confirms(&self) -> usize {
        self.confirms.load(Ordering::SeqCst)
    }

    pub(crate) fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialogs for ScriptedDialogs {
    async fn confirm(&self, _request: ConfirmRequest) -> bool {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        self.answer.load(Ordering::SeqCst)
    }

    async fn alert(&self, message: &str) {
        self.alerts.lock().unwrap().push(message.to_string());
    }
}
