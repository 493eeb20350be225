//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use leadsync_adapters::{
    AutomationError, CustomerFilter, FailureNotice, LeadCreator, Notifier, NotifyError,
    UpstreamApi,
};
use leadsync_core::{
    ApiEnvelope, ApiResult, Contact, CrmRecordId, Customer, DateRange, LeadPayload, Task, User,
};
use leadsync_storage::{MemoryLeadLedger, MemoryLeadRequestStore};

use crate::config::{FilterConfig, UserAllowlist};
use crate::delivery::Delivery;
use crate::dlq::DeadLetterService;
use crate::intake::LeadIntake;
use crate::orchestrator::SyncOrchestrator;
use crate::payload::PayloadBuilder;

pub const CONSULTANT_ID: i64 = 100;
pub const CONSULTANT_NAME: &str = "Carlos Souza";

pub fn customer(id: i64, day: &str) -> Customer {
    Customer {
        id,
        description: format!("Lead - Empresa {id}"),
        address: "Rua das Flores, 123, Centro, Pouso Alegre - MG, 37550-000, Brasil".into(),
        creation_date: format!("{day}T09:30:00"),
        contacts: vec![Contact {
            name: "Maria".into(),
            job_position: "Gerente".into(),
            phone: "35999990000".into(),
            email: "maria@example.com".into(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn task_for(customer_id: i64) -> Task {
    Task {
        task_id: customer_id * 10,
        customer_id,
        user_from_name: CONSULTANT_NAME.into(),
        orientation: "Primeira visita".into(),
        ..Default::default()
    }
}

pub fn consultant(user_id: i64, job_position: &str) -> User {
    User {
        user_id,
        name: CONSULTANT_NAME.into(),
        job_position: job_position.into(),
        ..Default::default()
    }
}

#[derive(Default)]
pub struct FakeUpstream {
    customers: Mutex<Vec<Customer>>,
    tasks: Mutex<HashMap<i64, Vec<Task>>>,
    users: Mutex<Vec<User>>,
    customers_fail: AtomicBool,
}

impl FakeUpstream {
    pub fn set_tasks(&self, customer_id: i64, tasks: Vec<Task>) {
        self.tasks.lock().unwrap().insert(customer_id, tasks);
    }

    pub fn set_users(&self, users: Vec<User>) {
        *self.users.lock().unwrap() = users;
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn get_customers(
        &self,
        _filter: &CustomerFilter,
        page_size: i64,
    ) -> ApiEnvelope<Customer> {
        if self.customers_fail.load(Ordering::SeqCst) {
            return ApiEnvelope::failed(500, 1, page_size);
        }
        let result = ApiResult {
            entity_list: self.customers.lock().unwrap().clone(),
            ..Default::default()
        };
        ApiEnvelope::ok(200, result)
    }

    async fn get_customer_by_id(&self, customer_id: i64) -> Option<Customer> {
        self.customers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == customer_id)
            .cloned()
    }

    async fn get_tasks_by_customer(
        &self,
        customer_id: i64,
        _range: &DateRange,
    ) -> ApiEnvelope<Task> {
        let result = ApiResult {
            entity_list: self
                .tasks
                .lock()
                .unwrap()
                .get(&customer_id)
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        };
        ApiEnvelope::ok(200, result)
    }

    async fn get_user_by_name(&self, name: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.name == name)
            .cloned()
    }

    async fn get_user_by_id(&self, user_id: i64) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.user_id == user_id)
            .cloned()
    }
}

/// Counts calls and replays scripted results; succeeds with `crm-<n>` once
/// the script runs out.
#[derive(Default)]
pub struct CountingCreator {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<CrmRecordId, AutomationError>>>,
    payloads: Mutex<Vec<LeadPayload>>,
    delay: Mutex<Option<Duration>>,
}

impl CountingCreator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(AutomationError::Transport(message.to_string())));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn payloads(&self) -> Vec<LeadPayload> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn companies(&self) -> Vec<String> {
        self.payloads()
            .into_iter()
            .map(|payload| payload.vtiger.company)
            .collect()
    }
}

#[async_trait]
impl LeadCreator for CountingCreator {
    async fn create(&self, payload: &LeadPayload) -> Result<CrmRecordId, AutomationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.payloads.lock().unwrap().push(payload.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(CrmRecordId::new(format!("crm-{n}"))))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<FailureNotice> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

/// Every service wired to the same in-memory stores. Delays are zero.
pub struct Harness {
    pub upstream: Arc<FakeUpstream>,
    pub creator: Arc<CountingCreator>,
    pub notifier: Arc<RecordingNotifier>,
    pub ledger: Arc<MemoryLeadLedger>,
    pub requests: Arc<MemoryLeadRequestStore>,
    pub filters: FilterConfig,
}

impl Harness {
    /// Each customer gets one task owned by a qualifying, allow-listed user.
    pub fn new(customers: Vec<Customer>) -> Self {
        let upstream = FakeUpstream::default();
        for c in &customers {
            upstream.set_tasks(c.id, vec![task_for(c.id)]);
        }
        upstream.set_users(vec![consultant(CONSULTANT_ID, "Consultor")]);
        *upstream.customers.lock().unwrap() = customers;

        Self {
            upstream: Arc::new(upstream),
            creator: Arc::default(),
            notifier: Arc::default(),
            ledger: Arc::new(MemoryLeadLedger::new()),
            requests: Arc::new(MemoryLeadRequestStore::new()),
            filters: FilterConfig {
                pilot: UserAllowlist {
                    enabled: true,
                    user_ids: vec![CONSULTANT_ID],
                },
                geocoding: UserAllowlist::disabled(),
                ..Default::default()
            },
        }
    }

    pub fn upstream_fails(&self) {
        self.upstream.customers_fail.store(true, Ordering::SeqCst);
    }

    pub fn delivery(&self) -> Delivery {
        Delivery::new(
            self.creator.clone(),
            self.ledger.clone(),
            self.requests.clone(),
            self.notifier.clone(),
            "http://localhost:3000",
        )
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        let builder = PayloadBuilder::new(None, self.filters.geocoding.clone()).unwrap();
        SyncOrchestrator::new(
            self.upstream.clone(),
            Arc::new(builder),
            self.delivery(),
            self.filters.clone(),
        )
        .with_candidate_delay(Duration::ZERO)
    }

    pub fn intake(&self) -> LeadIntake {
        LeadIntake::new(self.delivery())
    }

    pub fn dead_letters(&self) -> DeadLetterService {
        DeadLetterService::new(self.delivery()).with_batch_delay(Duration::ZERO)
    }

    pub fn payload(&self, upstream_id: i64) -> LeadPayload {
        let customer = customer(upstream_id, "2025-12-10");
        let mut payload = LeadPayload {
            vtiger: Default::default(),
            others: leadsync_core::PayloadContext::new(
                customer,
                task_for(upstream_id),
                consultant(CONSULTANT_ID, "Consultor"),
            ),
        };
        payload.vtiger.company = format!("EMPRESA {upstream_id}");
        payload.vtiger.city = Some("Pouso Alegre".into());
        payload
    }

    /// One-element array form, as the sync path stores it.
    pub fn stored_payload(&self, upstream_id: i64) -> String {
        self.payload(upstream_id).to_stored().unwrap()
    }
}
