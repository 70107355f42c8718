//! Background worker: wires stores, the outbox processor and the retention
//! sweepers into one task registry.

use std::sync::Arc;

use tracing::info;

use identityd_auth::{AttemptLog, Authenticator, CredentialVerifier};
use identityd_core::SystemClock;
use identityd_infra::outbox::{InMemoryOutboxStore, Mailer, MessageSender, OutboxProcessor, OutboxStore};
use identityd_infra::{
    InMemoryAttemptLog, PostgresStore, RetainedTable, RetentionSweeper, RetentionTarget, SchedulerError, Settings,
    TaskRegistry,
};

/// Storage handles shared by the tasks and the login path.
#[derive(Clone)]
pub struct Stores {
    pub outbox: Arc<dyn OutboxStore>,
    pub attempts: Arc<dyn AttemptLog>,
    /// Every table the sweepers may delete from; only those with a configured
    /// horizon get a sweeper.
    pub retention: Vec<Arc<dyn RetentionTarget>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let outbox = InMemoryOutboxStore::arc();
        let attempts = InMemoryAttemptLog::arc();
        Self {
            outbox: outbox.clone(),
            attempts: attempts.clone(),
            retention: vec![
                attempts as Arc<dyn RetentionTarget>,
                outbox as Arc<dyn RetentionTarget>,
            ],
        }
    }

    pub fn postgres(store: PostgresStore) -> Self {
        Self {
            outbox: Arc::new(store.clone()),
            attempts: Arc::new(store.clone()),
            retention: vec![
                Arc::new(store.retention(RetainedTable::LoginAttempts)) as Arc<dyn RetentionTarget>,
                Arc::new(store.retention(RetainedTable::OutboxItems)) as Arc<dyn RetentionTarget>,
            ],
        }
    }
}

pub struct Worker {
    registry: TaskRegistry,
    mailer: Mailer<Arc<dyn OutboxStore>, SystemClock>,
    stores: Stores,
    settings: Settings,
}

impl Worker {
    /// Register the outbox processor and one sweeper per configured horizon.
    /// Nothing runs until [`Worker::start`].
    pub fn build(settings: &Settings, stores: Stores, sender: Arc<dyn MessageSender>) -> anyhow::Result<Self> {
        settings.validate()?;
        let mut registry = TaskRegistry::new();

        let processor = OutboxProcessor::new(stores.outbox.clone(), sender, SystemClock)
            .with_policy(settings.delivery_policy());
        let nudger = registry.register(Arc::new(processor), settings.outbox_interval())?;

        for target in &stores.retention {
            let Some(days) = settings.horizon_days(target.entity()) else {
                continue;
            };
            let sweeper = RetentionSweeper::new(target.clone(), SystemClock, days)?;
            registry.register(Arc::new(sweeper), settings.retention_interval())?;
        }

        info!(tasks = ?registry, "worker configured");
        Ok(Self {
            registry,
            mailer: Mailer::new(stores.outbox.clone(), SystemClock, nudger),
            stores,
            settings: settings.clone(),
        })
    }

    pub fn start(&mut self) -> Result<(), SchedulerError> {
        self.registry.start_all()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Enqueue-and-nudge handle over the worker's outbox store.
    ///
    /// With Postgres stores every call blocks on the runtime, so call it off
    /// the runtime's worker threads (e.g. inside `tokio::task::spawn_blocking`).
    pub fn mailer(&self) -> &Mailer<Arc<dyn OutboxStore>, SystemClock> {
        &self.mailer
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Login flow over this worker's attempt log and lockout settings.
    ///
    /// With Postgres stores `login` blocks on the runtime, so call it off the
    /// runtime's worker threads (e.g. inside `tokio::task::spawn_blocking`).
    pub fn authenticator<V: CredentialVerifier>(
        &self,
        verifier: V,
    ) -> anyhow::Result<Authenticator<Arc<dyn AttemptLog>, V, SystemClock>> {
        Ok(Authenticator::new(
            self.stores.attempts.clone(),
            verifier,
            SystemClock,
            self.settings.lockout_policy()?,
        )
        .record_locked_attempts(self.settings.lockout.record_locked_attempts))
    }

    pub fn shutdown(self) {
        self.registry.shutdown();
    }
}
