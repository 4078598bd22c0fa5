//! Application context.
//!
//! [`Emissor`] opens the database once and wires every component to the same
//! handle, vault and activity log. Callers pick the pieces they need from it
//! instead of reaching for globals.

use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::db::Database;
use crate::delivery::DeliveryClient;
use crate::error::Result;
use crate::processor::QueueProcessor;
use crate::queue::DurableQueue;
use crate::registry::ReceiverRegistry;
use crate::reports::ReportStore;
use crate::translation::Translator;
use crate::trigger::EventTrigger;
use crate::vault::{Vault, VaultMode};

pub struct Emissor {
    config: Config,
    db: Arc<Database>,
    activity: ActivityLog,
    registry: Arc<ReceiverRegistry>,
    queue: Arc<DurableQueue>,
    reports: Arc<ReportStore>,
    delivery: DeliveryClient,
    translator: Option<Arc<Translator>>,
    vault_mode: VaultMode,
}

impl Emissor {
    /// Open the configured database file and build all components.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let path = config.resolved_database_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&path)?;
        tracing::debug!(path = %path.display(), "Database opened");
        Self::with_database(config, db)
    }

    /// Build all components over an in-memory database.
    pub fn open_in_memory(config: Config) -> Result<Self> {
        config.validate()?;
        Self::with_database(config, Database::open_in_memory()?)
    }

    fn with_database(config: Config, db: Database) -> Result<Self> {
        db.migrate()?;
        let db = Arc::new(db);
        let activity = ActivityLog::new(Arc::clone(&db));

        let vault = Vault::open(&db, &config.vault)?;
        let vault_mode = vault.mode();

        let registry = Arc::new(ReceiverRegistry::new(
            Arc::clone(&db),
            vault,
            config.receivers.clone(),
        ));
        let queue = Arc::new(DurableQueue::new(Arc::clone(&db), activity.clone()));
        let reports = Arc::new(ReportStore::new(
            Arc::clone(&db),
            activity.clone(),
            config.reports.clone(),
        ));
        let delivery = DeliveryClient::new(&config.delivery)?.with_activity_log(activity.clone());

        let translator = match &config.translation {
            Some(translation) => Some(Arc::new(
                Translator::from_config(translation)?.with_activity_log(activity.clone()),
            )),
            None => None,
        };

        Ok(Self {
            config,
            db,
            activity,
            registry,
            queue,
            reports,
            delivery,
            translator,
            vault_mode,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn registry(&self) -> &Arc<ReceiverRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn reports(&self) -> &Arc<ReportStore> {
        &self.reports
    }

    pub fn delivery(&self) -> &DeliveryClient {
        &self.delivery
    }

    pub fn vault_mode(&self) -> VaultMode {
        self.vault_mode
    }

    pub fn processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            self.delivery.clone(),
            Arc::clone(&self.reports),
            self.activity.clone(),
            self.config.queue.clone(),
            self.config.logging.retention_days,
        )
    }

    /// Event trigger acting on behalf of `actor_id`, if given.
    pub fn trigger(&self, actor_id: Option<i64>) -> EventTrigger {
        let activity = match actor_id {
            Some(id) => self.activity.with_actor(id),
            None => self.activity.clone(),
        };
        EventTrigger::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            self.translator.clone(),
            activity,
        )
    }
}
