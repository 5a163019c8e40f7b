//! One party process: the components of a party wired together.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::context::PartyContext;
use crate::controller::{JobController, PartyController, TaskController};
use crate::detector::{Detector, spawn_detect_ticker};
use crate::engine::EngineRegistry;
use crate::error::Error;
use crate::federation::routes::routes;
use crate::federation::{CommandHandler, CommandService, FederatedClient, Federation};
use crate::resource::{ResourceLedger, ResourceManager};
use crate::scheduler::{JobScheduler, TaskScheduler, spawn_schedule_ticker};
use crate::store::Database;

pub struct Node {
    pub ctx: Arc<PartyContext>,
    pub party: Arc<PartyController>,
    pub jobs: Arc<JobController>,
    pub scheduler: Arc<JobScheduler>,
    pub detector: Arc<Detector>,
    service: Arc<dyn CommandService>,
}

impl Node {
    /// Prepare the store, size the resource pools of every registered engine
    /// and build the party's components. Register engines before calling.
    pub async fn start(
        config: Config,
        db: Arc<dyn Database>,
        engines: Arc<EngineRegistry>,
        transport: Arc<dyn Federation>,
    ) -> Result<Self, Error> {
        db.init_schema().await?;

        let config = Arc::new(config);
        let client = FederatedClient::new(config.party_id.clone(), transport);
        let ctx = Arc::new(PartyContext::new(
            Arc::clone(&config),
            Arc::clone(&db),
            Arc::clone(&engines),
            client.clone(),
        ));

        let ledger = Arc::new(ResourceLedger::new(db, engines));
        ledger.ensure_pools(config.total_cores).await?;

        let party = Arc::new(PartyController::new(Arc::clone(&ctx), ledger));
        let tasks = Arc::new(TaskController::new(Arc::clone(&ctx), Arc::clone(&party)));
        let resources = Arc::new(ResourceManager::new(client));
        let jobs = Arc::new(JobController::new(
            Arc::clone(&ctx),
            Arc::clone(&party),
            Arc::clone(&tasks),
            Arc::clone(&resources),
        ));
        let task_scheduler = Arc::new(TaskScheduler::new(Arc::clone(&ctx), tasks, Arc::clone(&resources)));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&ctx),
            Arc::clone(&jobs),
            task_scheduler,
            resources,
        ));
        let detector = Arc::new(Detector::new(Arc::clone(&ctx), Arc::clone(&party)));
        let service: Arc<dyn CommandService> = Arc::new(CommandHandler::new(Arc::clone(&party)));

        let engine_names = ctx.engines.names().await;
        info!(
            party_id = %config.party_id,
            instance_id = %config.instance_id,
            engines = ?engine_names,
            "Party node ready"
        );
        Ok(Self {
            ctx,
            party,
            jobs,
            scheduler,
            detector,
            service,
        })
    }

    /// Inbound command handler, for in-process transports.
    pub fn service(&self) -> Arc<dyn CommandService> {
        Arc::clone(&self.service)
    }

    pub fn router(&self) -> Router {
        routes(self.service(), Arc::clone(&self.jobs))
    }

    /// Spawn the schedule and detect loops.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let config = &self.ctx.config;
        vec![
            spawn_schedule_ticker(Arc::clone(&self.scheduler), config.schedule_interval),
            spawn_detect_ticker(Arc::clone(&self.detector), config.detect_interval),
        ]
    }
}
