//! Supervisor handle: owns every subsystem's lifecycle and cancels them
//! on shutdown. Subsystems are explicit handles passed through
//! construction rather than singletons reached via module globals.

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::AggregatorEngine;
use crate::alert_evaluator::AlertEvaluator;
use crate::config::CoreConfig;
use crate::evacuation::EvacuationPlanner;
use crate::geo_index::GeoIndex;
use crate::ingest_gateway::IngestGateway;
use crate::model::{RuleConfig, SensorKind};
use crate::notification::{HttpSmsGateway, NotificationDispatcher, SmsGateway};
use crate::road_graph::RoadGraph;
use crate::state_store::StateStore;
use crate::time_store::TimeStore;

pub struct Core {
    pub config: CoreConfig,
    pub geo_index: Arc<GeoIndex>,
    pub road_graph: Arc<RoadGraph>,
    pub time_store: Arc<TimeStore>,
    pub aggregator: Arc<AggregatorEngine>,
    pub alert_evaluator: Arc<AlertEvaluator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub planner: Arc<EvacuationPlanner>,
    pub ingest: Arc<IngestGateway>,
    pub state_store: Arc<StateStore>,
}

impl Core {
    pub fn build(
        pool: PgPool,
        config: CoreConfig,
        rules: HashMap<SensorKind, RuleConfig>,
        recipients: Vec<String>,
    ) -> Arc<Self> {
        let geo_index = Arc::new(GeoIndex::new());
        let road_graph = Arc::new(RoadGraph::new());
        let time_store = Arc::new(TimeStore::new(pool.clone(), &config));
        let aggregator = Arc::new(AggregatorEngine::new(pool.clone(), time_store.clone()));
        let state_store = Arc::new(StateStore::new(pool.clone(), geo_index.clone(), road_graph.clone()));

        let gateway: Arc<dyn SmsGateway> =
            Arc::new(HttpSmsGateway::new(config.sms_gateway_base_url.clone()));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            pool,
            gateway,
            recipients,
            config.dispatch_retry.clone(),
            config.dispatch_parallelism,
        ));

        let alert_evaluator = Arc::new(AlertEvaluator::new(
            state_store.clone(),
            aggregator.clone(),
            geo_index.clone(),
            dispatcher.clone(),
            rules,
            &config,
        ));

        let planner = Arc::new(EvacuationPlanner::new(road_graph.clone()));
        let ingest = Arc::new(IngestGateway::new(
            time_store.clone(),
            aggregator.clone(),
            alert_evaluator.clone(),
            &config,
        ));

        Arc::new(Self {
            config,
            geo_index,
            road_graph,
            time_store,
            aggregator,
            alert_evaluator,
            dispatcher,
            planner,
            ingest,
            state_store,
        })
    }

    /// Starts every long-lived background loop, each cancellable from the
    /// same token (supervisor note).
    pub async fn load_and_run(self: &Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        self.state_store.refresh_geo_index().await?;
        self.state_store.reload_road_graph().await?;

        let aggregator = self.aggregator.clone();
        let aggregator_cancel = cancel.clone();
        tokio::spawn(async move { aggregator.start(aggregator_cancel).await });

        Ok(())
    }
}
