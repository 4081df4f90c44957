//! Per-node processing pipeline.
//!
//! Every node gets one actor task that owns its mutable state: recent history,
//! alert sessions and writes that could not be persisted yet. Commands reach
//! the actor through a bounded mailbox, so records of one node are handled
//! strictly in arrival order while different nodes run in parallel.
//!
//! Telemetry flow inside the actor:
//!
//! 1. reject records stamped ahead of the service clock, and records not
//!    after the last accepted one (`OutOfOrder`)
//! 2. hydraulic state, head change, QC flags
//! 3. persist the observation and refresh the device registry, then reply
//! 4. weather consensus → forecast per horizon → alert sessions, persisted
//!
//! Every accepted record is evaluated. Scheduled re-evaluations are skipped
//! when they are not after the previous evaluation; a record that lands behind
//! a scheduled one is evaluated just after it instead.
//!
//! On start the actor restores the newest accepted record with the history
//! leading up to it, and the node's open alert events.
//!
//! Persistence failures never reject a record. The write is retried, then
//! kept in the actor's buffer and flushed ahead of the next write.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use utoipa::ToSchema;

use super::alerting::{AlertInput, AlertSession};
use super::forecast::ForecastEngine;
use super::hydraulic::{self, ProfileRegistry};
use super::ingest::{self, SchemaError};
use super::qc::{self, NodeHistory};
use super::weather::{ConsensusTarget, WeatherAggregator};
use crate::config::RulesConfig;
use crate::db::store::{PersistenceError, Store};
use crate::domain::{
    AlertEvent, ConsensusStatus, DeviceRecord, ForecastRecord, HydraulicState, QcFlags, TelemetryObservation,
    TelemetryRecord,
};

/// Commands a node mailbox holds before senders wait.
const MAILBOX_CAPACITY: usize = 64;

/// Attempts per store write before it is buffered.
const PERSIST_MAX_ATTEMPTS: u32 = 3;

/// First retry delay for store writes; doubles per attempt.
const PERSIST_BACKOFF_BASE_MS: u64 = 100;

/// Buffered writes kept per node; the oldest are dropped beyond this.
const MAX_BUFFERED_WRITES: usize = 10_000;

/// Gap between a record-driven evaluation and the one it has to follow.
const EVALUATION_STEP_SECS: i64 = 1;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("record for {node_id} at {ts} is not after the last accepted record at {last_ts}")]
    OutOfOrder {
        node_id: String,
        ts: DateTime<Utc>,
        last_ts: DateTime<Utc>,
    },
    #[error("pipeline for node {0} is not running")]
    NodeUnavailable(String),
}

/// What the sender learns about an accepted record.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IngestReceipt {
    pub node_id: String,
    pub ts: DateTime<Utc>,
    pub hydraulic: HydraulicState,
    pub dh_10m: Option<f64>,
    pub flags: QcFlags,
    /// False when the store was unreachable and the record is buffered
    pub persisted: bool,
}

/// Outcome of one forecast and alert evaluation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EvaluationSummary {
    pub node_id: String,
    pub ts: DateTime<Utc>,
    /// The evaluation instant was not after the previous one
    pub skipped: bool,
    pub consensus_status: Option<ConsensusStatus>,
    pub forecasts: usize,
    pub alerts: usize,
    /// Writes waiting for the store to come back
    pub buffered_writes: usize,
}

/// Everything the node actors share.
pub struct PipelineContext {
    pub store: Arc<dyn Store>,
    pub profiles: Arc<ProfileRegistry>,
    pub aggregator: Arc<WeatherAggregator>,
    pub rules: Arc<RulesConfig>,
    pub engine: ForecastEngine,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn Store>,
        profiles: Arc<ProfileRegistry>,
        aggregator: Arc<WeatherAggregator>,
        rules: Arc<RulesConfig>,
    ) -> Self {
        let engine = ForecastEngine::new(rules.forecast.clone());
        Self {
            store,
            profiles,
            aggregator,
            rules,
            engine,
        }
    }
}

/// Where weather is looked up for a node.
pub fn consensus_target(rules: &RulesConfig, node_id: &str) -> ConsensusTarget {
    let site = rules.site_for(node_id);
    ConsensusTarget {
        node_id: node_id.to_string(),
        latitude: site.latitude,
        longitude: site.longitude,
    }
}

/// Resolves once a dispatched record has been checked and persisted.
pub type IngestReply = oneshot::Receiver<Result<IngestReceipt, PipelineError>>;

enum NodeCommand {
    Telemetry {
        record: TelemetryRecord,
        reply: oneshot::Sender<Result<IngestReceipt, PipelineError>>,
    },
    Reevaluate {
        now: DateTime<Utc>,
        reply: oneshot::Sender<EvaluationSummary>,
    },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes commands to node actors, spawning one per node on first use.
pub struct NodeRouter {
    ctx: Arc<PipelineContext>,
    nodes: Mutex<HashMap<String, mpsc::Sender<NodeCommand>>>,
}

impl NodeRouter {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Start the actor for a node without sending it anything.
    pub fn register(&self, node_id: &str) {
        self.sender(node_id);
    }

    fn sender(&self, node_id: &str) -> mpsc::Sender<NodeCommand> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = nodes.get(node_id).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = NodeActor::new(node_id, self.ctx.clone());
        tokio::spawn(actor.run(rx));
        tracing::info!("Started pipeline for node {}", node_id);
        nodes.insert(node_id.to_string(), tx.clone());
        tx
    }

    /// Queue a normalized record on its node's mailbox without waiting for
    /// the outcome. Waits only while that mailbox is full.
    pub async fn dispatch(&self, record: TelemetryRecord) -> Result<IngestReply, PipelineError> {
        let node_id = record.node_id.clone();
        let (reply, response) = oneshot::channel();
        self.sender(&node_id)
            .send(NodeCommand::Telemetry { record, reply })
            .await
            .map_err(|_| PipelineError::NodeUnavailable(node_id))?;
        Ok(response)
    }

    /// Hand a normalized record to its node and wait until it has been
    /// checked and persisted (or buffered).
    pub async fn submit(&self, record: TelemetryRecord) -> Result<IngestReceipt, PipelineError> {
        let node_id = record.node_id.clone();
        self.dispatch(record)
            .await?
            .await
            .map_err(|_| PipelineError::NodeUnavailable(node_id))?
    }

    /// Re-run consensus, forecast and alerting for a node at `now`.
    pub async fn reevaluate(&self, node_id: &str, now: DateTime<Utc>) -> Result<EvaluationSummary, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.sender(node_id)
            .send(NodeCommand::Reevaluate { now, reply })
            .await
            .map_err(|_| PipelineError::NodeUnavailable(node_id.to_string()))?;
        response
            .await
            .map_err(|_| PipelineError::NodeUnavailable(node_id.to_string()))
    }

    /// Nodes with a running actor, sorted.
    pub fn known_nodes(&self) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = nodes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// Node actor
// ---------------------------------------------------------------------------

/// A store write waiting to be applied.
#[derive(Debug, Clone)]
enum PendingWrite {
    Telemetry(TelemetryObservation),
    Device(DeviceRecord),
    Forecast(ForecastRecord),
    Alert(AlertEvent),
}

impl PendingWrite {
    async fn apply(&self, store: &dyn Store) -> Result<(), PersistenceError> {
        match self {
            PendingWrite::Telemetry(obs) => store.insert_telemetry(obs).await,
            PendingWrite::Device(device) => store.upsert_device(device).await,
            PendingWrite::Forecast(forecast) => store.insert_forecast(forecast).await,
            PendingWrite::Alert(event) => store.upsert_alert(event).await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PendingWrite::Telemetry(_) => "telemetry",
            PendingWrite::Device(_) => "device",
            PendingWrite::Forecast(_) => "forecast",
            PendingWrite::Alert(_) => "alert",
        }
    }
}

async fn write_with_retry(store: &dyn Store, write: &PendingWrite) -> Result<(), PersistenceError> {
    let mut attempt = 0;
    loop {
        match write.apply(store).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_transient() || attempt + 1 >= PERSIST_MAX_ATTEMPTS => return Err(e),
            Err(e) => {
                tracing::debug!(
                    "Store {} write attempt {}/{} failed: {}",
                    write.kind(),
                    attempt + 1,
                    PERSIST_MAX_ATTEMPTS,
                    e
                );
                let delay = PERSIST_BACKOFF_BASE_MS << attempt;
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvaluationTrigger {
    Record,
    Schedule,
}

fn device_status(flags: &QcFlags) -> String {
    if flags.is_empty() {
        "ok".to_string()
    } else {
        "qc_flagged".to_string()
    }
}

struct NodeActor {
    node_id: String,
    ctx: Arc<PipelineContext>,
    history: NodeHistory,
    last_ts: Option<DateTime<Utc>>,
    registry_height: Option<f64>,
    sessions: BTreeMap<u32, AlertSession>,
    pending: VecDeque<PendingWrite>,
    /// Writes the store refused outright, since start
    rejected_writes: u64,
    last_eval_at: Option<DateTime<Utc>>,
}

impl NodeActor {
    fn new(node_id: &str, ctx: Arc<PipelineContext>) -> Self {
        let window = Duration::minutes(ctx.rules.qc.history_window_min);
        Self {
            node_id: node_id.to_string(),
            ctx,
            history: NodeHistory::new(window),
            last_ts: None,
            registry_height: None,
            sessions: BTreeMap::new(),
            pending: VecDeque::new(),
            rejected_writes: 0,
            last_eval_at: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<NodeCommand>) {
        self.hydrate().await;

        while let Some(command) = rx.recv().await {
            match command {
                NodeCommand::Telemetry { record, reply } => {
                    let ts = record.ts;
                    let result = self.accept(record).await;
                    let accepted = result.is_ok();
                    if reply.send(result).is_err() {
                        tracing::debug!("Ingest caller for {} went away before the reply", self.node_id);
                    }
                    if accepted {
                        self.evaluate(ts, EvaluationTrigger::Record).await;
                    }
                }
                NodeCommand::Reevaluate { now, reply } => {
                    let summary = self.evaluate(now, EvaluationTrigger::Schedule).await;
                    let _ = reply.send(summary);
                }
            }
        }
        tracing::debug!("Pipeline for node {} stopped", self.node_id);
    }

    /// Restore the registry height, the newest record with the history
    /// window before it, and open alerts from the store.
    async fn hydrate(&mut self) {
        let store = self.ctx.store.clone();
        match store.list_devices().await {
            Ok(devices) => {
                self.registry_height = devices
                    .into_iter()
                    .find(|d| d.node_id == self.node_id)
                    .and_then(|d| d.sensor_height_above_crest_m);
            }
            Err(e) => tracing::warn!("Could not read device registry for {}: {}", self.node_id, e),
        }

        match store.latest_telemetry(&self.node_id).await {
            Ok(Some(latest)) => {
                let to = latest.record.ts;
                let from = to - Duration::minutes(self.ctx.rules.qc.history_window_min);
                self.last_ts = Some(to);
                match store.telemetry_range(&self.node_id, from, to).await {
                    Ok(recent) => recent.into_iter().for_each(|obs| self.history.push(obs)),
                    Err(e) => {
                        tracing::warn!("Could not restore history for {}: {}", self.node_id, e);
                        self.history.push(latest);
                    }
                }
                tracing::info!(
                    "Restored {} observation(s) for {}, last accepted at {}",
                    self.history.len(),
                    self.node_id,
                    to
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read the last record of {}: {}", self.node_id, e),
        }

        match store.open_alerts(&self.node_id).await {
            Ok(open) => {
                for event in open {
                    tracing::info!(
                        "Resuming open {:?} alert {} for {}/{}h",
                        event.level,
                        event.id,
                        self.node_id,
                        event.horizon_h
                    );
                    let horizon_h = event.horizon_h;
                    if let Some(older) = self.sessions.insert(horizon_h, AlertSession::restore(event)) {
                        tracing::warn!(
                            "Several open alerts for {}/{}h, keeping the newest over {:?}",
                            self.node_id,
                            horizon_h,
                            older.confirmed()
                        );
                    }
                }
            }
            Err(e) => tracing::warn!("Could not restore open alerts for {}: {}", self.node_id, e),
        }
    }

    async fn accept(&mut self, record: TelemetryRecord) -> Result<IngestReceipt, PipelineError> {
        let max_skew = Duration::seconds(self.ctx.rules.ingest.max_clock_skew_secs);
        ingest::check_clock_skew(&record, Utc::now(), max_skew).inspect_err(|e| {
            tracing::warn!("Rejected record for {}: {}", self.node_id, e);
        })?;

        if let Some(last_ts) = self.last_ts.filter(|last| record.ts <= *last) {
            tracing::warn!(
                "Rejected out-of-order record for {} at {} (last accepted {})",
                self.node_id,
                record.ts,
                last_ts
            );
            return Err(PipelineError::OutOfOrder {
                node_id: self.node_id.clone(),
                ts: record.ts,
                last_ts,
            });
        }

        let rules = &self.ctx.rules;
        let site = rules.site_for(&self.node_id);
        let height = hydraulic::resolve_sensor_height(&record, self.registry_height, site);
        let profile = self.ctx.profiles.get(&self.node_id);
        let state = hydraulic::compute(record.dist_m, height, profile.as_deref());
        let dh_10m = qc::head_change(&rules.qc, &self.history, record.ts, state.h_m);
        let flags = qc::evaluate(&rules.qc, record.dist_m, &state, dh_10m);
        if !flags.is_empty() {
            tracing::debug!("QC flags for {} at {}: {}", self.node_id, record.ts, flags);
        }

        if record.sensor_height_above_crest_m.is_some() {
            self.registry_height = record.sensor_height_above_crest_m;
        }
        let device = DeviceRecord {
            node_id: self.node_id.clone(),
            last_seen: record.ts,
            batt_v: record.batt_v,
            sensor_height_above_crest_m: record.sensor_height_above_crest_m.or(self.registry_height),
            status: device_status(&flags),
        };

        let obs = TelemetryObservation {
            record,
            hydraulic: state,
            dh_10m,
            flags: flags.clone(),
        };
        let ts = obs.record.ts;
        self.last_ts = Some(ts);
        self.history.push(obs.clone());

        let persisted = self
            .persist(vec![PendingWrite::Telemetry(obs), PendingWrite::Device(device)])
            .await;

        Ok(IngestReceipt {
            node_id: self.node_id.clone(),
            ts,
            hydraulic: state,
            dh_10m,
            flags,
            persisted,
        })
    }

    async fn evaluate(&mut self, requested: DateTime<Utc>, trigger: EvaluationTrigger) -> EvaluationSummary {
        let ts = match self.last_eval_at {
            Some(last) if requested <= last => match trigger {
                EvaluationTrigger::Record => {
                    let ts = last + Duration::seconds(EVALUATION_STEP_SECS);
                    tracing::debug!(
                        "Record for {} at {} lands behind the evaluation at {}, evaluating at {}",
                        self.node_id,
                        requested,
                        last,
                        ts
                    );
                    ts
                }
                EvaluationTrigger::Schedule => requested,
            },
            _ => requested,
        };
        let mut summary = EvaluationSummary {
            node_id: self.node_id.clone(),
            ts,
            skipped: false,
            consensus_status: None,
            forecasts: 0,
            alerts: 0,
            buffered_writes: self.pending.len(),
        };
        if self.last_eval_at.is_some_and(|last| ts <= last) {
            summary.skipped = true;
            return summary;
        }
        self.last_eval_at = Some(ts);

        let rules = self.ctx.rules.clone();
        let target = consensus_target(&rules, &self.node_id);
        let cutoff = Duration::seconds(rules.weather.horizon_cutoff_secs);
        let consensus = self.ctx.aggregator.consensus(&target, ts, cutoff).await;

        let profile = self.ctx.profiles.get(&self.node_id);
        let outcome = self
            .ctx
            .engine
            .evaluate(&self.node_id, ts, &self.history, profile.as_deref(), &consensus);

        let mut writes: Vec<PendingWrite> = Vec::with_capacity(outcome.records.len() + 2);
        for record in &outcome.records {
            let session = self
                .sessions
                .entry(record.horizon_h)
                .or_insert_with(|| AlertSession::new(&self.node_id, record.horizon_h));
            let input = AlertInput {
                ts,
                probability: record.probability,
                rise_10m: outcome.inputs.rise_10m,
                rain_mm: outcome.inputs.rain_mm,
            };
            writes.push(PendingWrite::Forecast(record.clone()));
            if let Some(transition) = session.evaluate(&rules.alert, &input) {
                if let Some(superseded) = transition.superseded {
                    writes.push(PendingWrite::Alert(superseded));
                }
                writes.push(PendingWrite::Alert(transition.event));
                summary.alerts += 1;
            }
        }

        summary.consensus_status = Some(consensus.status);
        summary.forecasts = outcome.records.len();
        self.persist(writes).await;
        summary.buffered_writes = self.pending.len();
        summary
    }

    /// Queue writes behind any buffered ones and flush. True when nothing is
    /// left buffered and the store refused none of them.
    async fn persist(&mut self, writes: Vec<PendingWrite>) -> bool {
        let rejected = self.rejected_writes;
        self.pending.extend(writes);
        while self.pending.len() > MAX_BUFFERED_WRITES {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::error!(
                    "Write buffer for {} is full, dropping oldest {} write",
                    self.node_id,
                    dropped.kind()
                );
            }
        }
        self.flush().await && self.rejected_writes == rejected
    }

    async fn flush(&mut self) -> bool {
        let flushing = self.pending.len();
        while let Some(write) = self.pending.front() {
            match write_with_retry(self.ctx.store.as_ref(), write).await {
                Ok(()) => {}
                Err(e) if !e.is_transient() => {
                    tracing::error!(
                        "Store refused {} write for {}, dropping it: {}",
                        write.kind(),
                        self.node_id,
                        e
                    );
                    self.rejected_writes += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Store write for {} failed, {} write(s) buffered: {}",
                        self.node_id,
                        self.pending.len(),
                        e
                    );
                    return false;
                }
            }
            self.pending.pop_front();
        }
        if flushing > 0 {
            tracing::debug!("Flushed {} write(s) for {}", flushing, self.node_id);
        }
        true
    }
}
