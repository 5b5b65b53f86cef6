use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::types::{now_ms, SendCommand, UnifiedMessage};
use crate::agents::AgentRegistry;
use crate::ai::types::ComplexityTier;
use crate::ai::{AiRouter, AiTask};
use crate::bus::CrossAgentBus;
use crate::flows::interpolate::{render, render_value, resolve_path};
use crate::flows::triggers::TriggerMatcher;
use crate::flows::types::{
    ExecutionStatus, FlowDefinition, FlowEdge, FlowNode, NodeKind, Predicate, PredicateOp,
};
use crate::flows::{FlowService, TriggerWork};
use crate::scheduler::Scheduler;
use crate::storage::{ExecutionRow, Persistence};
use crate::utils::{HubError, HubMetrics};

/// External RAG collaborator. The executor only ever calls `query`.
#[async_trait::async_trait]
pub trait RagClient: Send + Sync {
    async fn query(
        &self,
        libraries: &[String],
        text: &str,
        k: usize,
    ) -> Result<Vec<Value>, HubError>;
}

/// Default no-op collaborator for deployments without a RAG stack.
pub struct NoopRagClient;

#[async_trait::async_trait]
impl RagClient for NoopRagClient {
    async fn query(&self, _: &[String], _: &str, _: usize) -> Result<Vec<Value>, HubError> {
        Ok(Vec::new())
    }
}

/// Execution limits, configurable per deployment.
#[derive(Debug, Clone)]
pub struct FlowEngineConfig {
    pub execution_timeout: Duration,
    pub max_nodes: usize,
    pub max_loop_iterations: usize,
    pub max_concurrent_per_agent: usize,
    pub max_subflow_depth: usize,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(300),
            max_nodes: 500,
            max_loop_iterations: 1000,
            max_concurrent_per_agent: 10,
            max_subflow_depth: 4,
        }
    }
}

/// Runtime state of one execution.
struct ExecutionContext {
    execution_id: String,
    flow: Arc<FlowDefinition>,
    tenant: String,
    trigger_event: Value,
    variables: Value,
    node_results: HashMap<String, Value>,
    unresolved_templates: Vec<String>,
    nodes_executed: usize,
    subflow_depth: usize,
}

impl ExecutionContext {
    /// The interpolation root every template resolves against.
    fn root(&self) -> Value {
        json!({
            "trigger": self.trigger_event,
            "vars": self.variables,
            "node": self.node_results,
            "execution": {"id": self.execution_id, "flowId": self.flow.flow_id},
        })
    }

    fn render(&mut self, template: &str) -> String {
        let root = self.root();
        render(template, &root, &mut self.unresolved_templates)
    }

    fn render_value(&mut self, template: &str) -> Value {
        let root = self.root();
        render_value(template, &root, &mut self.unresolved_templates)
    }

    /// Set a dotted-path variable, creating intermediate objects.
    fn set_var(&mut self, path: &str, value: Value) {
        let mut current = &mut self.variables;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            if i == segments.len() - 1 {
                if let Value::Object(map) = current {
                    map.insert(segment.to_string(), value);
                }
                return;
            }
            if !current.is_object() {
                return;
            }
            let map = current.as_object_mut().expect("checked object");
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| json!({}));
            if !current.is_object() {
                *current = json!({});
            }
        }
    }
}

/// How a node finished.
enum NodeOutcome {
    /// Completed with a result and an optional routing value for labeled
    /// out-edges.
    Done {
        result: Value,
        routing: Option<String>,
    },
    /// Suspend the execution until the scheduler wakes it.
    Suspend { wake_at: i64 },
}

/// Runs flow executions: topological dispatch with edge conditions, node
/// retries, durable delay suspension and the per-agent concurrency cap.
pub struct FlowEngine {
    flows: Arc<FlowService>,
    matcher: Arc<TriggerMatcher>,
    registry: Arc<AgentRegistry>,
    bus: Arc<CrossAgentBus>,
    ai: Arc<AiRouter>,
    rag: Arc<dyn RagClient>,
    scheduler: Arc<Scheduler>,
    persistence: Arc<Persistence>,
    metrics: Arc<HubMetrics>,
    config: FlowEngineConfig,
    agent_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    running: Mutex<HashMap<String, tokio::task::AbortHandle>>,
}

impl FlowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flows: Arc<FlowService>,
        matcher: Arc<TriggerMatcher>,
        registry: Arc<AgentRegistry>,
        bus: Arc<CrossAgentBus>,
        ai: Arc<AiRouter>,
        rag: Arc<dyn RagClient>,
        scheduler: Arc<Scheduler>,
        persistence: Arc<Persistence>,
        metrics: Arc<HubMetrics>,
        config: FlowEngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows,
            matcher,
            registry,
            bus,
            ai,
            rag,
            scheduler,
            persistence,
            metrics,
            config,
            agent_slots: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Consume the trigger work queue. One dispatcher per engine.
    pub fn spawn_dispatcher(self: &Arc<Self>, mut rx: mpsc::Receiver<TriggerWork>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                engine.dispatch(work).await;
            }
            info!("Flow engine dispatcher stopped");
        });
    }

    async fn dispatch(self: &Arc<Self>, work: TriggerWork) {
        match work {
            TriggerWork::Inbound {
                agent_id,
                tenant,
                message,
            } => {
                let matched = self.matcher.matches_for_message(&agent_id, &message).await;
                for flow in matched {
                    self.spawn_execution(flow, tenant.clone(), trigger_event_for(&message), None)
                        .await;
                }
            }
            TriggerWork::CrossAgent {
                target_agent_id,
                source_agent_id,
                tenant,
                flow_name,
                payload,
                reply,
            } => {
                match self
                    .matcher
                    .resolve_cross_agent(&target_agent_id, &flow_name, &source_agent_id)
                    .await
                {
                    Ok(flow) => {
                        let event = json!({
                            "kind": "cross-agent",
                            "sourceAgentId": source_agent_id,
                            "payload": payload,
                        });
                        self.spawn_execution(flow, tenant, event, Some(reply)).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            TriggerWork::Broadcast {
                agent_id,
                tenant,
                topic,
                payload,
            } => {
                let matched = self.matcher.broadcast_flows(&agent_id, &topic).await;
                for flow in matched {
                    let event = json!({"kind": "broadcast", "topic": topic, "payload": payload});
                    self.spawn_execution(flow, tenant.clone(), event, None).await;
                }
            }
            TriggerWork::Manual {
                agent_id,
                flow_id,
                payload,
                reply,
            } => match self.flows.get(&flow_id).await {
                Some(flow) if flow.agent_id == agent_id => {
                    let Some(tenant) = self.registry.tenant_of(&agent_id).await else {
                        let _ = reply.send(Err(HubError::UnknownAgent(agent_id)));
                        return;
                    };
                    let event = json!({"kind": "manual", "payload": payload});
                    let execution_id = self.spawn_execution(flow, tenant, event, None).await;
                    let _ = reply.send(Ok(execution_id));
                }
                _ => {
                    let _ = reply.send(Err(HubError::Validation(format!(
                        "flow {} not found for agent {}",
                        flow_id, agent_id
                    ))));
                }
            },
            TriggerWork::Webhook {
                agent_id,
                path,
                payload,
            } => {
                let matched = self.matcher.webhook_flows(&agent_id, &path).await;
                if let Some(tenant) = self.registry.tenant_of(&agent_id).await {
                    for flow in matched {
                        let event = json!({"kind": "webhook", "path": path, "payload": payload});
                        self.spawn_execution(flow, tenant.clone(), event, None).await;
                    }
                }
            }
            TriggerWork::Scheduled { agent_id, flow_id } => {
                if let Some(flow) = self.flows.get(&flow_id).await {
                    if flow.agent_id == agent_id && flow.active {
                        if let Some(tenant) = self.registry.tenant_of(&agent_id).await {
                            let event = json!({"kind": "schedule", "firedAt": now_ms()});
                            self.spawn_execution(flow, tenant, event, None).await;
                        }
                    }
                }
            }
            TriggerWork::Resume { execution_id } => {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.resume_execution(&execution_id).await {
                        error!(execution_id = %execution_id, error = %e,
                               "Failed to resume execution");
                    }
                });
            }
        }
    }

    /// Launch one execution task. Returns the generated execution ID.
    pub async fn spawn_execution(
        self: &Arc<Self>,
        flow: Arc<FlowDefinition>,
        tenant: String,
        trigger_event: Value,
        reply: Option<oneshot::Sender<Result<Value, HubError>>>,
    ) -> String {
        let execution_id = Uuid::new_v4().to_string();
        let engine = self.clone();
        let id_for_task = execution_id.clone();

        // Hold the tracking lock across the spawn so the task's removal
        // cannot run before the abort handle is registered.
        let mut running = self.running.lock().await;
        let task = tokio::spawn(async move {
            let result = engine
                .run_execution(&id_for_task, flow, tenant, trigger_event, false)
                .await;
            engine.running.lock().await.remove(&id_for_task);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
        running.insert(execution_id.clone(), task.abort_handle());

        execution_id
    }

    /// Cancel a running execution. Cooperative: the task is aborted at its
    /// next suspension point.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let handle = self.running.lock().await.remove(execution_id);
        match handle {
            Some(handle) => {
                handle.abort();
                let _ = self
                    .persistence
                    .finish_execution(execution_id, ExecutionStatus::Cancelled.as_str(), None, None)
                    .await;
                info!(execution_id = %execution_id, "Execution cancelled");
                true
            }
            None => false,
        }
    }

    async fn agent_slot(&self, agent_id: &str) -> Arc<Semaphore> {
        let mut slots = self.agent_slots.lock().await;
        slots
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_agent)))
            .clone()
    }

    async fn run_execution(
        self: &Arc<Self>,
        execution_id: &str,
        flow: Arc<FlowDefinition>,
        tenant: String,
        trigger_event: Value,
        resumed: bool,
    ) -> Result<Value, HubError> {
        let slot = self.agent_slot(&flow.agent_id).await;
        let Ok(_permit) = slot.try_acquire_owned() else {
            let row = ExecutionRow {
                execution_id: execution_id.to_string(),
                flow_id: flow.flow_id.clone(),
                agent_id: flow.agent_id.clone(),
                status: ExecutionStatus::LimitExceeded.as_str().to_string(),
                trigger_event: trigger_event.clone(),
                variables: json!({}),
                started_at: now_ms(),
                finished_at: Some(now_ms()),
                error_kind: Some("limit_exceeded".to_string()),
                error_node: None,
                resumption_token: None,
                wake_at: None,
            };
            let _ = self.persistence.insert_execution(&row).await;
            self.metrics.executions_failed.inc();
            return Err(HubError::Busy { retry_after_ms: 1000 });
        };

        let mut ctx = ExecutionContext {
            execution_id: execution_id.to_string(),
            flow: flow.clone(),
            tenant,
            trigger_event,
            variables: json!({}),
            node_results: HashMap::new(),
            unresolved_templates: Vec::new(),
            nodes_executed: 0,
            subflow_depth: 0,
        };

        let mut completed: HashSet<String> = HashSet::new();
        let mut failed_handled: HashSet<String> = HashSet::new();

        if resumed {
            match self.rehydrate(&mut ctx, &mut completed).await {
                Ok(()) => {}
                Err(e) => {
                    self.finish(&ctx, ExecutionStatus::Failed, Some(e.code()), None)
                        .await;
                    return Err(e);
                }
            }
        } else {
            let row = ExecutionRow {
                execution_id: execution_id.to_string(),
                flow_id: flow.flow_id.clone(),
                agent_id: flow.agent_id.clone(),
                status: ExecutionStatus::Running.as_str().to_string(),
                trigger_event: ctx.trigger_event.clone(),
                variables: json!({}),
                started_at: now_ms(),
                finished_at: None,
                error_kind: None,
                error_node: None,
                resumption_token: None,
                wake_at: None,
            };
            if let Err(e) = self.persistence.insert_execution(&row).await {
                error!(execution_id = %execution_id, error = %e,
                       "Failed to record execution start");
            }
            self.metrics.executions_started.inc();
        }

        debug!(execution_id = %execution_id, flow_id = %flow.flow_id, resumed,
               "Execution running");

        let walk = self.walk_graph(&mut ctx, &mut completed, &mut failed_handled);
        match tokio::time::timeout(self.config.execution_timeout, walk).await {
            Ok(Ok(Some(wake_at))) => {
                // Delay suspension: durable token written, scheduler armed.
                self.scheduler
                    .schedule_resume(wake_at, execution_id)
                    .await;
                debug!(execution_id = %execution_id, wake_at, "Execution suspended");
                Ok(json!({"suspended": true}))
            }
            Ok(Ok(None)) => {
                self.finish(&ctx, ExecutionStatus::Succeeded, None, None).await;
                self.metrics.executions_succeeded.inc();
                let result = resolve_path(&ctx.variables, "result")
                    .unwrap_or_else(|| Value::Null);
                Ok(result)
            }
            Ok(Err((node_id, e))) => {
                let status = match &e {
                    HubError::LimitExceeded(_) => ExecutionStatus::LimitExceeded,
                    _ => ExecutionStatus::Failed,
                };
                self.finish(&ctx, status, Some(e.code()), node_id.as_deref()).await;
                self.metrics.executions_failed.inc();
                Err(e)
            }
            Err(_) => {
                self.finish(&ctx, ExecutionStatus::TimedOut, Some("timeout"), None)
                    .await;
                self.metrics.executions_failed.inc();
                Err(HubError::LimitExceeded(format!(
                    "execution exceeded {}s wall clock",
                    self.config.execution_timeout.as_secs()
                )))
            }
        }
    }

    async fn resume_execution(self: &Arc<Self>, execution_id: &str) -> Result<(), HubError> {
        let Some(row) = self
            .persistence
            .get_execution(execution_id)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?
        else {
            return Err(HubError::Validation(format!(
                "unknown execution {}",
                execution_id
            )));
        };
        if !self
            .persistence
            .claim_resumption(execution_id)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?
        {
            debug!(execution_id = %execution_id, status = %row.status,
                   "Skipping resume of non-suspended execution");
            return Ok(());
        }
        let Some(flow) = self.flows.get(&row.flow_id).await else {
            self.persistence
                .finish_execution(execution_id, ExecutionStatus::Failed.as_str(), Some("validation"), None)
                .await
                .ok();
            return Err(HubError::Validation(format!(
                "flow {} no longer exists",
                row.flow_id
            )));
        };

        let tenant = self
            .registry
            .tenant_of(&row.agent_id)
            .await
            .unwrap_or_default();

        let engine = self.clone();
        let execution_id = execution_id.to_string();
        let trigger_event = row.trigger_event.clone();
        tokio::spawn(async move {
            let _ = engine
                .run_execution(&execution_id, flow, tenant, trigger_event, true)
                .await;
        });
        Ok(())
    }

    /// Rebuild context from persisted state: variables from the suspension
    /// snapshot, completed set from node results, and the suspension token's
    /// node marked done.
    async fn rehydrate(
        &self,
        ctx: &mut ExecutionContext,
        completed: &mut HashSet<String>,
    ) -> Result<(), HubError> {
        let row = self
            .persistence
            .get_execution(&ctx.execution_id)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?
            .ok_or_else(|| HubError::Validation("execution row vanished".into()))?;

        ctx.variables = if row.variables.is_object() {
            row.variables
        } else {
            json!({})
        };

        let results = self
            .persistence
            .load_node_results(&ctx.execution_id)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?;
        for (node_id, value) in results {
            completed.insert(node_id.clone());
            ctx.node_results.insert(node_id, value);
            ctx.nodes_executed += 1;
        }

        if let Some(token) = row.resumption_token {
            completed.insert(token.clone());
            ctx.node_results.entry(token).or_insert(json!({"delayed": true}));
        }
        Ok(())
    }

    /// Level-wise topological walk. Returns `Some(wake_at)` when the
    /// execution suspends, `None` when it runs to completion.
    async fn walk_graph(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        completed: &mut HashSet<String>,
        failed_handled: &mut HashSet<String>,
    ) -> Result<Option<i64>, (Option<String>, HubError)> {
        let flow = ctx.flow.clone();
        let mut skipped: HashSet<String> = HashSet::new();

        loop {
            let ready = self.ready_nodes(&flow, ctx, completed, failed_handled, &mut skipped);
            if ready.is_empty() {
                return Ok(None);
            }

            if ctx.nodes_executed + ready.len() > self.config.max_nodes {
                return Err((
                    None,
                    HubError::LimitExceeded(format!(
                        "execution exceeds {} node limit",
                        self.config.max_nodes
                    )),
                ));
            }

            if ready.len() == 1 {
                let node = ready.into_iter().next().expect("len checked").clone();
                match self.run_node_with_retry(ctx, &node).await {
                    Ok(NodeOutcome::Done { result, routing }) => {
                        self.record_node(ctx, &node.node_id, result, routing, completed)
                            .await;
                    }
                    Ok(NodeOutcome::Suspend { wake_at }) => {
                        self.persist_suspension(ctx, &node.node_id, wake_at).await;
                        return Ok(Some(wake_at));
                    }
                    Err(e) => {
                        if has_error_edge(&flow, &node.node_id) {
                            warn!(execution_id = %ctx.execution_id, node = %node.node_id,
                                  error = %e, "Node failed, taking error edge");
                            ctx.node_results
                                .insert(node.node_id.clone(), json!({"error": e.to_string()}));
                            failed_handled.insert(node.node_id.clone());
                            ctx.nodes_executed += 1;
                        } else {
                            return Err((Some(node.node_id.clone()), e));
                        }
                    }
                }
            } else {
                // Explicit parallel fan-out: run the whole ready set
                // concurrently; delay nodes are not allowed inside a fan-out.
                let futures: Vec<_> = ready
                    .iter()
                    .map(|node| {
                        let mut branch_ctx = ExecutionContext {
                            execution_id: ctx.execution_id.clone(),
                            flow: ctx.flow.clone(),
                            tenant: ctx.tenant.clone(),
                            trigger_event: ctx.trigger_event.clone(),
                            variables: ctx.variables.clone(),
                            node_results: ctx.node_results.clone(),
                            unresolved_templates: Vec::new(),
                            nodes_executed: ctx.nodes_executed,
                            subflow_depth: ctx.subflow_depth,
                        };
                        let engine = self.clone();
                        let node = (*node).clone();
                        async move {
                            let outcome = engine.run_node_with_retry(&mut branch_ctx, &node).await;
                            (node, outcome, branch_ctx)
                        }
                    })
                    .collect();

                for (node, outcome, branch_ctx) in join_all(futures).await {
                    ctx.unresolved_templates
                        .extend(branch_ctx.unresolved_templates);
                    merge_vars(&mut ctx.variables, branch_ctx.variables);
                    match outcome {
                        Ok(NodeOutcome::Done { result, routing }) => {
                            self.record_node(ctx, &node.node_id, result, routing, completed)
                                .await;
                        }
                        Ok(NodeOutcome::Suspend { .. }) => {
                            return Err((
                                Some(node.node_id.clone()),
                                HubError::Validation(
                                    "delay nodes cannot sit inside a parallel fan-out".into(),
                                ),
                            ));
                        }
                        Err(e) => {
                            if has_error_edge(&flow, &node.node_id) {
                                ctx.node_results
                                    .insert(node.node_id.clone(), json!({"error": e.to_string()}));
                                failed_handled.insert(node.node_id.clone());
                                ctx.nodes_executed += 1;
                            } else {
                                return Err((Some(node.node_id.clone()), e));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Nodes whose in-edges are all settled and at least one taken edge
    /// points at them. Untaken branches are skipped transitively.
    fn ready_nodes<'a>(
        &self,
        flow: &'a FlowDefinition,
        ctx: &ExecutionContext,
        completed: &HashSet<String>,
        failed_handled: &HashSet<String>,
        skipped: &mut HashSet<String>,
    ) -> Vec<&'a FlowNode> {
        loop {
            let mut newly_skipped = Vec::new();
            for node in &flow.nodes {
                if completed.contains(&node.node_id)
                    || skipped.contains(&node.node_id)
                    || failed_handled.contains(&node.node_id)
                {
                    continue;
                }
                let in_edges = flow.in_edges(&node.node_id);
                if in_edges.is_empty() {
                    continue;
                }
                let all_settled = in_edges.iter().all(|e| {
                    completed.contains(&e.from)
                        || skipped.contains(&e.from)
                        || failed_handled.contains(&e.from)
                });
                if !all_settled {
                    continue;
                }
                let any_taken = in_edges
                    .iter()
                    .any(|e| self.edge_taken(e, ctx, completed, failed_handled));
                if !any_taken {
                    newly_skipped.push(node.node_id.clone());
                }
            }
            if newly_skipped.is_empty() {
                break;
            }
            skipped.extend(newly_skipped);
        }

        flow.nodes
            .iter()
            .filter(|node| {
                if completed.contains(&node.node_id)
                    || skipped.contains(&node.node_id)
                    || failed_handled.contains(&node.node_id)
                {
                    return false;
                }
                let in_edges = flow.in_edges(&node.node_id);
                if in_edges.is_empty() {
                    // Entry node runs exactly once.
                    return node.kind == NodeKind::Trigger;
                }
                let all_settled = in_edges.iter().all(|e| {
                    completed.contains(&e.from)
                        || skipped.contains(&e.from)
                        || failed_handled.contains(&e.from)
                });
                all_settled
                    && in_edges
                        .iter()
                        .any(|e| self.edge_taken(e, ctx, completed, failed_handled))
            })
            .collect()
    }

    fn edge_taken(
        &self,
        edge: &FlowEdge,
        ctx: &ExecutionContext,
        completed: &HashSet<String>,
        failed_handled: &HashSet<String>,
    ) -> bool {
        if edge.on_error {
            return failed_handled.contains(&edge.from);
        }
        if !completed.contains(&edge.from) {
            return false;
        }
        if let Some(when) = &edge.when {
            let routing = ctx
                .node_results
                .get(&edge.from)
                .and_then(|r| r.get("routing"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if routing != when {
                return false;
            }
        }
        if let Some(predicate) = &edge.predicate {
            let root = ctx.root();
            if !eval_predicate(predicate, &root) {
                return false;
            }
        }
        true
    }

    async fn record_node(
        &self,
        ctx: &mut ExecutionContext,
        node_id: &str,
        result: Value,
        routing: Option<String>,
        completed: &mut HashSet<String>,
    ) {
        let stored = match routing {
            Some(routing) => json!({"value": result, "routing": routing}),
            None => json!({"value": result}),
        };
        ctx.node_results.insert(node_id.to_string(), stored.clone());
        ctx.nodes_executed += 1;
        completed.insert(node_id.to_string());

        if let Err(e) = self
            .persistence
            .save_node_result(&ctx.execution_id, node_id, &stored)
            .await
        {
            warn!(execution_id = %ctx.execution_id, node = %node_id, error = %e,
                  "Failed to persist node result");
        }
    }

    async fn persist_suspension(&self, ctx: &ExecutionContext, node_id: &str, wake_at: i64) {
        if let Err(e) = self
            .persistence
            .suspend_execution(&ctx.execution_id, node_id, &ctx.variables, wake_at)
            .await
        {
            error!(execution_id = %ctx.execution_id, error = %e,
                   "Failed to persist suspension token");
        }
    }

    async fn finish(
        &self,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
        error_kind: Option<&str>,
        error_node: Option<&str>,
    ) {
        if let Err(e) = self
            .persistence
            .finish_execution(&ctx.execution_id, status.as_str(), error_kind, error_node)
            .await
        {
            error!(execution_id = %ctx.execution_id, error = %e,
                   "Failed to record execution finish");
        }
        if !ctx.unresolved_templates.is_empty() {
            debug!(execution_id = %ctx.execution_id,
                   unresolved = ?ctx.unresolved_templates,
                   "Templates with unresolved references");
        }
    }

    async fn run_node_with_retry(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        node: &FlowNode,
    ) -> Result<NodeOutcome, HubError> {
        let attempts = node.retry.map(|r| r.count + 1).unwrap_or(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = node
                    .retry
                    .map(|r| r.delay_for_attempt(attempt - 1))
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                debug!(execution_id = %ctx.execution_id, node = %node.node_id, attempt,
                       "Retrying node");
            }

            let run = self.execute_node(ctx, node);
            let result = match node.timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), run).await {
                    Ok(r) => r,
                    Err(_) => Err(HubError::Transient(format!(
                        "node {} timed out after {}ms",
                        node.node_id, ms
                    ))),
                },
                None => run.await,
            };

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| HubError::Fatal("retry loop fell through".into())))
    }

    async fn execute_node(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        node: &FlowNode,
    ) -> Result<NodeOutcome, HubError> {
        let config = node.config.clone();
        match node.kind {
            NodeKind::Trigger => Ok(NodeOutcome::Done {
                result: ctx.trigger_event.clone(),
                routing: None,
            }),

            NodeKind::SendMessage => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let body = ctx.render(config.get("body").and_then(|v| v.as_str()).unwrap_or(""));
                let reply_to = config
                    .get("replyTo")
                    .and_then(|v| v.as_str())
                    .map(|t| ctx.render(t))
                    .filter(|s| !s.is_empty());
                let receipt = self
                    .send_for_agent(ctx, SendCommand::Text { chat_id, body, reply_to })
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::SendMedia => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let media_key =
                    ctx.render(config.get("mediaKey").and_then(|v| v.as_str()).unwrap_or(""));
                let mime_type = ctx.render(
                    config
                        .get("mimeType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("application/octet-stream"),
                );
                let caption =
                    ctx.render(config.get("caption").and_then(|v| v.as_str()).unwrap_or(""));
                let file_name = config
                    .get("fileName")
                    .and_then(|v| v.as_str())
                    .map(|t| ctx.render(t));
                let receipt = self
                    .send_for_agent(
                        ctx,
                        SendCommand::Media {
                            chat_id,
                            media_key,
                            mime_type,
                            caption,
                            file_name,
                        },
                    )
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::SendLocation => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let latitude = config
                    .get("latitude")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| HubError::Validation("send-location needs latitude".into()))?;
                let longitude = config
                    .get("longitude")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| HubError::Validation("send-location needs longitude".into()))?;
                let name = config
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|t| ctx.render(t));
                let receipt = self
                    .send_for_agent(
                        ctx,
                        SendCommand::Location {
                            chat_id,
                            latitude,
                            longitude,
                            name,
                        },
                    )
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::React => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let message_id = self.config_message_id(ctx, &config)?;
                let emoji =
                    ctx.render(config.get("emoji").and_then(|v| v.as_str()).unwrap_or("👍"));
                let receipt = self
                    .send_for_agent(
                        ctx,
                        SendCommand::Reaction {
                            chat_id,
                            message_id,
                            emoji,
                        },
                    )
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::EditMessage => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let message_id = self.config_message_id(ctx, &config)?;
                let body = ctx.render(config.get("body").and_then(|v| v.as_str()).unwrap_or(""));
                let receipt = self
                    .send_for_agent(
                        ctx,
                        SendCommand::Edit {
                            chat_id,
                            message_id,
                            body,
                        },
                    )
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::DeleteMessage => {
                let chat_id = self.config_chat_id(ctx, &config)?;
                let message_id = self.config_message_id(ctx, &config)?;
                let receipt = self
                    .send_for_agent(ctx, SendCommand::Delete { chat_id, message_id })
                    .await?;
                Ok(done(json!(receipt)))
            }

            NodeKind::Condition => {
                let predicate: Predicate = serde_json::from_value(
                    config.get("predicate").cloned().unwrap_or(Value::Null),
                )
                .map_err(|e| HubError::Validation(format!("bad condition predicate: {}", e)))?;
                let root = ctx.root();
                let outcome = eval_predicate(&predicate, &root);
                Ok(NodeOutcome::Done {
                    result: json!(outcome),
                    routing: Some(outcome.to_string()),
                })
            }

            NodeKind::Switch => {
                let key =
                    ctx.render(config.get("key").and_then(|v| v.as_str()).unwrap_or(""));
                Ok(NodeOutcome::Done {
                    result: json!(key),
                    routing: Some(key),
                })
            }

            NodeKind::Loop => self.execute_loop(ctx, &config).await,

            NodeKind::Delay => {
                let delay_ms = match config.get("delayMs") {
                    Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
                    Some(Value::String(t)) => {
                        let rendered = ctx.render(t);
                        rendered.parse::<i64>().map_err(|_| {
                            HubError::Validation(format!("bad delayMs: {}", rendered))
                        })?
                    }
                    _ => return Err(HubError::Validation("delay needs delayMs".into())),
                };
                Ok(NodeOutcome::Suspend {
                    wake_at: now_ms() + delay_ms.max(0),
                })
            }

            NodeKind::SubFlow => self.execute_subflow(ctx, &config).await,

            NodeKind::CrossAgentCall => {
                let target = ctx.render(
                    config
                        .get("targetAgentId")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                );
                let flow_name = ctx.render(
                    config.get("flowName").and_then(|v| v.as_str()).unwrap_or(""),
                );
                let timeout_ms = node
                    .timeout_ms
                    .or_else(|| config.get("timeoutMs").and_then(|v| v.as_u64()))
                    .unwrap_or(10_000);
                let payload = match config.get("payload") {
                    Some(Value::String(t)) => ctx.render_value(t),
                    Some(other) => render_object(other, &ctx.root(), &mut ctx.unresolved_templates),
                    None => json!({}),
                };

                let result = self
                    .bus
                    .call(
                        &ctx.tenant,
                        &ctx.flow.agent_id,
                        &target,
                        &flow_name,
                        payload,
                        timeout_ms,
                    )
                    .await?;
                if let Some(output) = config.get("output").and_then(|v| v.as_str()) {
                    ctx.set_var(output, result.clone());
                }
                Ok(done(result))
            }

            NodeKind::AiResponse
            | NodeKind::AiExtract
            | NodeKind::AiIntent
            | NodeKind::AiTranslate
            | NodeKind::Transcribe
            | NodeKind::Tts => self.execute_ai(ctx, node.kind, &config).await,

            NodeKind::RagQuery => {
                let text = ctx.render(config.get("text").and_then(|v| v.as_str()).unwrap_or(""));
                let libraries: Vec<String> = config
                    .get("libraries")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let k = config.get("k").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

                let chunks = self.rag.query(&libraries, &text, k).await?;
                let output = config
                    .get("output")
                    .and_then(|v| v.as_str())
                    .unwrap_or("chunks");
                ctx.set_var(output, json!(chunks));
                Ok(done(json!({"count": chunks.len()})))
            }

            NodeKind::Set => {
                let values = config
                    .get("values")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();
                for (path, template) in values {
                    let value = match template {
                        Value::String(t) => ctx.render_value(&t),
                        other => other,
                    };
                    ctx.set_var(&path, value);
                }
                Ok(done(json!({})))
            }

            NodeKind::Template => {
                let template =
                    config.get("template").and_then(|v| v.as_str()).unwrap_or("");
                let rendered = ctx.render(template);
                let output = config
                    .get("output")
                    .and_then(|v| v.as_str())
                    .unwrap_or("rendered");
                ctx.set_var(output, json!(rendered));
                Ok(done(json!(rendered)))
            }

            NodeKind::JsonPath => {
                let source = match config.get("source") {
                    Some(Value::String(t)) => ctx.render_value(t),
                    Some(other) => other.clone(),
                    None => ctx.root(),
                };
                let path = config.get("path").and_then(|v| v.as_str()).unwrap_or("");
                let value = resolve_path(&source, path).unwrap_or(Value::Null);
                if let Some(output) = config.get("output").and_then(|v| v.as_str()) {
                    ctx.set_var(output, value.clone());
                }
                Ok(done(value))
            }

            NodeKind::RegexExtract => {
                let pattern = config.get("pattern").and_then(|v| v.as_str()).unwrap_or("");
                let source =
                    ctx.render(config.get("source").and_then(|v| v.as_str()).unwrap_or(""));
                let re = regex::Regex::new(pattern)
                    .map_err(|e| HubError::Validation(format!("bad regex: {}", e)))?;
                let captured = re
                    .captures(&source)
                    .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .map(|m| m.as_str().to_string());
                let value = json!(captured);
                if let Some(output) = config.get("output").and_then(|v| v.as_str()) {
                    ctx.set_var(output, value.clone());
                }
                Ok(done(value))
            }

            NodeKind::Encode => {
                use base64::{engine::general_purpose, Engine as _};
                let input =
                    ctx.render(config.get("input").and_then(|v| v.as_str()).unwrap_or(""));
                let mode = config.get("mode").and_then(|v| v.as_str()).unwrap_or("base64");
                let encoded = match mode {
                    "base64" => general_purpose::STANDARD.encode(input.as_bytes()),
                    "base64-decode" => {
                        let bytes = general_purpose::STANDARD
                            .decode(input.as_bytes())
                            .map_err(|e| HubError::Validation(format!("bad base64: {}", e)))?;
                        String::from_utf8_lossy(&bytes).to_string()
                    }
                    "hex" => input.as_bytes().iter().map(|b| format!("{:02x}", b)).collect(),
                    "json" => json!(input).to_string(),
                    other => {
                        return Err(HubError::Validation(format!("unknown encode mode: {}", other)))
                    }
                };
                if let Some(output) = config.get("output").and_then(|v| v.as_str()) {
                    ctx.set_var(output, json!(encoded));
                }
                Ok(done(json!(encoded)))
            }
        }
    }

    async fn execute_loop(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        config: &Value,
    ) -> Result<NodeOutcome, HubError> {
        let items = match config.get("items") {
            Some(Value::String(t)) => ctx.render_value(t),
            Some(other) => other.clone(),
            None => return Err(HubError::Validation("loop needs items".into())),
        };
        let items: Vec<Value> = match items {
            Value::Array(items) => items,
            Value::Number(n) => {
                let count = n.as_u64().unwrap_or(0);
                (0..count).map(|i| json!(i)).collect()
            }
            other => vec![other],
        };

        if items.len() > self.config.max_loop_iterations {
            return Err(HubError::LimitExceeded(format!(
                "loop over {} items exceeds the {} iteration cap",
                items.len(),
                self.config.max_loop_iterations
            )));
        }

        let body: Vec<FlowNode> = serde_json::from_value(
            config.get("body").cloned().unwrap_or(json!([])),
        )
        .map_err(|e| HubError::Validation(format!("bad loop body: {}", e)))?;
        let item_var = config
            .get("itemVar")
            .and_then(|v| v.as_str())
            .unwrap_or("item")
            .to_string();

        let mut collected = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            ctx.set_var(&item_var, item);
            ctx.set_var("loopIndex", json!(index));

            for body_node in &body {
                if ctx.nodes_executed >= self.config.max_nodes {
                    return Err(HubError::LimitExceeded(format!(
                        "loop body pushed execution past the {} node limit",
                        self.config.max_nodes
                    )));
                }
                match Box::pin(self.run_node_with_retry(ctx, body_node)).await? {
                    NodeOutcome::Done { result, .. } => {
                        ctx.nodes_executed += 1;
                        ctx.node_results
                            .insert(body_node.node_id.clone(), json!({"value": result}));
                    }
                    NodeOutcome::Suspend { .. } => {
                        return Err(HubError::Validation(
                            "delay nodes cannot sit inside a loop body".into(),
                        ));
                    }
                }
            }
            if let Some(last) = body.last() {
                if let Some(result) = ctx.node_results.get(&last.node_id) {
                    collected.push(result.get("value").cloned().unwrap_or(Value::Null));
                }
            }
        }

        let output = config
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or("loopResults");
        ctx.set_var(output, json!(collected));
        Ok(done(json!({"iterations": collected.len()})))
    }

    async fn execute_subflow(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        config: &Value,
    ) -> Result<NodeOutcome, HubError> {
        if ctx.subflow_depth >= self.config.max_subflow_depth {
            return Err(HubError::LimitExceeded(format!(
                "sub-flow nesting exceeds depth {}",
                self.config.max_subflow_depth
            )));
        }
        let flow_id = config
            .get("flowId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("sub-flow needs flowId".into()))?;
        let sub = self
            .flows
            .get(flow_id)
            .await
            .filter(|f| f.agent_id == ctx.flow.agent_id)
            .ok_or_else(|| {
                HubError::Validation(format!("sub-flow {} not found on this agent", flow_id))
            })?;

        // Child variables are exactly the explicitly mapped inputs.
        let mut inputs = json!({});
        if let Some(mapping) = config.get("inputs").and_then(|v| v.as_object()) {
            for (name, template) in mapping {
                let value = match template {
                    Value::String(t) => ctx.render_value(t),
                    other => other.clone(),
                };
                inputs[name.clone()] = value;
            }
        }

        let mut child = ExecutionContext {
            execution_id: format!("{}::{}", ctx.execution_id, flow_id),
            flow: sub.clone(),
            tenant: ctx.tenant.clone(),
            trigger_event: json!({"kind": "sub-flow", "parent": ctx.flow.flow_id}),
            variables: inputs,
            node_results: HashMap::new(),
            unresolved_templates: Vec::new(),
            nodes_executed: ctx.nodes_executed,
            subflow_depth: ctx.subflow_depth + 1,
        };

        let mut completed = HashSet::new();
        let mut failed_handled = HashSet::new();
        match Box::pin(self.walk_graph(&mut child, &mut completed, &mut failed_handled)).await {
            Ok(None) => {
                ctx.nodes_executed = child.nodes_executed;
                ctx.unresolved_templates.extend(child.unresolved_templates);
                let result = resolve_path(&child.variables, "result").unwrap_or(Value::Null);
                if let Some(output) = config.get("output").and_then(|v| v.as_str()) {
                    ctx.set_var(output, result.clone());
                }
                Ok(done(result))
            }
            Ok(Some(_)) => Err(HubError::Validation(
                "delay nodes cannot sit inside a sub-flow".into(),
            )),
            Err((_, e)) => Err(e),
        }
    }

    async fn execute_ai(
        self: &Arc<Self>,
        ctx: &mut ExecutionContext,
        kind: NodeKind,
        config: &Value,
    ) -> Result<NodeOutcome, HubError> {
        let base_prompt =
            ctx.render(config.get("prompt").and_then(|v| v.as_str()).unwrap_or(""));

        let prompt = match kind {
            NodeKind::AiExtract => {
                let fields = config
                    .get("fields")
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                format!(
                    "Extract the following fields as strict JSON (no prose): {}\n\nInput:\n{}",
                    fields, base_prompt
                )
            }
            NodeKind::AiIntent => {
                let intents = config
                    .get("intents")
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "[]".to_string());
                format!(
                    "Classify the message into exactly one of these intents and answer with the intent name only: {}\n\nMessage:\n{}",
                    intents, base_prompt
                )
            }
            NodeKind::AiTranslate => {
                let target = config
                    .get("targetLanguage")
                    .and_then(|v| v.as_str())
                    .unwrap_or("English");
                format!("Translate into {} and output only the translation:\n{}", target, base_prompt)
            }
            NodeKind::Tts => format!("[tts]{}", base_prompt),
            _ => base_prompt,
        };

        let mut task = AiTask {
            prompt,
            ..Default::default()
        };
        if let Some(hint) = config
            .get("complexityHint")
            .and_then(|v| v.as_str())
            .and_then(ComplexityTier::parse)
        {
            task.complexity_hint = Some(hint);
        }
        task.prefer_free = config
            .get("preferFree")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        task.max_tokens = config
            .get("maxTokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        task.temperature = config
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|v| v as f32);
        if kind == NodeKind::Transcribe {
            let audio =
                ctx.render(config.get("audio").and_then(|v| v.as_str()).unwrap_or(""));
            if audio.is_empty() {
                return Err(HubError::Validation("transcribe needs audio".into()));
            }
            task.audio = Some(audio);
        }

        let stream = self.ai.route(task).await?;
        let provider_id = stream.provider_id.clone();
        let text = stream.collect_text().await?;

        let parsed = match kind {
            NodeKind::AiExtract => {
                serde_json::from_str::<Value>(text.trim()).unwrap_or_else(|_| json!(text))
            }
            _ => json!(text),
        };

        let default_output = match kind {
            NodeKind::AiExtract => "extracted",
            NodeKind::AiIntent => "intent",
            NodeKind::AiTranslate => "translation",
            NodeKind::Transcribe => "transcript",
            NodeKind::Tts => "speech",
            _ => "aiResponse",
        };
        let output = config
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or(default_output);
        ctx.set_var(output, parsed.clone());

        Ok(done(json!({"provider": provider_id, "value": parsed})))
    }

    fn config_chat_id(
        &self,
        ctx: &mut ExecutionContext,
        config: &Value,
    ) -> Result<String, HubError> {
        let chat_id = match config.get("chatId").and_then(|v| v.as_str()) {
            Some(template) => ctx.render(template),
            None => ctx.render("{{trigger.message.chatId}}"),
        };
        if chat_id.is_empty() {
            return Err(HubError::Validation("cannot resolve target chat".into()));
        }
        Ok(chat_id)
    }

    fn config_message_id(
        &self,
        ctx: &mut ExecutionContext,
        config: &Value,
    ) -> Result<String, HubError> {
        let message_id = match config.get("messageId").and_then(|v| v.as_str()) {
            Some(template) => ctx.render(template),
            None => ctx.render("{{trigger.message.id}}"),
        };
        if message_id.is_empty() {
            return Err(HubError::Validation("cannot resolve target message".into()));
        }
        Ok(message_id)
    }

    async fn send_for_agent(
        &self,
        ctx: &ExecutionContext,
        command: SendCommand,
    ) -> Result<crate::agents::types::SendReceipt, HubError> {
        let handle = self.registry.get(&ctx.tenant, &ctx.flow.agent_id).await?;
        handle.send(command).await
    }
}

fn done(result: Value) -> NodeOutcome {
    NodeOutcome::Done {
        result,
        routing: None,
    }
}

fn has_error_edge(flow: &FlowDefinition, node_id: &str) -> bool {
    flow.edges.iter().any(|e| e.from == node_id && e.on_error)
}

/// The trigger event shape for inbound messages; what `{{trigger.*}}`
/// resolves against.
pub fn trigger_event_for(message: &UnifiedMessage) -> Value {
    json!({
        "kind": "message",
        "message": message,
        "triggerSender": {
            "id": message.sender_id,
            "name": message.sender_name,
        },
    })
}

fn eval_predicate(predicate: &Predicate, root: &Value) -> bool {
    let mut scratch = Vec::new();
    let left = render_value(&predicate.left, root, &mut scratch);
    let right = match &predicate.right {
        Value::String(t) => render_value(t, root, &mut scratch),
        other => other.clone(),
    };

    match predicate.op {
        PredicateOp::Eq => loose_eq(&left, &right),
        PredicateOp::Ne => !loose_eq(&left, &right),
        PredicateOp::Contains => match (&left, &right) {
            (Value::String(l), Value::String(r)) => l.contains(r.as_str()),
            (Value::Array(items), needle) => items.iter().any(|v| loose_eq(v, needle)),
            _ => false,
        },
        PredicateOp::Gt => as_f64(&left)
            .zip(as_f64(&right))
            .map(|(l, r)| l > r)
            .unwrap_or(false),
        PredicateOp::Lt => as_f64(&left)
            .zip(as_f64(&right))
            .map(|(l, r)| l < r)
            .unwrap_or(false),
        PredicateOp::Exists => !left.is_null() && left != json!(""),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(s), other) | (other, Value::String(s)) => {
            &other.to_string().trim_matches('"').to_string() == s
        }
        _ => false,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn merge_vars(base: &mut Value, incoming: Value) {
    if let (Value::Object(base_map), Value::Object(incoming_map)) = (base, incoming) {
        for (key, value) in incoming_map {
            base_map.insert(key, value);
        }
    }
}

fn render_object(value: &Value, root: &Value, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(t) => render_value(t, root, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_object(item, root, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_object(v, root, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_evaluation() {
        let root = json!({"vars": {"n": 5, "name": "alice", "tags": ["a", "b"]}});

        let p = Predicate {
            left: "{{vars.n}}".to_string(),
            op: PredicateOp::Gt,
            right: json!(3),
        };
        assert!(eval_predicate(&p, &root));

        let p = Predicate {
            left: "{{vars.name}}".to_string(),
            op: PredicateOp::Eq,
            right: json!("alice"),
        };
        assert!(eval_predicate(&p, &root));

        let p = Predicate {
            left: "{{vars.tags}}".to_string(),
            op: PredicateOp::Contains,
            right: json!("b"),
        };
        assert!(eval_predicate(&p, &root));

        let p = Predicate {
            left: "{{vars.missing}}".to_string(),
            op: PredicateOp::Exists,
            right: Value::Null,
        };
        assert!(!eval_predicate(&p, &root));
    }

    #[test]
    fn trigger_event_shape() {
        let message = UnifiedMessage {
            id: "tgb:1".to_string(),
            agent_id: "a1".to_string(),
            platform: crate::agents::types::Platform::TelegramBot,
            direction: crate::agents::types::Direction::Inbound,
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            sender_name: "Alice".to_string(),
            body: "hello world".to_string(),
            timestamp: 1,
            kind: crate::agents::types::MessageKind::Text,
            has_media: false,
            from_me: false,
            reply_to: None,
            meta: json!({}),
        };
        let event = trigger_event_for(&message);
        assert_eq!(event["triggerSender"]["name"], "Alice");
        assert_eq!(event["message"]["body"], "hello world");
        assert_eq!(event["message"]["chatId"], "c1");
    }
}
