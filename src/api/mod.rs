pub mod ws;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use warp::http::StatusCode;
use warp::{Filter, Reply};

use crate::agents::types::{AuthPromptKind, Platform, SendCommand};
use crate::agents::{AgentManager, AgentRegistry};
use crate::ai::types::{AiTask, FailoverHierarchy};
use crate::ai::AiRouter;
use crate::flows::{FlowDefinition, FlowEngine, FlowService, TriggerWork};
use crate::hub::SubscriptionHub;
use crate::storage::{ExecutionRow, Persistence};
use crate::utils::{HubError, HubMetrics};

/// Everything the admin surface needs a handle on.
pub struct ApiState {
    pub registry: Arc<AgentRegistry>,
    pub manager: Arc<AgentManager>,
    pub persistence: Arc<Persistence>,
    pub flows: Arc<FlowService>,
    pub engine: Arc<FlowEngine>,
    pub ai: Arc<AiRouter>,
    pub hub: Arc<SubscriptionHub>,
    pub metrics: Arc<HubMetrics>,
    pub trigger_tx: mpsc::Sender<TriggerWork>,
    pub snapshot_message_count: usize,
}

fn with_state(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (Arc<ApiState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn tenant_header() -> impl Filter<Extract = (Option<String>,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-tenant")
}

fn ok_reply<T: serde::Serialize>(data: T) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&json!({"success": true, "data": data})),
        StatusCode::OK,
    )
}

fn error_reply(e: &HubError) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = match e {
        HubError::Validation(_) | HubError::Serialization(_) => StatusCode::BAD_REQUEST,
        HubError::UnknownAgent(_) => StatusCode::NOT_FOUND,
        HubError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
        HubError::CrossAgentForbidden(_) => StatusCode::FORBIDDEN,
        HubError::NoPromptPending(_) | HubError::Duplicate(_) => StatusCode::CONFLICT,
        HubError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        HubError::CrossAgentTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HubError::NoProviderAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({
        "success": false,
        "error": e.to_string(),
        "code": e.code(),
    });
    if let HubError::Busy { retry_after_ms } = e {
        body["details"] = json!({"retryAfterMs": retry_after_ms});
    }
    if let HubError::NoProviderAvailable { reasons } = e {
        body["details"] = json!({"providers": reasons});
    }
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn require_tenant(tenant: Option<String>) -> Result<String, HubError> {
    tenant
        .filter(|t| !t.is_empty() && t.len() <= 128)
        .ok_or_else(|| HubError::Validation("missing x-tenant binding".into()))
}

/// Build the full admin API route tree.
pub fn routes(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let create_agent = warp::path!("agents")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_create_agent);

    let list_agents = warp::path!("agents")
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_list_agents);

    let get_agent = warp::path!("agents" / String)
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_get_agent);

    let patch_agent = warp::path!("agents" / String)
        .and(warp::patch())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_patch_agent);

    let delete_agent = warp::path!("agents" / String)
        .and(warp::delete())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_delete_agent);

    let connect = warp::path!("agents" / String / "connect")
        .and(warp::post())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_connect);

    let disconnect = warp::path!("agents" / String / "disconnect")
        .and(warp::post())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_disconnect);

    let auth = warp::path!("agents" / String / "auth")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_auth);

    let qr = warp::path!("agents" / String / "qr")
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_qr);

    let messages = warp::path!("agents" / String / "messages")
        .and(warp::get())
        .and(tenant_header())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_messages);

    let send = warp::path!("agents" / String / "send")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_send);

    let list_flows = warp::path!("agents" / String / "flows")
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_list_flows);

    let save_flow = warp::path!("agents" / String / "flows")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_save_flow);

    let get_flow = warp::path!("agents" / String / "flows" / String)
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_get_flow);

    let put_flow = warp::path!("agents" / String / "flows" / String)
        .and(warp::put())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_put_flow);

    let delete_flow = warp::path!("agents" / String / "flows" / String)
        .and(warp::delete())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_delete_flow);

    let execute_flow = warp::path!("agents" / String / "flows" / String / "execute")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_execute_flow);

    let toggle_flow = warp::path!("agents" / String / "flows" / String / "toggle")
        .and(warp::post())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_toggle_flow);

    let executions = warp::path!("agents" / String / "executions")
        .and(warp::get())
        .and(tenant_header())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(handle_executions);

    let webhook = warp::path!("webhooks" / String / String)
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_webhook);

    let ai_route = warp::path!("ai" / "route")
        .and(warp::post())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_ai_route);

    let ai_providers = warp::path!("ai" / "providers")
        .and(warp::get())
        .and(tenant_header())
        .and(with_state(state.clone()))
        .and_then(handle_ai_providers);

    let ai_failover = warp::path!("ai" / "failover")
        .and(warp::put())
        .and(tenant_header())
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(handle_ai_failover);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handle_health);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_metrics);

    create_agent
        .or(list_agents)
        .or(connect)
        .or(disconnect)
        .or(auth)
        .or(qr)
        .or(messages)
        .or(send)
        .or(list_flows)
        .or(save_flow)
        .or(execute_flow)
        .or(toggle_flow)
        .or(get_flow)
        .or(put_flow)
        .or(delete_flow)
        .or(executions)
        .or(webhook)
        .or(ai_route)
        .or(ai_providers)
        .or(ai_failover)
        .or(health)
        .or(metrics)
        .or(get_agent)
        .or(patch_agent)
        .or(delete_agent)
}

async fn handle_create_agent(
    tenant: Option<String>,
    body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let display_name = body
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or("agent");
        let platform = body
            .get("platform")
            .and_then(|v| v.as_str())
            .and_then(Platform::parse)
            .ok_or_else(|| HubError::Validation("unknown or missing platform".into()))?;
        let transport_config = body.get("transportConfig").cloned().unwrap_or(json!({}));
        let browser_session = body
            .get("browserSession")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let swarm_enabled = body
            .get("swarmEnabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        state
            .manager
            .create_agent(
                &tenant,
                display_name,
                platform,
                transport_config,
                browser_session,
                swarm_enabled,
            )
            .await
    }
    .await;

    Ok(match result {
        Ok(record) => ok_reply(record),
        Err(e) => error_reply(&e),
    })
}

async fn handle_list_agents(
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state
            .persistence
            .list_agents(&tenant)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))
    }
    .await;

    Ok(match result {
        Ok(agents) => ok_reply(agents),
        Err(e) => error_reply(&e),
    })
}

async fn handle_get_agent(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let handle = state.registry.get(&tenant, &agent_id).await?;
        let status = handle.status().await?;
        Ok::<_, HubError>(json!({
            "agent": status.record,
            "pendingPrompt": status.pending_prompt,
            "hasQr": status.qr.is_some(),
        }))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_patch_agent(
    agent_id: String,
    tenant: Option<String>,
    body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        let mut record = state
            .persistence
            .get_agent(&agent_id)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?
            .ok_or_else(|| HubError::UnknownAgent(agent_id.clone()))?;

        if let Some(name) = body.get("displayName").and_then(|v| v.as_str()) {
            record.display_name = name.to_string();
        }
        if let Some(config) = body.get("transportConfig") {
            record.transport_config = config.clone();
        }
        if let Some(swarm) = body.get("swarmEnabled").and_then(|v| v.as_bool()) {
            record.swarm_enabled = swarm;
            let handle = state.registry.get(&tenant, &agent_id).await?;
            // Best-effort: the live state machine may refuse the move.
            if let Err(e) = handle.set_swarm(swarm).await {
                debug!(agent_id = %agent_id, error = %e, "Swarm toggle deferred");
            }
        }
        state
            .persistence
            .upsert_agent(&record)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?;
        Ok::<_, HubError>(record)
    }
    .await;

    Ok(match result {
        Ok(record) => ok_reply(record),
        Err(e) => error_reply(&e),
    })
}

async fn handle_delete_agent(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.manager.delete_agent(&tenant, &agent_id).await
    }
    .await;

    Ok(match result {
        Ok(()) => ok_reply(json!({"deleted": true})),
        Err(e) => error_reply(&e),
    })
}

async fn handle_connect(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let handle = state.registry.get(&tenant, &agent_id).await?;
        handle.connect().await
    }
    .await;

    Ok(match result {
        Ok(()) => ok_reply(json!({"connecting": true})),
        Err(e) => error_reply(&e),
    })
}

async fn handle_disconnect(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let handle = state.registry.get(&tenant, &agent_id).await?;
        handle.disconnect().await
    }
    .await;

    Ok(match result {
        Ok(()) => ok_reply(json!({"disconnected": true})),
        Err(e) => error_reply(&e),
    })
}

async fn handle_auth(
    agent_id: String,
    tenant: Option<String>,
    body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let kind = body
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(AuthPromptKind::parse)
            .ok_or_else(|| HubError::Validation("unknown auth kind".into()))?;
        let value = body
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HubError::Validation("missing auth value".into()))?;

        let handle = state.registry.get(&tenant, &agent_id).await?;
        handle.submit_auth(kind, value).await
    }
    .await;

    Ok(match result {
        Ok(()) => ok_reply(json!({"accepted": true})),
        Err(e) => error_reply(&e),
    })
}

async fn handle_qr(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let handle = state.registry.get(&tenant, &agent_id).await?;
        let status = handle.status().await?;
        Ok::<_, HubError>(json!({"qr": status.qr}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_messages(
    agent_id: String,
    tenant: Option<String>,
    query: HashMap<String, String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;

        let chat_id = query.get("chatId").map(|s| s.as_str());
        let limit = query
            .get("limit")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(50);
        let cursor = match (query.get("cursorTs"), query.get("cursorId")) {
            (Some(ts), Some(id)) => ts.parse::<i64>().ok().map(|ts| (ts, id.clone())),
            _ => None,
        };

        let messages = state
            .persistence
            .get_messages(&agent_id, chat_id, cursor, limit)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?;
        let next_cursor = messages
            .last()
            .map(|m| json!({"cursorTs": m.timestamp, "cursorId": m.id}));
        Ok::<_, HubError>(json!({"messages": messages, "nextCursor": next_cursor}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_send(
    agent_id: String,
    tenant: Option<String>,
    command: SendCommand,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        let handle = state.registry.get(&tenant, &agent_id).await?;
        handle.send(command).await
    }
    .await;

    Ok(match result {
        Ok(receipt) => ok_reply(receipt),
        Err(e) => error_reply(&e),
    })
}

async fn handle_list_flows(
    agent_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        let flows = state.flows.list(&agent_id).await;
        let flows: Vec<&FlowDefinition> = flows.iter().map(|f| f.as_ref()).collect();
        Ok::<_, HubError>(serde_json::to_value(flows)?)
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_save_flow(
    agent_id: String,
    tenant: Option<String>,
    mut body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;

        if body.get("flowId").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
            body["flowId"] = json!(uuid::Uuid::new_v4().to_string());
        }
        body["agentId"] = json!(agent_id);
        let definition: FlowDefinition = serde_json::from_value(body)?;
        let flow_id = definition.flow_id.clone();
        state.flows.save(definition).await?;
        Ok::<_, HubError>(json!({"flowId": flow_id}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_get_flow(
    agent_id: String,
    flow_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        let flow = state
            .flows
            .get(&flow_id)
            .await
            .filter(|f| f.agent_id == agent_id)
            .ok_or_else(|| HubError::Validation(format!("flow {} not found", flow_id)))?;
        Ok::<_, HubError>(serde_json::to_value(flow.as_ref())?)
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_put_flow(
    agent_id: String,
    flow_id: String,
    tenant: Option<String>,
    mut body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        body["flowId"] = json!(flow_id);
        body["agentId"] = json!(agent_id);
        let definition: FlowDefinition = serde_json::from_value(body)?;
        state.flows.save(definition).await?;
        Ok::<_, HubError>(json!({"updated": true}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_delete_flow(
    agent_id: String,
    flow_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        let deleted = state.flows.delete(&flow_id).await?;
        Ok::<_, HubError>(json!({"deleted": deleted}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_execute_flow(
    agent_id: String,
    flow_id: String,
    tenant: Option<String>,
    body: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;

        let payload = body.get("payload").cloned().unwrap_or(json!({}));
        let (reply, rx) = oneshot::channel();
        state
            .trigger_tx
            .send(TriggerWork::Manual {
                agent_id,
                flow_id,
                payload,
                reply,
            })
            .await
            .map_err(|_| HubError::Fatal("flow engine queue closed".into()))?;
        let execution_id = rx
            .await
            .map_err(|_| HubError::Fatal("flow engine dropped the request".into()))??;
        Ok::<_, HubError>(json!({"executionId": execution_id}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_toggle_flow(
    agent_id: String,
    flow_id: String,
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        let current = state
            .flows
            .get(&flow_id)
            .await
            .filter(|f| f.agent_id == agent_id)
            .ok_or_else(|| HubError::Validation(format!("flow {} not found", flow_id)))?;
        let target = !current.active;
        state.flows.set_active(&flow_id, target).await?;
        Ok::<_, HubError>(json!({"active": target}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_executions(
    agent_id: String,
    tenant: Option<String>,
    query: HashMap<String, String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;

        let limit = query
            .get("limit")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(50);
        let cursor = match (query.get("cursorTs"), query.get("cursorId")) {
            (Some(ts), Some(id)) => ts.parse::<i64>().ok().map(|ts| (ts, id.clone())),
            _ => None,
        };
        let rows = state
            .persistence
            .list_executions(&agent_id, cursor, limit)
            .await
            .map_err(|e| HubError::Fatal(e.to_string()))?;
        Ok::<_, HubError>(json!(rows.iter().map(execution_json).collect::<Vec<_>>()))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_webhook(
    agent_id: String,
    path: String,
    tenant: Option<String>,
    payload: Value,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        let tenant = require_tenant(tenant)?;
        state.registry.get(&tenant, &agent_id).await?;
        state
            .trigger_tx
            .send(TriggerWork::Webhook {
                agent_id,
                path,
                payload,
            })
            .await
            .map_err(|_| HubError::Fatal("flow engine queue closed".into()))?;
        Ok::<_, HubError>(json!({"accepted": true}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

/// Stream AI chunks back as server-sent events.
async fn handle_ai_route(
    tenant: Option<String>,
    task: AiTask,
    state: Arc<ApiState>,
) -> Result<Box<dyn Reply>, Infallible> {
    if let Err(e) = require_tenant(tenant) {
        return Ok(Box::new(error_reply(&e)));
    }

    match state.ai.route(task).await {
        Ok(stream) => {
            let header = json!({
                "provider": stream.provider_id,
                "model": stream.model,
                "tier": stream.tier.as_str(),
            });
            let chunks = stream.chunks;
            let events = futures::stream::once(async move {
                Ok::<_, Infallible>(warp::sse::Event::default().event("routed").json_data(&header).unwrap_or_default())
            })
            .chain(
                futures::stream::unfold(chunks, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .map(|item| {
                    let event = match item {
                        Ok(text) => warp::sse::Event::default().event("chunk").data(text),
                        Err(e) => warp::sse::Event::default()
                            .event("error")
                            .data(e.to_string()),
                    };
                    Ok::<_, Infallible>(event)
                }),
            );
            Ok(Box::new(warp::sse::reply(warp::sse::keep_alive().stream(events))))
        }
        Err(e) => {
            warn!(error = %e, "AI routing failed");
            Ok(Box::new(error_reply(&e)))
        }
    }
}

async fn handle_ai_providers(
    tenant: Option<String>,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        require_tenant(tenant)?;
        let health = state.ai.health().snapshot().await;
        let providers: Vec<Value> = state
            .ai
            .health()
            .profiles()
            .iter()
            .map(|p| {
                let mut profile = serde_json::to_value(p).unwrap_or(json!({}));
                // Never leak credentials through the admin surface.
                if let Some(map) = profile.as_object_mut() {
                    map.remove("api_key");
                }
                json!({
                    "profile": profile,
                    "health": health.get(&p.provider_id),
                })
            })
            .collect();
        Ok::<_, HubError>(json!(providers))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_ai_failover(
    tenant: Option<String>,
    hierarchy: FailoverHierarchy,
    state: Arc<ApiState>,
) -> Result<impl Reply, Infallible> {
    let result = async {
        require_tenant(tenant)?;
        state.ai.set_hierarchy(hierarchy).await;
        Ok::<_, HubError>(json!({"updated": true}))
    }
    .await;

    Ok(match result {
        Ok(data) => ok_reply(data),
        Err(e) => error_reply(&e),
    })
}

async fn handle_health(state: Arc<ApiState>) -> Result<impl Reply, Infallible> {
    let agents = state.registry.len().await;
    let subscribers = state.hub.subscriber_count().await;
    Ok(ok_reply(json!({
        "status": "ok",
        "agents": agents,
        "subscribers": subscribers,
    })))
}

async fn handle_metrics(state: Arc<ApiState>) -> Result<Box<dyn Reply>, Infallible> {
    match state.metrics.render() {
        Ok(text) => Ok(Box::new(warp::reply::with_header(
            text,
            "content-type",
            "text/plain; version=0.0.4",
        ))),
        Err(e) => Ok(Box::new(warp::reply::with_status(
            e.to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))),
    }
}

fn execution_json(row: &ExecutionRow) -> Value {
    json!({
        "executionId": row.execution_id,
        "flowId": row.flow_id,
        "agentId": row.agent_id,
        "status": row.status,
        "startedAt": row.started_at,
        "finishedAt": row.finished_at,
        "errorKind": row.error_kind,
        "errorNode": row.error_node,
    })
}
