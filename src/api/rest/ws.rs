use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::{Actor, Role};
use crate::engine::dispatch::DispatchEngine;
use crate::engine::notify::AssignmentEvent;
use crate::error::AppError;
use crate::state::AppState;

/// Narrows the event stream. With no fields set every event is forwarded.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EventFilter {
    pub order_id: Option<String>,
    pub courier_id: Option<Uuid>,
}

impl EventFilter {
    pub fn admits(&self, event: &AssignmentEvent) -> bool {
        self.order_id
            .as_deref()
            .is_none_or(|order_id| order_id == event.order_id)
            && self
                .courier_id
                .is_none_or(|courier_id| event.courier_id == Some(courier_id))
    }
}

/// Narrows a requested filter to what `actor` may see. Admins get what they
/// ask for, couriers only their own events, customers one order they own.
pub async fn scope_filter(
    actor: &Actor,
    requested: EventFilter,
    engine: &DispatchEngine,
) -> Result<EventFilter, AppError> {
    match actor.role {
        Role::Admin => Ok(requested),
        Role::Courier => {
            let own = actor.courier_id()?;
            if let Some(other) = requested.courier_id.filter(|courier_id| *courier_id != own) {
                return Err(AppError::Forbidden(format!(
                    "not allowed to follow courier {other}"
                )));
            }
            Ok(EventFilter {
                courier_id: Some(own),
                ..requested
            })
        }
        Role::Customer => {
            let order_id = requested.order_id.clone().ok_or_else(|| {
                AppError::Forbidden("customers must subscribe to a single order".to_string())
            })?;
            let visible = engine
                .get(&order_id)
                .await?
                .is_some_and(|record| actor.may_view(&record));
            if !visible {
                return Err(AppError::NotFound(format!(
                    "assignment for order {order_id} not found"
                )));
            }
            Ok(EventFilter {
                order_id: Some(order_id),
                courier_id: requested.courier_id,
            })
        }
    }
}

pub async fn ws_handler(
    actor: Actor,
    State(state): State<Arc<AppState>>,
    Query(requested): Query<EventFilter>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let filter = scope_filter(&actor, requested, &state.engine).await?;
    Ok(ws.on_upgrade(|socket| stream_events(socket, state, filter)))
}

async fn stream_events(socket: WebSocket, state: Arc<AppState>, filter: EventFilter) {
    let (mut outbound, mut inbound) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());

    info!(
        order_id = ?filter.order_id,
        courier_id = ?filter.courier_id,
        "event subscriber connected"
    );

    let forward = tokio::spawn(async move {
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) if filter.admits(&event) => event,
                Ok(_) => continue,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagging; events dropped");
                    continue;
                }
            };

            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(order_id = %event.order_id, error = %err, "failed to encode assignment event");
                    continue;
                }
            };

            if outbound.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let drain = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            if let Message::Close(_) = message {
                debug!("event subscriber sent close");
                break;
            }
        }
    });

    tokio::select! {
        _ = forward => {},
        _ = drain => {},
    }

    info!("event subscriber disconnected");
}
