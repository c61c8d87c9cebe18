use std::sync::Arc;

use memtap_core::ipc::{MemtapRequest, MemtapResponse};
use memtap_core::store::{DeleteOutcome, MemoryStore, StoreError};
use memtap_core::MemtapConfig;

use crate::subsystems::reflect::ReflectionHandle;

const DEFAULT_SEARCH_LIMIT: u32 = 10;

pub async fn handle_request(
    request: MemtapRequest,
    store: &Arc<dyn MemoryStore>,
    reflection: &ReflectionHandle,
    config: &MemtapConfig,
) -> MemtapResponse {
    match request {
        MemtapRequest::Ping => MemtapResponse::pong(),
        MemtapRequest::Health => {
            let user_id = &config.identity.default_user_id;
            match store.list(user_id).await {
                Ok(records) => MemtapResponse::ok(serde_json::json!({
                    "store": "reachable",
                    "memories": records.len(),
                    "status": "healthy"
                })),
                Err(e) => MemtapResponse::err(format!("Store health check failed: {}", e)),
            }
        }
        MemtapRequest::Add {
            messages,
            user_id,
            metadata,
        } => {
            if messages.is_empty() {
                return MemtapResponse::err("Add requires at least one message");
            }
            let user_id = resolve_user(user_id, config);
            let metadata = metadata.unwrap_or_else(|| serde_json::json!({"source": "manual"}));
            match store.add(&messages, &user_id, metadata).await {
                Ok(memory_id) => MemtapResponse::ok(serde_json::json!({
                    "stored": true,
                    "id": memory_id
                })),
                Err(e) => store_error(e),
            }
        }
        MemtapRequest::Search {
            query,
            user_id,
            limit,
        } => {
            let user_id = resolve_user(user_id, config);
            let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
            match store.search(&query, &user_id, limit).await {
                Ok(records) => match serde_json::to_value(&records) {
                    Ok(results) => MemtapResponse::ok(serde_json::json!({
                        "count": records.len(),
                        "results": results
                    })),
                    Err(e) => MemtapResponse::err(format!("Serialization error: {}", e)),
                },
                Err(e) => store_error(e),
            }
        }
        MemtapRequest::List { user_id } => {
            let user_id = resolve_user(user_id, config);
            match store.list(&user_id).await {
                Ok(records) => match serde_json::to_value(&records) {
                    Ok(results) => MemtapResponse::ok(serde_json::json!({
                        "count": records.len(),
                        "results": results
                    })),
                    Err(e) => MemtapResponse::err(format!("Serialization error: {}", e)),
                },
                Err(e) => store_error(e),
            }
        }
        MemtapRequest::Delete { memory_id } => match store.delete(&memory_id).await {
            Ok(outcome) => MemtapResponse::ok(serde_json::json!({
                "id": memory_id,
                "deleted": outcome == DeleteOutcome::Deleted
            })),
            Err(e) => store_error(e),
        },
        MemtapRequest::DeleteAll { user_id } => {
            let user_id = resolve_user(user_id, config);
            match store.delete_all(&user_id).await {
                Ok(()) => MemtapResponse::ok(serde_json::json!({
                    "user_id": user_id,
                    "deleted": true
                })),
                Err(e) => store_error(e),
            }
        }
        MemtapRequest::Reflect { user_id, reason } => {
            let user_id = resolve_user(user_id, config);
            if let Some(reason) = &reason {
                tracing::info!(user_id = %user_id, reason = %reason, "manual reflection requested");
            }
            match reflection.trigger(user_id).await {
                Ok(memory_id) => MemtapResponse::ok(serde_json::json!({
                    "triggered": true,
                    "id": memory_id
                })),
                Err(e) => MemtapResponse::err(e),
            }
        }
    }
}

fn resolve_user(user_id: Option<String>, config: &MemtapConfig) -> String {
    user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| config.identity.default_user_id.clone())
}

fn store_error(e: StoreError) -> MemtapResponse {
    match &e {
        StoreError::Unavailable(_) => {
            MemtapResponse::err(format!("Store temporarily unavailable: {}", e))
        }
        _ => MemtapResponse::err(e.to_string()),
    }
}
