use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::cache::HistoryCache;
use crate::config::NodeConfig;
use crate::db::Database;
use crate::errors::{ArchiveError, ArchiveResult};
use crate::history::{transaction_history, transaction_history_csv, LedgerInclusionState};
use crate::types::{
    Address, IndexationPayload, Message, MessageId, MessagePayload, MilestoneIndex, OutputId,
    OutputKind, TransactionId,
};
use crate::utxo::{FilterOptions, Output, Receipt};

const MIME_TEXT_CSV: &str = "text/csv";

#[derive(Clone)]
struct AppState {
    db: Arc<Database>,
    cache: Arc<HistoryCache>,
    network_name: String,
    max_page_size: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type HttpError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, HttpError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    network: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
    is_healthy: bool,
    network_id: String,
    latest_milestone_index: MilestoneIndex,
    latest_milestone_timestamp: i64,
    confirmed_milestone_index: MilestoneIndex,
    pruning_index: MilestoneIndex,
    features: Vec<&'static str>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum MessagePayloadDto {
    #[serde(rename_all = "camelCase")]
    Transaction {
        transaction_id: String,
        inputs: Vec<String>,
        outputs: Vec<TransactionOutputDto>,
    },
    #[serde(rename_all = "camelCase")]
    Milestone { index: MilestoneIndex, timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    Indexation { index: String, data: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionOutputDto {
    address: String,
    amount: u64,
    kind: u8,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<MessagePayloadDto>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadataResponse {
    message_id: String,
    is_solid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    referenced_by_milestone_index: Option<MilestoneIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger_inclusion_state: Option<LedgerInclusionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict_reason: Option<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MilestoneResponse {
    index: MilestoneIndex,
    message_id: String,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputResponse {
    message_id: String,
    transaction_id: String,
    output_index: u16,
    is_spent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    milestone_index_spent: Option<MilestoneIndex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id_spent: Option<String>,
    ledger_index: MilestoneIndex,
    output: TransactionOutputDto,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BalanceResponse {
    address_type: u8,
    address: String,
    balance: u64,
    dust_allowed: bool,
    ledger_index: MilestoneIndex,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputIdsResponse {
    address_type: u8,
    address: String,
    max_results: u32,
    count: u32,
    output_ids: Vec<String>,
    ledger_index: MilestoneIndex,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TreasuryResponse {
    milestone_id: String,
    amount: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputsQuery {
    max_results: Option<usize>,
    #[serde(default)]
    include_spent: bool,
    #[serde(rename = "type")]
    output_type: Option<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    max_results: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    max_results: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexQuery {
    index: Option<String>,
    max_results: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChildrenResponse {
    message_id: String,
    max_results: u32,
    count: u32,
    children_message_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageIdsByIndexResponse {
    index: String,
    max_results: u32,
    count: u32,
    message_ids: Vec<String>,
}

#[derive(Serialize)]
struct ReceiptsResponse {
    receipts: Vec<Receipt>,
}

pub async fn serve(
    db: Arc<Database>,
    cache: Arc<HistoryCache>,
    config: &NodeConfig,
) -> ArchiveResult<()> {
    let state = AppState {
        db,
        cache,
        network_name: config.network_name.clone(),
        max_page_size: config.max_page_size,
    };
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/v1/info", get(info_endpoint))
        .route("/api/v1/messages", get(message_ids_by_index))
        .route("/api/v1/messages/:message_id", get(message))
        .route("/api/v1/messages/:message_id/metadata", get(message_metadata))
        .route("/api/v1/messages/:message_id/children", get(message_children))
        .route("/api/v1/milestones/:index", get(milestone))
        .route(
            "/api/v1/transactions/:transaction_id/included-message",
            get(included_message),
        )
        .route("/api/v1/outputs/:output_id", get(output))
        .route("/api/v1/addresses/:address", get(address_balance))
        .route("/api/v1/addresses/:address/outputs", get(address_outputs))
        .route("/api/v1/addresses/:address/tx-history", get(address_history))
        .route("/api/v1/treasury", get(treasury))
        .route("/api/v1/receipts", get(receipts))
        .route("/api/v1/receipts/:migrated_at", get(receipts_migrated_at))
        .with_state(state);

    let listener = TcpListener::bind(config.rest_listen).await?;
    info!(addr = %config.rest_listen, "REST server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        network: state.network_name.clone(),
    })
}

async fn info_endpoint(State(state): State<AppState>) -> ApiResult<InfoResponse> {
    let sync_state = state.db.sync_state().map_err(internal)?;
    Ok(Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        is_healthy: true,
        network_id: state.db.snapshot_info().network_id.to_string(),
        latest_milestone_index: sync_state.latest_milestone_index,
        latest_milestone_timestamp: sync_state.latest_milestone_timestamp,
        confirmed_milestone_index: sync_state.confirmed_milestone_index,
        pruning_index: sync_state.pruning_index,
        features: vec!["tx-history"],
    }))
}

async fn message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> ApiResult<MessageResponse> {
    let message_id = MessageId::from_hex(&message_id).map_err(bad_request)?;
    let message = state
        .db
        .message(&message_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("message not found: {message_id}")))?;
    Ok(Json(message_response(&message)))
}

fn message_response(message: &Message) -> MessageResponse {
    let payload = message.payload().map(|payload| match payload {
        MessagePayload::Transaction(transaction) => MessagePayloadDto::Transaction {
            transaction_id: transaction.transaction_id.to_hex(),
            inputs: transaction
                .essence
                .inputs
                .iter()
                .map(|input| input.output_id().to_hex())
                .collect(),
            outputs: transaction
                .essence
                .outputs
                .iter()
                .map(|output| TransactionOutputDto {
                    address: output.address().to_hex(),
                    amount: output.amount(),
                    kind: output.kind().as_byte(),
                })
                .collect(),
        },
        MessagePayload::Milestone(milestone) => MessagePayloadDto::Milestone {
            index: milestone.index,
            timestamp: milestone.timestamp,
        },
        MessagePayload::Indexation(IndexationPayload { index, data }) => {
            MessagePayloadDto::Indexation {
                index: hex::encode(index),
                data: hex::encode(data),
            }
        }
    });
    MessageResponse {
        message_id: message.message_id().to_hex(),
        payload,
    }
}

async fn message_metadata(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> ApiResult<MessageMetadataResponse> {
    let message_id = MessageId::from_hex(&message_id).map_err(bad_request)?;
    let metadata = state
        .db
        .message_metadata(&message_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("message metadata not found: {message_id}")))?;

    let (ledger_inclusion_state, conflict_reason) = if metadata.is_conflicting_tx() {
        (
            Some(LedgerInclusionState::Conflicting),
            Some(metadata.conflict.code()),
        )
    } else if metadata.referenced_by_milestone.is_some() {
        if metadata.is_included_tx {
            (Some(LedgerInclusionState::Included), None)
        } else {
            (Some(LedgerInclusionState::NoTransaction), None)
        }
    } else {
        (None, None)
    };

    Ok(Json(MessageMetadataResponse {
        message_id: message_id.to_hex(),
        is_solid: metadata.is_solid,
        referenced_by_milestone_index: metadata.referenced_by_milestone,
        ledger_inclusion_state,
        conflict_reason,
    }))
}

async fn message_children(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ChildrenResponse> {
    let message_id = MessageId::from_hex(&message_id).map_err(bad_request)?;
    let max_results = clamp_page_size(query.max_results, state.max_page_size);
    let children = state
        .db
        .children_message_ids(&message_id, Some(max_results))
        .map_err(internal)?;
    Ok(Json(ChildrenResponse {
        message_id: message_id.to_hex(),
        max_results: max_results as u32,
        count: children.len() as u32,
        children_message_ids: children.iter().map(MessageId::to_hex).collect(),
    }))
}

async fn message_ids_by_index(
    State(state): State<AppState>,
    Query(query): Query<IndexQuery>,
) -> ApiResult<MessageIdsByIndexResponse> {
    let index_hex = query.index.ok_or_else(|| {
        bad_request(ArchiveError::Config("query parameter index missing".into()))
    })?;
    let index = hex::decode(&index_hex)
        .map_err(|err| bad_request(ArchiveError::Config(format!("invalid index: {err}"))))?;
    let max_results = clamp_page_size(query.max_results, state.max_page_size);
    let message_ids = state
        .db
        .indexation_message_ids(&index, Some(max_results))
        .map_err(internal)?;
    Ok(Json(MessageIdsByIndexResponse {
        index: index_hex,
        max_results: max_results as u32,
        count: message_ids.len() as u32,
        message_ids: message_ids.iter().map(MessageId::to_hex).collect(),
    }))
}

async fn included_message(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> ApiResult<MessageResponse> {
    let transaction_id = TransactionId::from_hex(&transaction_id).map_err(bad_request)?;
    let message_id = state
        .db
        .included_message_id(&transaction_id)
        .map_err(internal)?
        .ok_or_else(|| {
            not_found(format!("output for transaction not found: {transaction_id}"))
        })?;
    let message = state
        .db
        .message(&message_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("message not found: {message_id}")))?;
    Ok(Json(message_response(&message)))
}

async fn milestone(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> ApiResult<MilestoneResponse> {
    let index: MilestoneIndex = index
        .parse()
        .map_err(|_| bad_request(ArchiveError::Config("invalid milestone index".into())))?;
    let milestone = state
        .db
        .milestone(index)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("milestone not found: {index}")))?;
    Ok(Json(MilestoneResponse {
        index: milestone.index,
        message_id: milestone.message_id.to_hex(),
        timestamp: milestone.timestamp,
    }))
}

async fn output(
    State(state): State<AppState>,
    Path(output_id): Path<String>,
) -> ApiResult<OutputResponse> {
    let output_id = OutputId::from_hex(&output_id).map_err(bad_request)?;
    let output = state
        .db
        .utxo()
        .read_output_by_output_id(&output_id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("output not found: {output_id}")))?;

    let spent_meta = state.db.utxo().read_spent_meta(&output).map_err(internal)?;
    let ledger_index = state.db.utxo().read_ledger_index().map_err(internal)?;

    Ok(Json(OutputResponse {
        message_id: output.message_id.to_hex(),
        transaction_id: output_id.transaction_id().to_hex(),
        output_index: output_id.index(),
        is_spent: spent_meta.is_some(),
        milestone_index_spent: spent_meta.as_ref().map(|meta| meta.milestone_index),
        transaction_id_spent: spent_meta
            .as_ref()
            .map(|meta| meta.target_transaction_id.to_hex()),
        ledger_index,
        output: TransactionOutputDto {
            address: output.address.to_hex(),
            amount: output.amount,
            kind: output.kind.as_byte(),
        },
    }))
}

async fn address_balance(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<BalanceResponse> {
    let address = Address::from_ed25519_hex(&address).map_err(bad_request)?;
    let (balance, dust_allowed) = state.db.utxo().address_balance(&address).map_err(internal)?;
    let ledger_index = state.db.utxo().read_ledger_index().map_err(internal)?;
    Ok(Json(BalanceResponse {
        address_type: address.kind(),
        address: address.to_hex(),
        balance,
        dust_allowed,
        ledger_index,
    }))
}

async fn address_outputs(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<OutputsQuery>,
) -> ApiResult<OutputIdsResponse> {
    let address = Address::from_ed25519_hex(&address).map_err(bad_request)?;
    let output_kind = match query.output_type {
        Some(byte) => Some(OutputKind::from_byte(byte).ok_or_else(|| {
            bad_request(ArchiveError::Config(format!("invalid output type: {byte}")))
        })?),
        None => None,
    };
    let max_results = clamp_page_size(query.max_results, state.max_page_size);
    let filter = FilterOptions {
        address: Some(address),
        output_kind,
        max_results: Some(max_results),
    };

    let mut output_ids = Vec::new();
    let collect = |output: &Output| {
        output_ids.push(output.output_id.to_hex());
        true
    };
    state
        .db
        .utxo()
        .for_each_unspent_output(collect, &filter)
        .map_err(internal)?;
    if query.include_spent && output_ids.len() < max_results {
        let remaining = FilterOptions {
            max_results: Some(max_results - output_ids.len()),
            ..filter
        };
        state
            .db
            .utxo()
            .for_each_spent_output(
                |spent| {
                    output_ids.push(spent.output.output_id.to_hex());
                    true
                },
                &remaining,
            )
            .map_err(internal)?;
    }

    let ledger_index = state.db.utxo().read_ledger_index().map_err(internal)?;
    Ok(Json(OutputIdsResponse {
        address_type: address.kind(),
        address: address.to_hex(),
        max_results: max_results as u32,
        count: output_ids.len() as u32,
        output_ids,
        ledger_index,
    }))
}

async fn address_history(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let address = Address::from_ed25519_hex(&address).map_err(bad_request)?;
    let max_results = clamp_page_size(query.max_results, state.max_page_size);

    let response = match state.cache.get(&address, max_results) {
        Some(cached) => cached,
        None => {
            let built =
                Arc::new(transaction_history(&state.db, &address, max_results).map_err(internal)?);
            state.cache.insert(address, max_results, built.clone());
            built
        }
    };

    if accepts_csv(&headers) {
        let body = transaction_history_csv(&response);
        return Ok(([(axum::http::header::CONTENT_TYPE, MIME_TEXT_CSV)], body).into_response());
    }
    Ok(Json(response.as_ref().clone()).into_response())
}

async fn treasury(State(state): State<AppState>) -> ApiResult<TreasuryResponse> {
    let treasury = state
        .db
        .utxo()
        .read_treasury_output()
        .map_err(internal)?
        .ok_or_else(|| not_found("treasury output not found".to_string()))?;
    Ok(Json(TreasuryResponse {
        milestone_id: hex::encode(treasury.milestone_id),
        amount: treasury.amount,
    }))
}

async fn receipts(State(state): State<AppState>) -> ApiResult<ReceiptsResponse> {
    let mut receipts = Vec::new();
    state
        .db
        .utxo()
        .for_each_receipt(|receipt| {
            receipts.push(receipt.clone());
            true
        })
        .map_err(internal)?;
    Ok(Json(ReceiptsResponse { receipts }))
}

async fn receipts_migrated_at(
    State(state): State<AppState>,
    Path(migrated_at): Path<String>,
) -> ApiResult<ReceiptsResponse> {
    let migrated_at: MilestoneIndex = migrated_at
        .parse()
        .map_err(|_| bad_request(ArchiveError::Config("invalid migration index".into())))?;
    let mut receipts = Vec::new();
    state
        .db
        .utxo()
        .for_each_receipt_migrated_at(migrated_at, |receipt| {
            receipts.push(receipt.clone());
            true
        })
        .map_err(internal)?;
    Ok(Json(ReceiptsResponse { receipts }))
}

fn accepts_csv(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains(MIME_TEXT_CSV))
}

fn clamp_page_size(requested: Option<usize>, ceiling: usize) -> usize {
    requested.unwrap_or(ceiling).clamp(1, ceiling)
}

fn bad_request(err: ArchiveError) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

fn not_found(message: String) -> HttpError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message }))
}

// Store and integrity failures are logged server-side; the body stays
// generic so internals never leak onto the public surface.
fn internal(err: ArchiveError) -> HttpError {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "internal server error".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped_to_the_configured_ceiling() {
        assert_eq!(clamp_page_size(None, 1000), 1000);
        assert_eq!(clamp_page_size(Some(10), 1000), 10);
        assert_eq!(clamp_page_size(Some(5000), 1000), 1000);
        assert_eq!(clamp_page_size(Some(0), 1000), 1);
    }

    #[test]
    fn csv_negotiation_matches_the_accept_header() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_csv(&headers));

        headers.insert(ACCEPT, "application/json".parse().unwrap());
        assert!(!accepts_csv(&headers));

        headers.insert(ACCEPT, "text/csv".parse().unwrap());
        assert!(accepts_csv(&headers));
    }
}
