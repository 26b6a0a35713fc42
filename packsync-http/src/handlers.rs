//! HTTP route handlers
//!
//! Endpoints (all scoped to a repository, created on first reference):
//!   GET  /repos                           → opened repository names
//!   GET  /repos/{repo}/refs               → ref snapshot
//!   POST /repos/{repo}/uploadRawPack      → store raw body as a pack
//!   GET  /repos/{repo}/packs/{packId}     → pack bytes
//!   POST /repos/{repo}/updateRefs         → batched CAS ref updates
//!   GET  /repos/{repo}/delta?ref=&base=   → packs from base to tip
//!   GET  /repos/{repo}/log?ref=           → update log

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use packsync_core::{
    is_valid_pack_id, RefEntry, RefUpdate, Repository, RepositoryRegistry, SyncError,
    UpdateRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ─────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct RefsResponse {
    pub refs: Vec<RefEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub ok: bool,
    pub raw_pack: String,
    pub sha256: String,
    pub size: u64,
}

/// One update as sent by clients; `rawPack` names the pack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateItem {
    pub name: String,
    pub old_oid: String,
    pub new_oid: String,
    #[serde(alias = "packId")]
    pub raw_pack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl From<UpdateItem> for RefUpdate {
    fn from(item: UpdateItem) -> Self {
        RefUpdate {
            name: item.name,
            old_oid: item.old_oid,
            new_oid: item.new_oid,
            pack_id: item.raw_pack,
            size: item.size,
            sha256: item.sha256,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateRefsRequest {
    #[serde(default)]
    pub updates: Vec<UpdateItem>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaResponse {
    pub ok: bool,
    pub packs: Vec<String>,
    pub final_oid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogResponse {
    pub updates: Vec<UpdateRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReposResponse {
    pub repos: Vec<String>,
}

// ─────────────────────────────────────────────────────
// Public dispatch
// ─────────────────────────────────────────────────────

/// Route a request to the matching handler.
pub async fn dispatch(
    registry: &RepositoryRegistry,
    method: &Method,
    path: &str,
    query: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["repos"] => {
            if method != Method::GET {
                return method_not_allowed();
            }
            json_ok(&ReposResponse {
                repos: registry.list().await,
            })
        }
        ["repos", repo, rest @ ..] => {
            let route = match (method, rest) {
                (&Method::GET, ["refs"]) => Route::ListRefs,
                (&Method::POST, ["uploadRawPack"]) => Route::UploadPack,
                (&Method::GET, ["packs", pack_id]) => Route::DownloadPack(pack_id),
                (&Method::POST, ["updateRefs"]) => Route::UpdateRefs,
                (&Method::GET, ["delta"]) => Route::Delta,
                (&Method::GET, ["log"]) => Route::Log,
                (_, ["refs" | "uploadRawPack" | "updateRefs" | "delta" | "log"])
                | (_, ["packs", _]) => return method_not_allowed(),
                _ => return not_found_route(method, path),
            };

            let repo = match registry.get_or_open(repo).await {
                Ok(repo) => repo,
                Err(e) => return error_response(&e),
            };

            match route {
                Route::ListRefs => handle_list_refs(&repo).await,
                Route::UploadPack => handle_upload(&repo, body).await,
                Route::DownloadPack(pack_id) => handle_download(&repo, pack_id).await,
                Route::UpdateRefs => handle_update_refs(&repo, &body).await,
                Route::Delta => handle_delta(&repo, query).await,
                Route::Log => handle_log(&repo, query).await,
            }
        }
        _ => not_found_route(method, path),
    }
}

enum Route<'a> {
    ListRefs,
    UploadPack,
    DownloadPack(&'a str),
    UpdateRefs,
    Delta,
    Log,
}

// ─────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────

async fn handle_list_refs(repo: &Arc<Repository>) -> Response<Full<Bytes>> {
    match repo.coordinator().list_refs().await {
        Ok(refs) => json_ok(&RefsResponse { refs }),
        Err(e) => error_response(&e),
    }
}

async fn handle_upload(repo: &Arc<Repository>, body: Bytes) -> Response<Full<Bytes>> {
    match repo.coordinator().upload_pack(body).await {
        Ok(info) => json_ok(&UploadResponse {
            ok: true,
            raw_pack: info.pack_id,
            sha256: info.sha256,
            size: info.size,
        }),
        Err(e) => error_response(&e),
    }
}

async fn handle_download(repo: &Arc<Repository>, pack_id: &str) -> Response<Full<Bytes>> {
    if !is_valid_pack_id(pack_id) {
        return text_response(StatusCode::FORBIDDEN, "forbidden");
    }
    match repo.coordinator().download_pack(pack_id).await {
        Ok(data) => {
            let mut resp = Response::new(Full::new(data));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            resp
        }
        Err(SyncError::NotFound(_)) => text_response(StatusCode::NOT_FOUND, "not found"),
        Err(e) => error_response(&e),
    }
}

async fn handle_update_refs(repo: &Arc<Repository>, body: &[u8]) -> Response<Full<Bytes>> {
    let request: UpdateRefsRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e));
        }
    };
    let batch: Vec<RefUpdate> = request.updates.into_iter().map(RefUpdate::from).collect();

    match repo.coordinator().submit_updates(batch).await {
        Ok(_) => json_ok(&serde_json::json!({ "ok": true })),
        Err(e) => error_response(&e),
    }
}

async fn handle_delta(repo: &Arc<Repository>, query: &str) -> Response<Full<Bytes>> {
    let params = parse_query(query);
    let name = match params.get("ref") {
        Some(name) if !name.is_empty() => name.as_str(),
        _ => return json_error(StatusCode::BAD_REQUEST, "ref required"),
    };
    let base = params.get("base").map(|s| s.as_str()).unwrap_or("");

    match repo.coordinator().resolve_delta_chain(name, base).await {
        Ok(chain) => json_ok(&DeltaResponse {
            ok: true,
            packs: chain.packs,
            final_oid: chain.final_oid,
        }),
        Err(e) => error_response(&e),
    }
}

async fn handle_log(repo: &Arc<Repository>, query: &str) -> Response<Full<Bytes>> {
    let params = parse_query(query);
    let name = params.get("ref").map(|s| s.as_str()).filter(|s| !s.is_empty());
    match repo.coordinator().log(name).await {
        Ok(updates) => json_ok(&LogResponse { updates }),
        Err(e) => error_response(&e),
    }
}

// ─────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────

/// Map a domain error onto a status code and JSON body.
pub fn error_response(err: &SyncError) -> Response<Full<Bytes>> {
    match err {
        SyncError::BadRequest(msg) => json_error(StatusCode::BAD_REQUEST, msg),
        SyncError::NonFastForward {
            name,
            expected,
            actual,
        } => json_response(
            StatusCode::CONFLICT,
            &serde_json::json!({
                "ok": false,
                "error": "NonFastForward",
                "ref": name,
                "expected": expected,
                "actual": actual,
            }),
        ),
        SyncError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, msg),
        SyncError::BaseNotFound { final_oid, .. } => json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({
                "ok": false,
                "reason": "BaseNotFound",
                "finalOid": final_oid,
            }),
        ),
        other => {
            tracing::error!("internal error: {}", other);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub fn payload_too_large(limit: usize) -> Response<Full<Bytes>> {
    json_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        &format!("request body exceeds {} bytes", limit),
    )
}

fn method_not_allowed() -> Response<Full<Bytes>> {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}

fn not_found_route(method: &Method, path: &str) -> Response<Full<Bytes>> {
    json_error(
        StatusCode::NOT_FOUND,
        &format!("unknown endpoint: {} {}", method, path),
    )
}

fn json_ok<T: Serialize>(data: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, data)
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "ok": false, "error": message }),
    )
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(data).unwrap_or_default();
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    resp
}

/// Parse a query string into a key → value map (last value wins).
fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(urldecode(k), urldecode(v));
    }
    map
}

/// Minimal URL percent-decoding.
fn urldecode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                    (Some(h), Some(l)) => out.push(h << 4 | l),
                    _ => {
                        out.push(b'%');
                        out.extend(hi);
                        out.extend(lo);
                    }
                }
            }
            b'+' => out.push(b' '),
            _ => out.push(b),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
