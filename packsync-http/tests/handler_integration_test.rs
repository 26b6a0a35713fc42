//! End-to-end tests of the HTTP routes against in-memory and disk registries

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Response, StatusCode};
use packsync_core::{RepositoryRegistry, StorageBackend};
use packsync_http::handlers::dispatch;
use serde_json::{json, Value};
use tempfile::TempDir;

async fn body_bytes(resp: Response<Full<Bytes>>) -> Bytes {
    resp.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(resp: Response<Full<Bytes>>) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

async fn get(registry: &RepositoryRegistry, path: &str, query: &str) -> Response<Full<Bytes>> {
    dispatch(registry, &Method::GET, path, query, Bytes::new()).await
}

async fn post(registry: &RepositoryRegistry, path: &str, body: Bytes) -> Response<Full<Bytes>> {
    dispatch(registry, &Method::POST, path, "", body).await
}

async fn upload(registry: &RepositoryRegistry, repo: &str, content: &'static [u8]) -> String {
    let resp = post(
        registry,
        &format!("/repos/{}/uploadRawPack", repo),
        Bytes::from_static(content),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], true);
    body["rawPack"].as_str().unwrap().to_string()
}

async fn update_refs(registry: &RepositoryRegistry, repo: &str, updates: Value) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&json!({ "updates": updates })).unwrap();
    post(registry, &format!("/repos/{}/updateRefs", repo), Bytes::from(body)).await
}

#[tokio::test]
async fn test_push_then_fetch_delta() {
    let registry = RepositoryRegistry::in_memory();
    let pa = upload(&registry, "demo", b"pack A").await;
    let pb = upload(&registry, "demo", b"pack B").await;
    let pc = upload(&registry, "demo", b"pack C").await;

    for (old, new, pack) in [("", "A", &pa), ("A", "B", &pb), ("B", "C", &pc)] {
        let resp = update_refs(
            &registry,
            "demo",
            json!([{ "name": "main", "oldOid": old, "newOid": new, "rawPack": pack }]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({ "ok": true }));
    }

    let resp = get(&registry, "/repos/demo/delta", "ref=main&base=A").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["packs"], json!([pb, pc]));
    assert_eq!(body["finalOid"], "C");

    let resp = get(&registry, "/repos/demo/delta", "ref=main&base=").await;
    assert_eq!(body_json(resp).await["packs"], json!([pa, pb, pc]));

    let resp = get(&registry, "/repos/demo/delta", "ref=main&base=C").await;
    let body = body_json(resp).await;
    assert_eq!(body["packs"], json!([]));
    assert_eq!(body["finalOid"], "C");

    let resp = get(&registry, "/repos/demo/refs", "").await;
    let body = body_json(resp).await;
    assert_eq!(body["refs"][0]["name"], "main");
    assert_eq!(body["refs"][0]["oid"], "C");
}

#[tokio::test]
async fn test_delta_unknown_base() {
    let registry = RepositoryRegistry::in_memory();
    let pa = upload(&registry, "demo", b"pack A").await;
    update_refs(
        &registry,
        "demo",
        json!([{ "name": "main", "oldOid": "", "newOid": "A", "rawPack": pa }]),
    )
    .await;

    let resp = get(&registry, "/repos/demo/delta", "ref=main&base=Z").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp).await;
    assert_eq!(body["reason"], "BaseNotFound");
    assert_eq!(body["finalOid"], "A");

    let resp = get(&registry, "/repos/demo/delta", "base=A").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = get(&registry, "/repos/demo/delta", "ref=nope&base=").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["packs"], json!([]));
    assert_eq!(body["finalOid"], "");
}

#[tokio::test]
async fn test_stale_batch_conflicts_and_changes_nothing() {
    let registry = RepositoryRegistry::in_memory();
    let p1 = upload(&registry, "demo", b"one").await;
    let p2 = upload(&registry, "demo", b"two").await;
    update_refs(
        &registry,
        "demo",
        json!([{ "name": "main", "oldOid": "", "newOid": "A", "rawPack": p1 }]),
    )
    .await;

    let resp = update_refs(
        &registry,
        "demo",
        json!([
            { "name": "dev", "oldOid": "", "newOid": "D", "rawPack": p2 },
            { "name": "main", "oldOid": "STALE", "newOid": "B", "rawPack": p2 },
        ]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(resp).await["error"], "NonFastForward");

    let body = body_json(get(&registry, "/repos/demo/refs", "").await).await;
    assert_eq!(body["refs"].as_array().unwrap().len(), 1);

    let body = body_json(get(&registry, "/repos/demo/log", "").await).await;
    assert_eq!(body["updates"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bad_requests() {
    let registry = RepositoryRegistry::in_memory();
    let p1 = upload(&registry, "demo", b"one").await;

    let resp = post(&registry, "/repos/demo/updateRefs", Bytes::from_static(b"{not json")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = update_refs(
        &registry,
        "demo",
        json!([{ "name": "", "oldOid": "", "newOid": "A", "rawPack": p1 }]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = update_refs(&registry, "demo", json!([])).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = update_refs(
        &registry,
        "demo",
        json!([{ "name": "main", "oldOid": "", "newOid": "A", "rawPack": format!("raw-{}.pack", "0".repeat(64)) }]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = get(&registry, "/repos/bad%20name/refs", "").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pack_download() {
    let registry = RepositoryRegistry::in_memory();
    let id = upload(&registry, "demo", b"opaque bytes").await;

    let resp = get(&registry, &format!("/repos/demo/packs/{}", id), "").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"opaque bytes"));

    let missing = format!("/repos/demo/packs/raw-{}.pack", "f".repeat(64));
    assert_eq!(get(&registry, &missing, "").await.status(), StatusCode::NOT_FOUND);

    let resp = get(&registry, "/repos/demo/packs/..%2Fmeta.sqlite", "").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_repositories_are_isolated() {
    let registry = RepositoryRegistry::in_memory();
    let pa = upload(&registry, "alpha", b"alpha pack").await;
    update_refs(
        &registry,
        "alpha",
        json!([{ "name": "main", "oldOid": "", "newOid": "A", "rawPack": pa }]),
    )
    .await;

    let body = body_json(get(&registry, "/repos/beta/refs", "").await).await;
    assert_eq!(body["refs"], json!([]));

    let resp = get(&registry, &format!("/repos/beta/packs/{}", pa), "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body = body_json(get(&registry, "/repos", "").await).await;
    assert_eq!(body["repos"], json!(["alpha", "beta"]));
}

#[tokio::test]
async fn test_routing_errors() {
    let registry = RepositoryRegistry::in_memory();
    let resp = dispatch(&registry, &Method::POST, "/repos/demo/refs", "", Bytes::new()).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    let resp = get(&registry, "/repos/demo/unknown", "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = get(&registry, "/", "").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disk_registry_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let pa = {
        let registry = RepositoryRegistry::new(StorageBackend::Disk(temp_dir.path().to_path_buf()));
        let pa = upload(&registry, "demo", b"persisted").await;
        let resp = update_refs(
            &registry,
            "demo",
            json!([{ "name": "main", "oldOid": "", "newOid": "A", "rawPack": pa }]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        pa
    };

    let registry = RepositoryRegistry::new(StorageBackend::Disk(temp_dir.path().to_path_buf()));
    let body = body_json(get(&registry, "/repos/demo/log", "ref=main").await).await;
    let updates = body["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["packId"], pa);
    assert_eq!(updates[0]["newOid"], "A");

    let resp = get(&registry, &format!("/repos/demo/packs/{}", pa), "").await;
    assert_eq!(body_bytes(resp).await, Bytes::from_static(b"persisted"));
}
