use creatorflow::api::firestore::FirestoreStore;
use creatorflow::store::{UserPatch, UserStore};
use httpmock::Method::{GET, PATCH};
use httpmock::MockServer;
use serde_json::json;

mod support;

const DOCS: &str = "/v1/projects/demo/databases/(default)/documents/users";

fn keyless_store(server: &MockServer) -> FirestoreStore {
    let base_url = server.url("/v1");
    let metadata_host = server.address().to_string();
    let config = support::config_with(&[
        ("USER_STORE", "firestore"),
        ("FIRESTORE_BASE_URL", &base_url),
        ("GOOGLE_CLOUD_PROJECT", "demo"),
        ("GCE_METADATA_HOST", &metadata_host),
    ]);
    FirestoreStore::connect(&config.store).unwrap()
}

#[tokio::test]
async fn default_credentials_come_from_the_metadata_server() {
    let server = MockServer::start_async().await;
    let token = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/computeMetadata/v1/instance/service-accounts/default/token")
                .header("Metadata-Flavor", "Google")
                .query_param("scopes", "https://www.googleapis.com/auth/datastore");
            then.status(200).json_body(json!({
                "access_token": "ya29.metadata",
                "expires_in": 3599,
                "token_type": "Bearer"
            }));
        })
        .await;
    let existing = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("{DOCS}/u1"))
                .header("Authorization", "Bearer ya29.metadata");
            then.status(200).json_body(json!({
                "name": "projects/demo/databases/(default)/documents/users/u1",
                "fields": {
                    "email": { "stringValue": "maya@example.com" },
                    "credits": { "integerValue": "25" }
                }
            }));
        })
        .await;
    let missing = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("{DOCS}/ghost"));
            then.status(404).json_body(json!({ "error": { "code": 404 } }));
        })
        .await;
    let write = server
        .mock_async(|when, then| {
            when.method(PATCH)
                .path(format!("{DOCS}/u1"))
                .header("Authorization", "Bearer ya29.metadata")
                .query_param("updateMask.fieldPaths", "credits");
            then.status(200).json_body(json!({}));
        })
        .await;

    let store = keyless_store(&server);

    let record = store.find_by_id("u1").await.unwrap().unwrap();
    assert_eq!(record.email, "maya@example.com");
    assert_eq!(record.credits, 25);
    assert!(store.find_by_id("ghost").await.unwrap().is_none());

    let patch = UserPatch { credits: Some(75), ..UserPatch::default() };
    store.merge("u1", &patch).await.unwrap();

    token.assert_hits_async(1).await;
    existing.assert_hits_async(1).await;
    missing.assert_hits_async(1).await;
    write.assert_hits_async(1).await;
}

#[tokio::test]
async fn metadata_server_failure_surfaces_as_auth_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/computeMetadata/v1/instance/service-accounts/default/token");
            then.status(403).body("forbidden");
        })
        .await;

    let store = keyless_store(&server);
    let err = store.find_by_id("u1").await.unwrap_err();

    assert!(err.to_string().contains("metadata server returned 403"), "{err}");
}
