//! Boundary operations through `Bridge`, checking the JSON envelope
//!
//! The bridge blocks on its own runtime, so these are plain tests and the
//! mock server runs on a separate one.

mod common;

use common::{account, library_item, library_page, test_config, ACCESS_TOKEN, REFRESH_TOKEN, SERIAL};
use librisync_core::Bridge;
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn mock_runtime() -> (Runtime, MockServer) {
    let runtime = Runtime::new().unwrap();
    let server = runtime.block_on(MockServer::start());
    (runtime, server)
}

fn parse(envelope_json: String) -> Value {
    serde_json::from_str(&envelope_json).unwrap()
}

#[test]
fn test_exchange_and_refresh_envelopes() {
    let (runtime, server) = mock_runtime();
    runtime.block_on(async {
        Mock::given(method("POST"))
            .and(path("/auth/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {"success": {"tokens": {"bearer": {
                    "access_token": ACCESS_TOKEN,
                    "refresh_token": REFRESH_TOKEN,
                    "expires_in": "3600"
                }}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;
    });

    let bridge = Bridge::with_config(test_config(&server.uri())).unwrap();

    let challenge = bridge.begin_authorization("us", SERIAL).into_result().unwrap();
    let exchanged = parse(
        bridge
            .exchange_code("us", "ANxyzCode", SERIAL, &challenge.pkce_verifier)
            .to_json(),
    );
    assert_eq!(exchanged["success"], true);
    assert_eq!(exchanged["data"]["access_token"], ACCESS_TOKEN);
    assert_eq!(exchanged["data"]["refresh_token"], REFRESH_TOKEN);
    assert_eq!(exchanged["data"]["token_type"], "Bearer");
    assert!(exchanged["data"]["expires_in"].as_i64().unwrap() > 3500);

    let refreshed = bridge.refresh("us", REFRESH_TOKEN, SERIAL).to_json();
    let value = parse(refreshed.clone());
    assert_eq!(value["success"], false);
    assert!(value.get("data").is_none());
    assert!(!refreshed.contains(REFRESH_TOKEN));
}

#[test]
fn test_store_operations_share_a_path() {
    let (runtime, server) = mock_runtime();
    runtime.block_on(async {
        Mock::given(method("GET"))
            .and(path("/1.0/library"))
            .respond_with(ResponseTemplate::new(200).set_body_json(library_page(
                vec![
                    library_item("B00AAAAAA1", "The Fifth Season", "N. K. Jemisin", "2023-05-01T10:00:00Z"),
                    library_item("B00AAAAAA2", "Piranesi", "Susanna Clarke", "2022-01-01T10:00:00Z"),
                ],
                2,
            )))
            .mount(&server)
            .await;
    });

    let bridge = Bridge::with_config(test_config(&server.uri())).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("library.db");
    let db = db.to_str().unwrap();

    assert_eq!(parse(bridge.init_store(db).to_json())["data"]["initialized"], true);
    assert_eq!(parse(bridge.init_store(db).to_json())["success"], true);

    let synced = parse(bridge.sync(db, &account()).to_json());
    assert_eq!(
        synced["data"],
        json!({"total_items": 2, "added": 2, "updated": 0, "removed": 0})
    );

    let page = parse(bridge.get_books(db, 0, 1).to_json());
    assert_eq!(page["data"]["total_count"], 2);
    assert_eq!(page["data"]["books"][0]["asin"], "B00AAAAAA1");

    let found = parse(bridge.search(db, "clarke").to_json());
    assert_eq!(found["data"]["books"][0]["title"], "Piranesi");

    let missing = parse(bridge.get_book(db, "B00ZZZZZZZ").to_json());
    assert_eq!(missing["data"]["book"], Value::Null);

    let negative = parse(bridge.get_books(db, -5, 10).to_json());
    assert_eq!(negative["success"], false);
}

#[test]
fn test_failed_download_envelope() {
    let (runtime, server) = mock_runtime();
    runtime.block_on(async {
        Mock::given(method("POST"))
            .and(path("/1.0/content/B00AAAAAA1/licenserequest"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
    });

    let bridge = Bridge::with_config(test_config(&server.uri())).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");

    let json = bridge
        .download("B00AAAAAA1", ACCESS_TOKEN, "us", output.to_str().unwrap(), &Default::default())
        .to_json();
    let value = parse(json.clone());

    assert_eq!(value["success"], false);
    assert!(!json.contains(ACCESS_TOKEN));
    assert!(!output.exists());
}
