use super::*;
use chrono::{DateTime, Utc};
use httpmock::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

const BASE_PATH: &str = "/v1/projects/p/databases/(default)/documents";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Post {
    text: String,
    likes: i64,
    created_at: Option<DateTime<Utc>>,
}

fn firestore_for(server: &MockServer) -> FirebaseFirestore {
    let client = ClientBuilder::new(Client::new()).build();
    FirebaseFirestore::new_with_client(client, server.url(BASE_PATH))
}

fn doc_json(id: &str, text: &str, created_at: &str) -> serde_json::Value {
    json!({
        "name": format!("projects/p/databases/(default)/documents/posts/{}", id),
        "fields": {
            "text": { "stringValue": text },
            "likes": { "integerValue": "2" },
            "createdAt": { "timestampValue": created_at }
        },
        "createTime": created_at,
        "updateTime": created_at
    })
}

#[tokio::test]
async fn test_get_document() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let found = server.mock(|when, then| {
        when.method(GET).path(format!("{}/posts/p1", BASE_PATH));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(doc_json("p1", "hello", "2024-03-05T10:00:00Z"));
    });

    let missing = server.mock(|when, then| {
        when.method(GET).path(format!("{}/posts/p2", BASE_PATH));
        then.status(404)
            .header("content-type", "application/json")
            .json_body(json!({ "error": { "code": 404, "message": "Document not found", "status": "NOT_FOUND" } }));
    });

    let snapshot = db.get_document("posts", "p1").await.unwrap().unwrap();
    assert_eq!(snapshot.id(), "p1");
    let post: Post = snapshot.data().unwrap();
    assert_eq!(post.text, "hello");
    assert_eq!(post.likes, 2);
    assert_eq!(post.created_at.unwrap().to_rfc3339(), "2024-03-05T10:00:00+00:00");

    assert!(db.get_document("posts", "p2").await.unwrap().is_none());

    found.assert();
    missing.assert();
}

#[tokio::test]
async fn test_set_document_commits_with_server_timestamp() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let commit = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:commit", BASE_PATH))
            .json_body(json!({
                "writes": [{
                    "update": {
                        "name": "projects/p/databases/(default)/documents/posts/p1",
                        "fields": {
                            "text": { "stringValue": "hello" },
                            "likes": { "integerValue": "0" }
                        }
                    },
                    "updateTransforms": [{ "fieldPath": "createdAt", "setToServerValue": "REQUEST_TIME" }]
                }]
            }));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "writeResults": [{ "updateTime": "2024-03-05T10:00:00Z" }],
                "commitTime": "2024-03-05T10:00:00Z"
            }));
    });

    let post = Post {
        text: "hello".into(),
        likes: 0,
        created_at: None,
    };
    let data = WriteData::from_serializable(&post).unwrap().server_timestamp("createdAt");
    db.set_document("posts", "p1", &data).await.unwrap();
    commit.assert();
}

#[tokio::test]
async fn test_update_missing_document_is_not_found() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let commit = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:commit", BASE_PATH))
            .body_includes("\"currentDocument\":{\"exists\":true}")
            .body_includes("\"updateMask\"");
        then.status(404)
            .header("content-type", "application/json")
            .json_body(json!({ "error": { "code": 404, "message": "No document to update", "status": "NOT_FOUND" } }));
    });

    let data = WriteData::from_serializable(&json!({ "text": "edited" })).unwrap();
    let err = db.update_document("posts", "gone", &data).await.unwrap_err();
    assert!(matches!(err, DocumentError::NotFound(ref msg) if msg == "No document to update"));
    commit.assert();
}

#[tokio::test]
async fn test_permission_denied_is_mapped() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    server.mock(|when, then| {
        when.method(GET).path(format!("{}/private/doc", BASE_PATH));
        then.status(403)
            .header("content-type", "application/json")
            .json_body(json!({
                "error": { "code": 403, "message": "Missing or insufficient permissions.", "status": "PERMISSION_DENIED" }
            }));
    });

    let err = db.get_document("private", "doc").await.unwrap_err();
    assert!(matches!(err, DocumentError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_add_document_creates_under_fresh_key() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let commit = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:commit", BASE_PATH))
            .body_includes("\"currentDocument\":{\"exists\":false}")
            .body_includes("projects/p/databases/(default)/documents/posts/");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "writeResults": [{}], "commitTime": "2024-03-05T10:00:00Z" }));
    });

    let data = WriteData::from_serializable(&json!({ "text": "new" })).unwrap();
    let first = db.add_document("posts", &data).await.unwrap();
    assert_eq!(first.len(), 32);
    commit.assert();
}

#[tokio::test]
async fn test_run_query_keeps_server_order() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let run = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:runQuery", BASE_PATH))
            .json_body(json!({
                "structuredQuery": {
                    "from": [{ "collectionId": "posts" }],
                    "orderBy": [{ "field": { "fieldPath": "createdAt" }, "direction": "DESCENDING" }],
                    "limit": 100
                }
            }));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([
                { "document": doc_json("p2", "second", "2024-03-05T11:00:00Z"), "readTime": "2024-03-05T12:00:00Z" },
                { "document": doc_json("p1", "first", "2024-03-05T10:00:00Z"), "readTime": "2024-03-05T12:00:00Z" }
            ]));
    });

    let query = Query::new("posts")
        .order_by("createdAt", Direction::Descending)
        .limit(100);
    let snapshot = db.run_query(&query).await.unwrap();

    let ids: Vec<&str> = snapshot.iter().map(|doc| doc.id()).collect();
    assert_eq!(ids, ["p2", "p1"]);
    assert_eq!(snapshot.read_time(), Some("2024-03-05T12:00:00Z"));
    run.assert();
}

#[tokio::test]
async fn test_count_reads_aggregate_field() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let aggregate = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:runAggregationQuery", BASE_PATH))
            .json_body(json!({
                "structuredAggregationQuery": {
                    "structuredQuery": { "from": [{ "collectionId": "users" }] },
                    "aggregations": [{ "alias": "count", "count": {} }]
                }
            }));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([{
                "result": { "aggregateFields": { "count": { "integerValue": "42" } } },
                "readTime": "2024-03-05T12:00:00Z"
            }]));
    });

    assert_eq!(db.count(&Query::new("users")).await.unwrap(), 42);
    aggregate.assert();
}

#[tokio::test]
async fn test_subscribe_emits_full_snapshot_at_consistent_point() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let listen_body = concat!(
        "[{\"targetChange\": {\"targetChangeType\": \"ADD\", \"targetIds\": [1]}}\n",
        ",{\"documentChange\": {\"document\": {\"name\": \"projects/p/databases/(default)/documents/posts/p1\"}, \"targetIds\": [1]}}\n",
        ",{\"targetChange\": {\"targetChangeType\": \"CURRENT\", \"targetIds\": [1], \"resumeToken\": \"tok-1\"}}\n",
        ",{\"targetChange\": {\"readTime\": \"2024-03-05T12:00:00Z\"}}\n",
        "]"
    );

    let listen = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:listen", BASE_PATH))
            .body_includes("\"database\":\"projects/p/databases/(default)\"")
            .body_includes("\"targetId\":1")
            .body_excludes("resumeToken");
        then.status(200)
            .header("content-type", "application/json")
            .body(listen_body);
    });

    let run = server.mock(|when, then| {
        when.method(POST).path(format!("{}:runQuery", BASE_PATH));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([
                { "document": doc_json("p1", "hello", "2024-03-05T10:00:00Z"), "readTime": "2024-03-05T12:00:00Z" }
            ]));
    });

    let query = Query::new("posts").order_by("createdAt", Direction::Descending).limit(100);
    let mut subscription = db.subscribe(&query).await.unwrap();

    let snapshot = subscription.next().await.unwrap().unwrap();
    assert_eq!(snapshot.size(), 1);
    assert_eq!(snapshot.documents()[0].id(), "p1");

    listen.assert();
    run.assert();
}

#[tokio::test]
async fn test_subscribe_resumes_after_server_closes_stream() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    let first = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:listen", BASE_PATH))
            .body_excludes("resumeToken");
        then.status(200)
            .header("content-type", "application/json")
            .body("[{\"targetChange\": {\"targetChangeType\": \"CURRENT\", \"resumeToken\": \"tok-1\"}}\n]");
    });

    let resumed = server.mock(|when, then| {
        when.method(POST)
            .path(format!("{}:listen", BASE_PATH))
            .body_includes("\"resumeToken\":\"tok-1\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(concat!(
                "[{\"documentChange\": {\"targetIds\": [1]}}\n",
                ",{\"targetChange\": {\"targetChangeType\": \"CURRENT\", \"resumeToken\": \"tok-1\"}}\n]"
            ));
    });

    server.mock(|when, then| {
        when.method(POST).path(format!("{}:runQuery", BASE_PATH));
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!([{ "readTime": "2024-03-05T12:00:00Z" }]));
    });

    let mut subscription = db.subscribe(&Query::new("posts")).await.unwrap();

    let initial = subscription.next().await.unwrap().unwrap();
    assert_eq!(initial.size(), 0);

    let after_reconnect = tokio::time::timeout(std::time::Duration::from_secs(10), subscription.next())
        .await
        .expect("subscription was not resumed")
        .unwrap()
        .unwrap();
    assert_eq!(after_reconnect.size(), 0);

    first.assert();
    assert!(resumed.hits() >= 1);
}

#[tokio::test]
async fn test_subscribe_reports_listen_failure() {
    let server = MockServer::start();
    let db = firestore_for(&server);

    server.mock(|when, then| {
        when.method(POST).path(format!("{}:listen", BASE_PATH));
        then.status(401)
            .header("content-type", "application/json")
            .json_body(json!([{
                "error": { "code": 401, "message": "Missing auth", "status": "UNAUTHENTICATED" }
            }]));
    });

    let mut subscription = db.subscribe(&Query::new("posts")).await.unwrap();
    let err = subscription.next().await.unwrap().unwrap_err();
    assert!(matches!(err, DocumentError::Unauthenticated(_)));
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_requests_carry_the_signed_in_user_token() {
    use crate::auth::models::Identity;
    use crate::auth::session::{Session, SharedSession, TokenRefresher};

    let server = MockServer::start();
    let session = SharedSession::new(TokenRefresher::new(
        ClientBuilder::new(Client::new()).build(),
        server.url("/securetoken/v1"),
        "test-key".to_string(),
    ));
    session
        .set(Session::new(
            Identity {
                uid: "u1".into(),
                ..Identity::default()
            },
            "id-token-u1".into(),
            "refresh-u1".into(),
            "3600",
        ))
        .await;

    let client = ClientBuilder::new(Client::new())
        .with(SessionMiddleware::new(session))
        .build();
    let db = FirebaseFirestore::new_with_client(client, server.url(BASE_PATH));

    let mock = server.mock(|when, then| {
        when.method(GET)
            .path(format!("{}/users/u1", BASE_PATH))
            .header("authorization", "Bearer id-token-u1");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "name": "projects/p/databases/(default)/documents/users/u1",
                "fields": { "displayName": { "stringValue": "Ana" } }
            }));
    });

    let snapshot = db.get_document("users", "u1").await.unwrap().unwrap();
    assert_eq!(snapshot.get_field::<String>("displayName").unwrap().as_deref(), Some("Ana"));
    mock.assert();
}
