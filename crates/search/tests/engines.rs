use std::collections::BTreeMap;

use annotations::{RecordStatus, ResponseStatus};
use chrono::{Duration, Utc};
use search_index::{
    ElasticsearchEngine, Filters, InMemorySearchEngine, IndexSpec, Order, RecordDocument,
    ResponseDoc, ResponseFilter, ResponseStatusFilter, SearchEngine, SearchError, SearchQuery,
    SortField, SortOrder, TermsFilter, TextQuery,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn spec(dataset_id: Uuid) -> IndexSpec {
    IndexSpec {
        dataset_id,
        fields: vec!["prompt".into()],
        questions: vec!["label".into()],
    }
}

fn doc(prompt: &str, minutes_ago: i64) -> RecordDocument {
    let at = Utc::now() - Duration::minutes(minutes_ago);
    RecordDocument {
        id: Uuid::new_v4(),
        external_id: None,
        fields: json!({ "prompt": prompt }).as_object().cloned().unwrap(),
        metadata: Default::default(),
        status: RecordStatus::Pending,
        responses: BTreeMap::new(),
        suggestions: BTreeMap::new(),
        version: 1,
        inserted_at: at,
        updated_at: at,
    }
}

fn with_response(mut d: RecordDocument, user: Uuid, status: ResponseStatus) -> RecordDocument {
    d.responses.insert(user, ResponseDoc { status, values: None });
    d
}

#[tokio::test]
async fn memory_index_requires_creation() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();

    let err = engine.index_records(dataset, &[doc("a", 0)]).await.unwrap_err();
    assert!(matches!(err, SearchError::IndexNotFound(id) if id == dataset));

    engine.create_index(&spec(dataset)).await.unwrap();
    engine.create_index(&spec(dataset)).await.unwrap();
    engine.index_records(dataset, &[doc("a", 0)]).await.unwrap();
    assert_eq!(engine.len(dataset).await, 1);

    engine.delete_index(dataset).await.unwrap();
    assert_eq!(engine.len(dataset).await, 0);
}

#[tokio::test]
async fn memory_reindex_replaces_documents() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let mut d = doc("first", 0);
    engine.index_records(dataset, &[d.clone()]).await.unwrap();
    d.status = RecordStatus::Completed;
    d.version += 1;
    engine.index_records(dataset, &[d.clone()]).await.unwrap();

    let stored = engine.document(dataset, d.id).await.unwrap();
    assert_eq!(stored.status, RecordStatus::Completed);
    assert_eq!(engine.len(dataset).await, 1);

    engine.delete_records(dataset, &[d.id, Uuid::new_v4()]).await.unwrap();
    assert!(engine.document(dataset, d.id).await.is_none());
}

#[tokio::test]
async fn memory_keeps_newest_version_when_writes_race() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let older = doc("first", 0);
    let mut newer = older.clone();
    newer.status = RecordStatus::Completed;
    newer.version = older.version + 1;

    // the job that loaded the older row finishes last
    engine.index_records(dataset, &[newer.clone()]).await.unwrap();
    engine.index_records(dataset, &[older.clone()]).await.unwrap();

    let stored = engine.document(dataset, older.id).await.unwrap();
    assert_eq!(stored.status, RecordStatus::Completed);
    assert_eq!(stored.version, newer.version);

    let completed = SearchQuery {
        filters: Filters { record_status: vec![RecordStatus::Completed], ..Default::default() },
        ..Default::default()
    };
    assert_eq!(engine.search(dataset, &completed).await.unwrap().total, 1);
}

#[tokio::test]
async fn memory_text_search_is_conjunctive_and_ranked() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let a = doc("the quick brown fox", 3);
    let b = doc("quick quick fox", 2);
    let c = doc("slow brown dog", 1);
    engine.index_records(dataset, &[a.clone(), b.clone(), c.clone()]).await.unwrap();

    let query = SearchQuery {
        text: Some(TextQuery { q: "Quick fox".into(), field: None }),
        ..Default::default()
    };
    let res = engine.search(dataset, &query).await.unwrap();
    assert_eq!(res.total, 2);
    assert_eq!(res.items[0].record_id, b.id);
    assert_eq!(res.items[1].record_id, a.id);

    let by_field = SearchQuery {
        text: Some(TextQuery { q: "dog".into(), field: Some("missing".into()) }),
        ..Default::default()
    };
    assert_eq!(engine.search(dataset, &by_field).await.unwrap().total, 0);
}

#[tokio::test]
async fn memory_filters_by_status_and_user_response() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut done = with_response(doc("one", 3), alice, ResponseStatus::Submitted);
    done.status = RecordStatus::Completed;
    let drafted = with_response(doc("two", 2), bob, ResponseStatus::Draft);
    let untouched = doc("three", 1);
    engine
        .index_records(dataset, &[done.clone(), drafted.clone(), untouched.clone()])
        .await
        .unwrap();

    let completed = SearchQuery {
        filters: Filters { record_status: vec![RecordStatus::Completed], ..Default::default() },
        ..Default::default()
    };
    let res = engine.search(dataset, &completed).await.unwrap();
    assert_eq!(res.items.len(), 1);
    assert_eq!(res.items[0].record_id, done.id);

    let alice_pending = SearchQuery {
        filters: Filters {
            response: Some(ResponseFilter {
                statuses: vec![ResponseStatusFilter::Pending],
                user_id: Some(alice),
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let ids: Vec<Uuid> = engine
        .search(dataset, &alice_pending)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|i| i.record_id)
        .collect();
    assert_eq!(ids, vec![drafted.id, untouched.id]);

    let nobody = SearchQuery {
        filters: Filters {
            response: Some(ResponseFilter { statuses: vec![ResponseStatusFilter::Pending], user_id: None }),
            ..Default::default()
        },
        ..Default::default()
    };
    let res = engine.search(dataset, &nobody).await.unwrap();
    assert_eq!(res.items.len(), 1);
    assert_eq!(res.items[0].record_id, untouched.id);
}

#[tokio::test]
async fn memory_metadata_sort_and_paging() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let mut docs = Vec::new();
    for i in 0..5 {
        let mut d = doc(&format!("record {i}"), 10 - i);
        d.metadata.insert("split".into(), json!(if i % 2 == 0 { "train" } else { "test" }));
        docs.push(d);
    }
    engine.index_records(dataset, &docs).await.unwrap();

    let query = SearchQuery {
        filters: Filters {
            metadata: vec![TermsFilter { key: "split".into(), values: vec![json!("train")] }],
            ..Default::default()
        },
        sort: vec![Order { field: SortField::InsertedAt, order: SortOrder::Desc }],
        offset: 1,
        limit: 1,
        ..Default::default()
    };
    let res = engine.search(dataset, &query).await.unwrap();
    assert_eq!(res.total, 3);
    assert_eq!(res.items.len(), 1);
    assert_eq!(res.items[0].record_id, docs[2].id);
}

#[tokio::test]
async fn invalid_limit_is_rejected() {
    let engine = InMemorySearchEngine::new();
    let dataset = Uuid::new_v4();
    engine.create_index(&spec(dataset)).await.unwrap();

    let query = SearchQuery { limit: 0, ..Default::default() };
    assert!(matches!(
        engine.search(dataset, &query).await,
        Err(SearchError::InvalidQuery(_))
    ));
}

#[tokio::test]
async fn elasticsearch_creates_missing_index() {
    let server = MockServer::start().await;
    let dataset = Uuid::new_v4();
    let index = format!("/rg.{dataset}");

    Mock::given(method("HEAD"))
        .and(path(index.clone()))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(index.clone()))
        .and(body_string_contains("dynamic_templates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = ElasticsearchEngine::new(server.uri(), "rg");
    engine.create_index(&spec(dataset)).await.unwrap();
}

#[tokio::test]
async fn elasticsearch_bulk_indexes_ndjson() {
    let server = MockServer::start().await;
    let dataset = Uuid::new_v4();
    let d = with_response(doc("hello", 0), Uuid::new_v4(), ResponseStatus::Submitted);

    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(header("content-type", "application/x-ndjson"))
        .and(body_string_contains("\"response_statuses\":[\"submitted\"]"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = ElasticsearchEngine::new(server.uri(), "rg");
    engine.index_records(dataset, &[d]).await.unwrap();
}

#[tokio::test]
async fn elasticsearch_search_maps_hits_and_missing_index() {
    let server = MockServer::start().await;
    let dataset = Uuid::new_v4();
    let missing = Uuid::new_v4();
    let hit = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path(format!("/rg.{dataset}/_search")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"total": {"value": 1}, "hits": [{"_id": hit.to_string(), "_score": null}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/rg.{missing}/_search")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let engine = ElasticsearchEngine::new(format!("{}/", server.uri()), "rg");
    let res = engine.search(dataset, &SearchQuery::default()).await.unwrap();
    assert_eq!(res.total, 1);
    assert_eq!(res.items[0].record_id, hit);
    assert_eq!(res.items[0].score, None);

    assert!(matches!(
        engine.search(missing, &SearchQuery::default()).await,
        Err(SearchError::IndexNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn elasticsearch_delete_of_missing_index_is_ok() {
    let server = MockServer::start().await;
    let dataset = Uuid::new_v4();

    Mock::given(method("DELETE"))
        .and(path(format!("/rg.{dataset}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let engine = ElasticsearchEngine::new(server.uri(), "rg");
    engine.delete_index(dataset).await.unwrap();
}
