use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::{
    EngineInfo, IndexSpec, RecordDocument, Result, SearchEngine, SearchError, SearchItem,
    SearchQuery, SearchResponse, SortOrder,
};

/// Elasticsearch / OpenSearch engine speaking the plain REST API.
pub struct ElasticsearchEngine {
    base_url: String,
    index_prefix: String,
    client: reqwest::Client,
}

impl ElasticsearchEngine {
    pub fn new(base_url: impl Into<String>, index_prefix: impl Into<String>) -> Self {
        Self::with_client(base_url, index_prefix, reqwest::Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        index_prefix: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index_prefix: index_prefix.into(),
            client,
        }
    }

    pub fn index_name(&self, dataset_id: Uuid) -> String {
        format!("{}.{}", self.index_prefix, dataset_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn bulk(&self, dataset_id: Uuid, body: String) -> Result<()> {
        let resp = self
            .client
            .post(self.url("_bulk?refresh=wait_for"))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let json: JsonValue = check(resp).await?.json().await?;
        bulk_errors(dataset_id, &json)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(SearchError::Engine { status, body })
}

#[async_trait]
impl SearchEngine for ElasticsearchEngine {
    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        let url = self.url(&self.index_name(spec.dataset_id));

        let exists = self.client.head(&url).send().await?;
        if exists.status().is_success() {
            return Ok(());
        }

        debug!(index=%self.index_name(spec.dataset_id), "creating search index");
        let resp = self.client.put(&url).json(&index_body(spec)).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn delete_index(&self, dataset_id: Uuid) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&self.index_name(dataset_id)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    async fn index_records(&self, dataset_id: Uuid, docs: &[RecordDocument]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let body = bulk_index_body(&self.index_name(dataset_id), docs)?;
        self.bulk(dataset_id, body).await
    }

    async fn delete_records(&self, dataset_id: Uuid, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = bulk_delete_body(&self.index_name(dataset_id), ids)?;
        self.bulk(dataset_id, body).await
    }

    async fn search(&self, dataset_id: Uuid, query: &SearchQuery) -> Result<SearchResponse> {
        query.validate()?;

        let url = self.url(&format!("{}/_search", self.index_name(dataset_id)));
        let resp = self.client.post(url).json(&search_body(query)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SearchError::IndexNotFound(dataset_id));
        }
        let json: JsonValue = check(resp).await?.json().await?;
        parse_search_response(&json)
    }

    async fn ping(&self) -> Result<()> {
        let resp = self.client.get(self.url("/")).send().await?;
        check(resp).await?;
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "elasticsearch".to_string(),
            url: Some(self.base_url.clone()),
        }
    }
}

pub(crate) fn index_body(spec: &IndexSpec) -> JsonValue {
    json!({
        "settings": {
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "_meta": {
                "fields": spec.fields,
                "questions": spec.questions,
            },
            "dynamic_templates": [
                {"field_text": {
                    "path_match": "fields.*",
                    "match_mapping_type": "string",
                    "mapping": {"type": "text"}
                }},
                {"metadata_terms": {
                    "path_match": "metadata.*",
                    "match_mapping_type": "string",
                    "mapping": {"type": "keyword"}
                }},
                {"response_status": {
                    "path_match": "responses.*.status",
                    "mapping": {"type": "keyword"}
                }},
                {"response_values": {
                    "path_match": "responses.*.values",
                    "mapping": {"type": "object", "enabled": false}
                }}
            ],
            "properties": {
                "id": {"type": "keyword"},
                "external_id": {"type": "keyword"},
                "status": {"type": "keyword"},
                "version": {"type": "long"},
                "response_statuses": {"type": "keyword"},
                "inserted_at": {"type": "date"},
                "updated_at": {"type": "date"},
                "suggestions": {"type": "object", "enabled": false}
            }
        }
    })
}

pub(crate) fn document_body(doc: &RecordDocument) -> Result<JsonValue> {
    let mut body = serde_json::to_value(doc)?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "response_statuses".to_string(),
            serde_json::to_value(doc.response_statuses())?,
        );
    }
    Ok(body)
}

pub(crate) fn bulk_index_body(index: &str, docs: &[RecordDocument]) -> Result<String> {
    let mut out = String::new();
    for doc in docs {
        // external_gte: equal versions overwrite, lower ones are rejected with 409
        let action = json!({"index": {
            "_index": index,
            "_id": doc.id,
            "version": doc.version,
            "version_type": "external_gte",
        }});
        out.push_str(&action.to_string());
        out.push('\n');
        out.push_str(&document_body(doc)?.to_string());
        out.push('\n');
    }
    Ok(out)
}

pub(crate) fn bulk_delete_body(index: &str, ids: &[Uuid]) -> Result<String> {
    let mut out = String::new();
    for id in ids {
        out.push_str(&json!({"delete": {"_index": index, "_id": id}}).to_string());
        out.push('\n');
    }
    Ok(out)
}

/// First real item failure of a bulk call. Version conflicts mean a newer
/// document is already indexed and are not failures.
fn bulk_errors(dataset_id: Uuid, resp: &JsonValue) -> Result<()> {
    if !resp.get("errors").and_then(JsonValue::as_bool).unwrap_or(false) {
        return Ok(());
    }
    let items = resp.get("items").and_then(JsonValue::as_array);
    for item in items.into_iter().flatten() {
        let Some(op) = item.as_object().and_then(|o| o.values().next()) else {
            continue;
        };
        let Some(error) = op.get("error") else {
            continue;
        };
        let status = op.get("status").and_then(JsonValue::as_u64).unwrap_or(500) as u16;
        match error.get("type").and_then(JsonValue::as_str) {
            Some("version_conflict_engine_exception") => {
                debug!(id = ?op.get("_id"), "stale document skipped");
            }
            Some("index_not_found_exception") => return Err(SearchError::IndexNotFound(dataset_id)),
            _ => return Err(SearchError::Engine { status, body: error.to_string() }),
        }
    }
    Ok(())
}

pub(crate) fn search_body(query: &SearchQuery) -> JsonValue {
    let mut must: Vec<JsonValue> = Vec::new();
    let mut filter: Vec<JsonValue> = Vec::new();

    if let Some(text) = &query.text {
        must.push(match &text.field {
            Some(field) => json!({"match": {format!("fields.{field}"): {"query": text.q, "operator": "and"}}}),
            None => json!({"multi_match": {"query": text.q, "fields": ["fields.*"], "operator": "and"}}),
        });
    }

    let f = &query.filters;
    if !f.record_status.is_empty() {
        filter.push(json!({"terms": {"status": f.record_status}}));
    }

    if let Some(r) = &f.response {
        let should: Vec<JsonValue> = r
            .statuses
            .iter()
            .map(|s| {
                let status_field = match r.user_id {
                    Some(user_id) => format!("responses.{user_id}.status"),
                    None => "response_statuses".to_string(),
                };
                match s.as_response_status() {
                    Some(status) => json!({"term": {status_field: status}}),
                    None => json!({"bool": {"must_not": {"exists": {"field": status_field}}}}),
                }
            })
            .collect();
        filter.push(json!({"bool": {"should": should, "minimum_should_match": 1}}));
    }

    for t in &f.metadata {
        filter.push(json!({"terms": {format!("metadata.{}", t.key): t.values}}));
    }

    let mut sort: Vec<JsonValue> = Vec::new();
    if query.sort.is_empty() {
        if query.text.is_some() {
            sort.push(json!("_score"));
        }
        sort.push(json!({"inserted_at": "asc"}));
    } else {
        for o in &query.sort {
            let order = match o.order {
                SortOrder::Asc => "asc",
                SortOrder::Desc => "desc",
            };
            sort.push(json!({o.field.as_str(): order}));
        }
    }
    sort.push(json!({"id": "asc"}));

    let bool_query = if must.is_empty() && filter.is_empty() {
        json!({"match_all": {}})
    } else {
        json!({"bool": {"must": must, "filter": filter}})
    };

    json!({
        "from": query.offset,
        "size": query.limit,
        "track_total_hits": true,
        "_source": false,
        "query": bool_query,
        "sort": sort,
    })
}

pub(crate) fn parse_search_response(resp: &JsonValue) -> Result<SearchResponse> {
    let hits = &resp["hits"];
    let total = hits["total"]["value"].as_u64().unwrap_or(0);

    let mut items = Vec::new();
    for hit in hits["hits"].as_array().into_iter().flatten() {
        let id = hit["_id"].as_str().unwrap_or_default();
        let record_id = Uuid::parse_str(id).map_err(|e| SearchError::Engine {
            status: 200,
            body: format!("unexpected document id `{id}`: {e}"),
        })?;
        items.push(SearchItem {
            record_id,
            score: hit["_score"].as_f64().map(|s| s as f32),
        });
    }
    Ok(SearchResponse { items, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Filters, Order, ResponseFilter, ResponseStatusFilter, SortField, TermsFilter, TextQuery};
    use annotations::RecordStatus;

    #[test]
    fn empty_query_matches_all_sorted_by_insertion() {
        let body = search_body(&SearchQuery::default());
        assert_eq!(body["query"], json!({"match_all": {}}));
        assert_eq!(body["sort"], json!([{"inserted_at": "asc"}, {"id": "asc"}]));
        assert_eq!(body["size"], json!(50));
    }

    #[test]
    fn text_and_filters_build_bool_query() {
        let user = Uuid::new_v4();
        let query = SearchQuery {
            text: Some(TextQuery { q: "hello".into(), field: Some("prompt".into()) }),
            filters: Filters {
                record_status: vec![RecordStatus::Pending],
                response: Some(ResponseFilter {
                    statuses: vec![ResponseStatusFilter::Pending, ResponseStatusFilter::Draft],
                    user_id: Some(user),
                }),
                metadata: vec![TermsFilter { key: "split".into(), values: vec![json!("train")] }],
            },
            ..Default::default()
        };

        let body = search_body(&query);
        let b = &body["query"]["bool"];
        assert_eq!(
            b["must"][0],
            json!({"match": {"fields.prompt": {"query": "hello", "operator": "and"}}})
        );
        assert_eq!(b["filter"][0], json!({"terms": {"status": ["pending"]}}));

        let should = &b["filter"][1]["bool"]["should"];
        let status_field = format!("responses.{user}.status");
        assert_eq!(
            should[0],
            json!({"bool": {"must_not": {"exists": {"field": status_field.clone()}}}})
        );
        assert_eq!(should[1], json!({"term": {status_field: "draft"}}));
        assert_eq!(b["filter"][2], json!({"terms": {"metadata.split": ["train"]}}));
        assert_eq!(body["sort"][0], json!("_score"));
    }

    #[test]
    fn explicit_sort_replaces_default() {
        let query = SearchQuery {
            sort: vec![Order { field: SortField::UpdatedAt, order: SortOrder::Desc }],
            ..Default::default()
        };
        assert_eq!(
            search_body(&query)["sort"],
            json!([{"updated_at": "desc"}, {"id": "asc"}])
        );
    }

    #[test]
    fn bulk_delete_is_ndjson() {
        let id = Uuid::new_v4();
        let body = bulk_delete_body("rg.x", &[id]).unwrap();
        assert!(body.ends_with('\n'));
        let line: JsonValue = serde_json::from_str(body.trim_end()).unwrap();
        assert_eq!(line, json!({"delete": {"_index": "rg.x", "_id": id.to_string()}}));
    }

    #[test]
    fn bulk_item_errors_surface() {
        let resp = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 201}},
                {"index": {"_id": "b", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        });
        match bulk_errors(Uuid::nil(), &resp) {
            Err(SearchError::Engine { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("mapper_parsing_exception"));
            }
            other => panic!("expected engine error, got {other:?}"),
        }
        assert!(bulk_errors(Uuid::nil(), &json!({"errors": false, "items": []})).is_ok());
    }

    #[test]
    fn version_conflicts_are_not_errors() {
        let resp = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "a", "status": 200}},
                {"index": {"_id": "b", "status": 409, "error": {"type": "version_conflict_engine_exception"}}}
            ]
        });
        assert!(bulk_errors(Uuid::nil(), &resp).is_ok());
    }

    #[test]
    fn missing_index_items_map_to_index_not_found() {
        let dataset = Uuid::new_v4();
        let resp = json!({
            "errors": true,
            "items": [
                {"delete": {"_id": "a", "status": 404, "error": {"type": "index_not_found_exception", "index": "rg.x"}}}
            ]
        });
        assert!(matches!(
            bulk_errors(dataset, &resp),
            Err(SearchError::IndexNotFound(id)) if id == dataset
        ));
    }

    #[test]
    fn bulk_index_uses_external_versions() {
        let doc = RecordDocument {
            id: Uuid::new_v4(),
            external_id: None,
            fields: Default::default(),
            metadata: Default::default(),
            status: RecordStatus::Pending,
            responses: Default::default(),
            suggestions: Default::default(),
            version: 7,
            inserted_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let body = bulk_index_body("rg.x", &[doc.clone()]).unwrap();
        let action: JsonValue = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(action["index"]["version"], json!(7));
        assert_eq!(action["index"]["version_type"], json!("external_gte"));
        assert_eq!(action["index"]["_id"], json!(doc.id.to_string()));
    }

    #[test]
    fn search_hits_are_parsed() {
        let id = Uuid::new_v4();
        let resp = json!({"hits": {"total": {"value": 12}, "hits": [{"_id": id.to_string(), "_score": 1.5}]}});
        let parsed = parse_search_response(&resp).unwrap();
        assert_eq!(parsed.total, 12);
        assert_eq!(parsed.items, vec![SearchItem { record_id: id, score: Some(1.5) }]);
    }
}
