use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    EngineInfo, IndexSpec, Order, RecordDocument, Result, SearchEngine, SearchError, SearchItem,
    SearchQuery, SearchResponse, SortField, SortOrder,
};

/// Process-local engine. Used in tests and single-node setups without Elasticsearch.
#[derive(Default)]
pub struct InMemorySearchEngine {
    indices: RwLock<HashMap<Uuid, HashMap<Uuid, RecordDocument>>>,
}

impl InMemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, dataset_id: Uuid, record_id: Uuid) -> Option<RecordDocument> {
        self.indices
            .read()
            .await
            .get(&dataset_id)
            .and_then(|idx| idx.get(&record_id))
            .cloned()
    }

    pub async fn len(&self, dataset_id: Uuid) -> usize {
        self.indices
            .read()
            .await
            .get(&dataset_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchEngine for InMemorySearchEngine {
    async fn create_index(&self, spec: &IndexSpec) -> Result<()> {
        self.indices.write().await.entry(spec.dataset_id).or_default();
        Ok(())
    }

    async fn delete_index(&self, dataset_id: Uuid) -> Result<()> {
        self.indices.write().await.remove(&dataset_id);
        Ok(())
    }

    async fn index_records(&self, dataset_id: Uuid, docs: &[RecordDocument]) -> Result<()> {
        let mut indices = self.indices.write().await;
        let idx = indices
            .get_mut(&dataset_id)
            .ok_or(SearchError::IndexNotFound(dataset_id))?;
        for doc in docs {
            match idx.get(&doc.id) {
                Some(current) if current.version > doc.version => {
                    debug!(record_id=%doc.id, indexed = current.version, incoming = doc.version, "stale document skipped");
                }
                _ => {
                    idx.insert(doc.id, doc.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete_records(&self, dataset_id: Uuid, ids: &[Uuid]) -> Result<()> {
        let mut indices = self.indices.write().await;
        if let Some(idx) = indices.get_mut(&dataset_id) {
            for id in ids {
                idx.remove(id);
            }
        }
        Ok(())
    }

    async fn search(&self, dataset_id: Uuid, query: &SearchQuery) -> Result<SearchResponse> {
        query.validate()?;

        let indices = self.indices.read().await;
        let idx = indices
            .get(&dataset_id)
            .ok_or(SearchError::IndexNotFound(dataset_id))?;

        let terms = query.text.as_ref().map(|t| (tokenize(&t.q), t.field.as_deref()));

        let mut hits: Vec<(&RecordDocument, Option<f32>)> = Vec::new();
        for doc in idx.values() {
            if !passes_filters(doc, query) {
                continue;
            }
            match &terms {
                Some((tokens, field)) => {
                    if let Some(score) = text_score(doc, tokens, *field) {
                        hits.push((doc, Some(score)));
                    }
                }
                None => hits.push((doc, None)),
            }
        }

        sort_hits(&mut hits, &query.sort);

        let total = hits.len() as u64;
        let items = hits
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(doc, score)| SearchItem { record_id: doc.id, score })
            .collect();

        Ok(SearchResponse { items, total })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "memory".to_string(),
            url: None,
        }
    }
}

fn passes_filters(doc: &RecordDocument, query: &SearchQuery) -> bool {
    let f = &query.filters;

    if !f.record_status.is_empty() && !f.record_status.contains(&doc.status) {
        return false;
    }

    if let Some(r) = &f.response {
        let matched = match r.user_id {
            Some(user_id) => {
                let status = doc.responses.get(&user_id).map(|resp| resp.status);
                r.statuses.iter().any(|s| s.matches(status))
            }
            None => r.statuses.iter().any(|s| match s.as_response_status() {
                None => doc.responses.is_empty(),
                Some(wanted) => doc.responses.values().any(|resp| resp.status == wanted),
            }),
        };
        if !matched {
            return false;
        }
    }

    f.metadata.iter().all(|t| {
        doc.metadata
            .get(&t.key)
            .map(|v| t.values.contains(v))
            .unwrap_or(false)
    })
}

/// AND semantics: every query token must appear. Score is the number of matching tokens.
fn text_score(doc: &RecordDocument, tokens: &[String], field: Option<&str>) -> Option<f32> {
    if tokens.is_empty() {
        return None;
    }
    let doc_tokens = tokenize(&doc.text_for(field));
    let mut score = 0usize;
    for t in tokens {
        let n = doc_tokens.iter().filter(|d| *d == t).count();
        if n == 0 {
            return None;
        }
        score += n;
    }
    Some(score as f32)
}

fn sort_hits(hits: &mut [(&RecordDocument, Option<f32>)], sort: &[Order]) {
    hits.sort_by(|(a, sa), (b, sb)| {
        if sort.is_empty() {
            let by_score = match (sa, sb) {
                (Some(x), Some(y)) => y.partial_cmp(x).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            };
            return by_score
                .then(a.inserted_at.cmp(&b.inserted_at))
                .then(a.id.cmp(&b.id));
        }
        for o in sort {
            let ord = match o.field {
                SortField::InsertedAt => a.inserted_at.cmp(&b.inserted_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            let ord = match o.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    });
}

fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
