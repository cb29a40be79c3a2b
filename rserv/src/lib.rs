//! # rserv
//!
//! A self-contained REST prototyping store backed by human-inspectable
//! JSON files, with a graph overlay derived from inter-document
//! references and an asynchronous Sulpher query engine.
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use rserv::{Config, Rserv};
//!
//! fn main() -> rserv::Result<()> {
//!     let rserv = Rserv::open(Config::default())?;
//!
//!     let doc = rserv.create_document(
//!         "users",
//!         serde_json::json!({"name": "Alice"}),
//!     )?;
//!
//!     let outcome = rserv.submit_graph_query(
//!         "MATCH (u:User) RETURN u.name",
//!         None,
//!     )?;
//!
//!     let _ = (doc, outcome);
//!     Ok(())
//! }
//! ```
//!
//! ## Core pieces
//!
//! - [`Rserv`]: the handle. One service method per REST endpoint; the HTTP
//!   transport only parses requests and wraps results in [`envelope`]s.
//! - [`Config`]: every recognised option with flag > env > file > default
//!   precedence.
//! - [`jobs::JobManager`]: bounded worker pool, job table, and the
//!   LRU+TTL result cache keyed by the canonicalised query string.
//! - Storage and query internals are re-exported under [`storage`] and
//!   [`query`].

pub mod config;
pub mod envelope;
mod error;
pub mod jobs;

pub use crate::config::{CacheType, Config};
pub use crate::error::{Error, Result};
pub use crate::jobs::{JobResult, JobStatus, SubmitOutcome};
pub use rserv_api::{Direction, DocId, DocumentCache, GraphView, NodeKey, SearchHit, SearchIndex};
pub use rserv_query as query;
pub use rserv_storage as storage;

use rserv_query::algo;
use rserv_storage::graph::{EdgeIndex, GraphMode, GraphSnapshot};
use rserv_storage::stats::GraphStatistics;
use rserv_storage::store::{DocumentStore, NoopCache, SortOrder, StoreOptions};
use rserv_storage::{INDEX_FILE, fsio};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct Rserv {
    config: Config,
    store: Arc<DocumentStore>,
    graph: Option<Arc<EdgeIndex>>,
    jobs: Option<jobs::JobManager>,
    search: Option<Arc<dyn SearchIndex>>,
}

impl Rserv {
    /// Opens the store described by `config` with the default (no-op)
    /// document cache and no full-text indexer.
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(NoopCache), None)
    }

    /// Opens with explicit collaborator drivers. The cache and indexer are
    /// external concerns; anything implementing the traits plugs in here.
    pub fn open_with(
        config: Config,
        cache: Arc<dyn DocumentCache>,
        search: Option<Arc<dyn SearchIndex>>,
    ) -> Result<Self> {
        let graph = if config.graph_enabled {
            let index_path = match config.rserv_graph {
                GraphMode::Indexed => {
                    Some(fsio::data_dir(&config.data_dir, &config.schema).join(INDEX_FILE))
                }
                GraphMode::Memory => None,
            };
            Some(Arc::new(EdgeIndex::new(config.rserv_graph, index_path)))
        } else {
            None
        };

        let store = Arc::new(DocumentStore::open(
            &config.data_dir,
            config.schema.as_str(),
            StoreOptions {
                patch_null: config.patch_null,
                cascading_delete: config.cascading_delete,
                default_page_size: config.default_page_size,
            },
            graph.clone(),
            cache,
        )?);

        let jobs = match &graph {
            Some(_) => {
                let manager = jobs::JobManager::new(
                    config.query_worker_count,
                    Duration::from_secs(config.cache_ttl),
                    Duration::from_secs(config.query_timeout),
                );
                store.subscribe(manager.invalidation_hook());
                Some(manager)
            }
            None => None,
        };

        info!(
            schema = %config.schema,
            data_dir = %config.data_dir.display(),
            graph = config.graph_enabled,
            "rserv store opened"
        );

        Ok(Self {
            config,
            store,
            graph,
            jobs,
            search,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    fn graph(&self) -> Result<&Arc<EdgeIndex>> {
        self.graph
            .as_ref()
            .ok_or_else(|| Error::NotFound("graph support is disabled".to_string()))
    }

    fn jobs(&self) -> Result<&jobs::JobManager> {
        self.jobs
            .as_ref()
            .ok_or_else(|| Error::NotFound("graph support is disabled".to_string()))
    }

    pub fn graph_snapshot(&self) -> Result<GraphSnapshot> {
        Ok(self.graph()?.snapshot())
    }

    // ----- documents -----

    /// `POST /api/v1/<entity>` (201 on success).
    pub fn create_document(&self, entity: &str, body: Value) -> Result<Value> {
        let (_, doc) = self.store.create(entity, body_object(body)?)?;
        Ok(doc)
    }

    /// `POST /api/v1/<entity>/save/<id>`; 409 when the id is taken.
    pub fn save_document(&self, entity: &str, id: DocId, body: Value) -> Result<Value> {
        Ok(self.store.save(entity, id, body_object(body)?)?)
    }

    /// `GET /api/v1/<entity>/<id>`.
    pub fn get_document(&self, entity: &str, id: DocId) -> Result<Value> {
        Ok(self.store.get(entity, id)?)
    }

    /// `PUT /api/v1/<entity>/<id>`.
    pub fn replace_document(&self, entity: &str, id: DocId, body: Value) -> Result<Value> {
        Ok(self.store.replace(entity, id, body_object(body)?)?)
    }

    /// `PATCH /api/v1/<entity>/<id>`; nulls follow the `patch_null` policy.
    pub fn patch_document(&self, entity: &str, id: DocId, body: Value) -> Result<Value> {
        Ok(self.store.patch(entity, id, body_object(body)?)?)
    }

    /// `DELETE /api/v1/<entity>/<id>[?cascade=true]`.
    pub fn delete_document(&self, entity: &str, id: DocId, cascade: bool) -> Result<()> {
        Ok(self.store.delete(entity, id, cascade)?)
    }

    /// `GET /api/v1/<entity>/list?page=&per_page=&sort=field:asc,...`.
    pub fn list_documents(
        &self,
        entity: &str,
        page: Option<usize>,
        per_page: Option<usize>,
        sort: Option<&str>,
    ) -> Result<Value> {
        let sort = parse_sort_spec(sort)?;
        let listing = self.store.list(entity, page, per_page, &sort)?;
        Ok(json!({
            "items": listing.items,
            "total": listing.total,
            "page": listing.page,
            "per_page": listing.per_page,
        }))
    }

    /// `GET /api/v1/<entity>/search?query=&field=`.
    pub fn search_documents(
        &self,
        entity: &str,
        query: &str,
        field: Option<&str>,
        page: Option<usize>,
        per_page: Option<usize>,
    ) -> Result<Value> {
        if !self.config.fulltext_enabled {
            return Err(Error::validation("query", "full-text search is disabled"));
        }
        let Some(search) = &self.search else {
            return Err(Error::validation("query", "no full-text indexer installed"));
        };
        let hits: Vec<SearchHit> = search
            .search(query, field)
            .into_iter()
            .filter(|hit| hit.entity == entity)
            .collect();
        let total = hits.len();
        let per_page = per_page.unwrap_or(self.config.default_page_size).max(1);
        let page = page.unwrap_or(1).max(1);
        let start = (page - 1).saturating_mul(per_page).min(total);
        let end = start.saturating_add(per_page).min(total);

        let mut items = Vec::new();
        for hit in &hits[start..end] {
            items.push(json!({
                "score": hit.score,
                "document": self.store.get(&hit.entity, hit.id)?,
            }));
        }
        Ok(json!({
            "items": items,
            "total": total,
            "page": page,
            "per_page": per_page,
        }))
    }

    // ----- graph -----

    /// `POST /api/v1/graph/query`: 200 with cached results, or 202 with a
    /// job id to poll.
    pub fn submit_graph_query(
        &self,
        query: &str,
        max_depth: Option<u32>,
    ) -> Result<SubmitOutcome> {
        let snapshot = self.graph()?.snapshot();
        self.jobs()?.submit(
            query,
            max_depth.unwrap_or(self.config.max_query_depth),
            snapshot,
        )
    }

    /// `GET /api/v1/graph/query/<id>`.
    pub fn graph_query_status(&self, id: Uuid) -> Result<jobs::JobStatusView> {
        self.jobs()?
            .status(id)
            .ok_or_else(|| Error::NotFound(format!("no graph query job {id}")))
    }

    /// `GET /api/v1/graph/query/<id>/result`; 409 until terminal.
    pub fn graph_query_result(&self, id: Uuid) -> Result<Value> {
        match self.jobs()?.result(id)? {
            JobResult::Completed { results } => Ok(json!({ "results": results })),
            JobResult::Failed { error } => Ok(json!({ "error": error })),
        }
    }

    /// Runs a query synchronously, outside the job manager. Used by the
    /// command-line tools.
    pub fn run_query(&self, query: &str, max_depth: Option<u32>) -> Result<Vec<Value>> {
        let snapshot = self.graph()?.snapshot();
        let opts = rserv_query::ExecOptions {
            max_depth: max_depth.unwrap_or(self.config.max_query_depth),
            deadline: Some(
                std::time::Instant::now() + Duration::from_secs(self.config.query_timeout),
            ),
        };
        let output = rserv_query::query_collect(&snapshot, query, opts)?;
        Ok(output.rows.iter().map(|row| row.to_json()).collect())
    }

    fn resolve_node(&self, id: DocId) -> Result<NodeKey> {
        self.graph()?
            .resolve_id(id)
            .ok_or_else(|| Error::NotFound(format!("no graph node with id {id}")))
    }

    /// `POST /api/v1/graph/shortestPath`.
    pub fn shortest_path(
        &self,
        start: DocId,
        end: DocId,
        max_depth: Option<u32>,
    ) -> Result<Vec<DocId>> {
        let graph = self.graph()?;
        let start = self.resolve_node(start)?;
        let end = self.resolve_node(end)?;
        let depth = max_depth.unwrap_or(self.config.max_query_depth);
        match algo::shortest_path(graph.as_ref(), start, end, depth, None) {
            Some(path) => Ok(path.into_iter().map(|n| n.id).collect()),
            None => Err(Error::NotFound(format!(
                "no path from {} to {} within depth {depth}",
                start.id, end.id
            ))),
        }
    }

    /// `POST /api/v1/graph/pathExists`. Unknown endpoints simply do not
    /// connect, so they answer `false` rather than 404.
    pub fn path_exists(&self, start: DocId, end: DocId, max_depth: Option<u32>) -> Result<bool> {
        let graph = self.graph()?;
        let (Some(start), Some(end)) = (graph.resolve_id(start), graph.resolve_id(end)) else {
            return Ok(false);
        };
        let depth = max_depth.unwrap_or(self.config.max_query_depth);
        Ok(algo::path_exists(graph.as_ref(), start, end, depth, None))
    }

    /// `POST /api/v1/graph/commonNeighbors`.
    pub fn common_neighbors(&self, a: DocId, b: DocId) -> Result<Vec<DocId>> {
        let graph = self.graph()?;
        let a = self.resolve_node(a)?;
        let b = self.resolve_node(b)?;
        Ok(algo::common_neighbors(graph.as_ref(), a, b)
            .into_iter()
            .map(|n| n.id)
            .collect())
    }

    /// `GET /api/v1/graph/nodes/<id>`.
    pub fn get_node(&self, id: DocId) -> Result<Value> {
        let graph = self.graph()?;
        let node = self.resolve_node(id)?;
        let mut properties = graph.node_properties(node).unwrap_or_default();
        properties.remove("id");
        Ok(json!({
            "id": node.id,
            "type": graph.node_type(node),
            "properties": properties,
        }))
    }

    /// `GET /api/v1/graph/nodes/<id>/degree?direction=`.
    pub fn node_degree(&self, id: DocId, direction: Option<&str>) -> Result<Value> {
        let graph = self.graph()?;
        let node = self.resolve_node(id)?;
        let direction = parse_direction(direction)?;
        let degree = algo::degree(graph.as_ref(), node, direction);
        Ok(json!({
            "id": node.id,
            "direction": direction,
            "degree": degree,
        }))
    }

    /// `POST /api/v1/graph/nodes/neighborhoodAggregate`.
    pub fn neighborhood_aggregate(
        &self,
        id: DocId,
        depth: u32,
        property: &str,
        aggregation: &str,
    ) -> Result<Value> {
        let graph = self.graph()?;
        let node = self.resolve_node(id)?;
        let agg = algo::NeighborhoodAgg::parse(aggregation).ok_or_else(|| {
            Error::validation(
                "aggregation",
                format!("unknown aggregation {aggregation:?}, expected count, sum, or avg"),
            )
        })?;
        let value = algo::neighborhood_aggregate(graph.as_ref(), node, depth, property, agg)
            .map_err(|e| Error::validation(property, e.to_string()))?;
        Ok(json!({
            "id": node.id,
            "depth": depth,
            "property": property,
            "aggregation": aggregation,
            "value": value,
        }))
    }

    /// `GET /api/v1/graph/statistics`.
    pub fn statistics(&self) -> Result<GraphStatistics> {
        Ok(self.graph()?.statistics())
    }

    /// `GET /api/v1/graph/<node_ref>/in|out`.
    pub fn node_links(&self, id: DocId, direction: &str) -> Result<Value> {
        let graph = self.graph()?;
        let node = self.resolve_node(id)?;
        let edges = match direction {
            "in" => graph.inbound(node),
            "out" => graph.outbound(node),
            other => {
                return Err(Error::validation(
                    "direction",
                    format!("unknown direction {other:?}, expected in or out"),
                ));
            }
        };
        let links: Vec<Value> = edges
            .into_iter()
            .map(|edge| json!({ "label": edge.label, "id": edge.peer.id }))
            .collect();
        Ok(json!({ "id": node.id, "direction": direction, "links": links }))
    }
}

fn body_object(body: Value) -> Result<Map<String, Value>> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(Error::validation("body", "expected a JSON object")),
    }
}

fn parse_direction(direction: Option<&str>) -> Result<Direction> {
    match direction.unwrap_or("all") {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        "all" => Ok(Direction::All),
        other => Err(Error::validation(
            "direction",
            format!("unknown direction {other:?}, expected in, out, or all"),
        )),
    }
}

/// `field:asc,other:desc` (direction optional, `asc` default).
fn parse_sort_spec(sort: Option<&str>) -> Result<Vec<(String, SortOrder)>> {
    let Some(sort) = sort else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for part in sort.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (field, order) = match part.split_once(':') {
            Some((field, "asc")) => (field, SortOrder::Asc),
            Some((field, "desc")) => (field, SortOrder::Desc),
            Some((_, other)) => {
                return Err(Error::validation(
                    "sort",
                    format!("unknown sort direction {other:?}"),
                ));
            }
            None => (part, SortOrder::Asc),
        };
        if field.is_empty() {
            return Err(Error::validation("sort", "empty sort field"));
        }
        out.push((field.to_string(), order));
    }
    Ok(out)
}
