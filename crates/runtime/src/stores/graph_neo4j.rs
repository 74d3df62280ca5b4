//! Neo4j adapter for the graph port.
//!
//! All writes are parameterized MERGEs; node labels and edge types are
//! interpolated only from the typed enums, never from caller strings.

use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info, warn};

use super::{EdgeKind, GraphStore, NodeExpansion, NodeLabel};
use crate::types::{
    unix_time, ChunkNode, ConceptNode, ContextNode, EntityNode, EventNode, MacroEventNode,
    MemoryError, State, StateKind, StateStatus,
};

fn store_err(e: neo4rs::Error) -> MemoryError {
    MemoryError::Store {
        reason: format!("neo4j: {e}"),
    }
}

pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, MemoryError> {
        let graph = Graph::new(uri, user, password).await.map_err(store_err)?;
        info!(uri, "neo4j driver connected");
        Ok(Self { graph })
    }

    fn state_from_node(node: &neo4rs::Node) -> Option<State> {
        let kind = StateKind::parse(&node.get::<String>("type").unwrap_or_default())?;
        let status = match node.get::<String>("status").unwrap_or_default().as_str() {
            "active" => StateStatus::Active,
            "completed" => StateStatus::Completed,
            "invalid" => StateStatus::Invalid,
            _ => return None,
        };
        Some(State {
            id: node.get::<String>("id").unwrap_or_default(),
            kind,
            desc: node.get::<String>("desc").unwrap_or_default(),
            status,
            created: node.get::<f64>("created").unwrap_or_default(),
            updated: node.get::<f64>("updated").unwrap_or_default(),
            visit_count: node.get::<i64>("visit_count").unwrap_or_default().max(0) as u64,
            last_visited: node.get::<f64>("last_visited").unwrap_or_default(),
        })
    }

    async fn states_where(
        &self,
        kind: StateKind,
        status: &str,
        order_field: &str,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError> {
        let cypher = format!(
            "MATCH (s:State {{type: $type, status: $status}}) \
             RETURN s ORDER BY s.{order_field} DESC LIMIT $limit"
        );
        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("type", kind.as_str())
                    .param("status", status)
                    .param("limit", limit as i64),
            )
            .await
            .map_err(store_err)?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = result.next().await {
            if let Ok(node) = row.get::<neo4rs::Node>("s") {
                if let Some(state) = Self::state_from_node(&node) {
                    states.push(state);
                }
            }
        }
        Ok(states)
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn ensure_schema(&self) -> Result<(), MemoryError> {
        let statements = [
            "CREATE CONSTRAINT context_uid_unique IF NOT EXISTS FOR (c:Context) REQUIRE c.uid IS UNIQUE",
            "CREATE CONSTRAINT entity_uid_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.uid IS UNIQUE",
            "CREATE CONSTRAINT event_uid_unique IF NOT EXISTS FOR (e:Event) REQUIRE e.uid IS UNIQUE",
            "CREATE CONSTRAINT concept_uid_unique IF NOT EXISTS FOR (c:Concept) REQUIRE c.uid IS UNIQUE",
            "CREATE CONSTRAINT chunk_uid_unique IF NOT EXISTS FOR (c:Chunk) REQUIRE c.uid IS UNIQUE",
            "CREATE CONSTRAINT macro_event_uid_unique IF NOT EXISTS FOR (m:MacroEvent) REQUIRE m.uid IS UNIQUE",
            "CREATE CONSTRAINT state_id_unique IF NOT EXISTS FOR (s:State) REQUIRE s.id IS UNIQUE",
            "CREATE INDEX entity_domain_idx IF NOT EXISTS FOR (e:Entity) ON (e.domain)",
            "CREATE INDEX event_domain_idx IF NOT EXISTS FOR (e:Event) ON (e.domain)",
            "CREATE INDEX event_timestamp_idx IF NOT EXISTS FOR (e:Event) ON (e.timestamp)",
            "CREATE INDEX event_flow_idx IF NOT EXISTS FOR (e:Event) ON (e.flow_id, e.flow_step)",
            "CREATE INDEX state_type_status_idx IF NOT EXISTS FOR (s:State) ON (s.type, s.status)",
        ];
        for statement in statements {
            if let Err(e) = self.graph.run(query(statement)).await {
                warn!(error = %e, "schema statement failed (may already exist)");
            }
        }
        info!("neo4j constraints and indexes ensured");
        Ok(())
    }

    async fn merge_context(&self, node: &ContextNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (c:Context {uid: $uid}) \
                     SET c.name = $name, c.domain = $domain, c.description = $description",
                )
                .param("uid", node.uid.as_str())
                .param("name", node.name.as_str())
                .param("domain", node.domain.as_str())
                .param("description", node.description.as_str()),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_entity(&self, node: &EntityNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (e:Entity {uid: $uid}) \
                     SET e.name = $name, e.subtype = $subtype, e.domain = $domain, \
                         e.description = $description, e.vector_id = $vector_id",
                )
                .param("uid", node.uid.as_str())
                .param("name", node.name.as_str())
                .param("subtype", node.subtype.as_str())
                .param("domain", node.domain.as_str())
                .param("description", node.description.as_str())
                .param("vector_id", node.vector_id.clone().unwrap_or_default()),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_event(&self, node: &EventNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (e:Event {uid: $uid}) \
                     SET e.name = $name, e.subtype = $subtype, e.domain = $domain, \
                         e.description = $description, e.timestamp = $timestamp, \
                         e.flow_id = $flow_id, e.flow_step = $flow_step, \
                         e.vector_id = $vector_id",
                )
                .param("uid", node.uid.as_str())
                .param("name", node.name.as_str())
                .param("subtype", node.subtype.as_str())
                .param("domain", node.domain.as_str())
                .param("description", node.description.as_str())
                .param("timestamp", node.timestamp)
                .param("flow_id", node.flow_id.as_str())
                .param("flow_step", node.flow_step)
                .param("vector_id", node.vector_id.clone().unwrap_or_default()),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_concept(&self, node: &ConceptNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (c:Concept {uid: $uid}) \
                     SET c.name = $name, c.subtype = $subtype, c.domain = $domain, \
                         c.description = $description, c.vector_id = $vector_id",
                )
                .param("uid", node.uid.as_str())
                .param("name", node.name.as_str())
                .param("subtype", node.subtype.as_str())
                .param("domain", node.domain.as_str())
                .param("description", node.description.as_str())
                .param("vector_id", node.vector_id.clone().unwrap_or_default()),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_chunk(&self, node: &ChunkNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (c:Chunk {uid: $uid}) \
                     SET c.content = $content, c.source = $source, c.domain = $domain, \
                         c.token_count = $token_count",
                )
                .param("uid", node.uid.as_str())
                .param("content", node.content.as_str())
                .param("source", node.source.as_str())
                .param("domain", node.domain.as_str())
                .param("token_count", node.token_count as i64),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_macro_event(&self, node: &MacroEventNode) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MERGE (m:MacroEvent {uid: $uid}) \
                     SET m.name = $name, m.description = $description, \
                         m.event_count = $event_count, m.created_at = $created_at",
                )
                .param("uid", node.uid.as_str())
                .param("name", node.name.as_str())
                .param("description", node.description.as_str())
                .param("event_count", node.event_count as i64)
                .param("created_at", unix_time()),
            )
            .await
            .map_err(store_err)
    }

    async fn merge_edge(
        &self,
        start_uid: &str,
        start: NodeLabel,
        end_uid: &str,
        end: NodeLabel,
        edge: EdgeKind,
    ) -> Result<(), MemoryError> {
        // Labels come from the enums only; the uids stay parameterized.
        let cypher = format!(
            "MATCH (a:{start} {{uid: $start_uid}}) \
             MATCH (b:{end} {{uid: $end_uid}}) \
             MERGE (a)-[r:{edge}]->(b) \
             RETURN type(r) AS rel",
            start = start.as_str(),
            end = end.as_str(),
            edge = edge.as_str(),
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("start_uid", start_uid)
                    .param("end_uid", end_uid),
            )
            .await
            .map_err(store_err)?;

        match result.next().await {
            Ok(Some(_)) => {
                debug!(edge = edge.as_str(), "merged relationship");
                Ok(())
            }
            Ok(None) => Err(MemoryError::NotFound {
                reason: format!("edge endpoint missing: {start_uid} -> {end_uid}"),
            }),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn expand_context(&self, uids: &[String]) -> Result<Vec<NodeExpansion>, MemoryError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let cypher = "\
            MATCH (start) WHERE start.uid IN $uids \
            OPTIONAL MATCH (start)-[:CAUSED]->(consequence) \
            OPTIONAL MATCH (agent)-[:INITIATED]->(start) \
            OPTIONAL MATCH (start)-[:NEXT]->(next_step) \
            RETURN start.uid AS uid, \
                   head(labels(start)) AS node_type, \
                   coalesce(start.name, '') AS name, \
                   coalesce(start.description, '') AS description, \
                   [x IN collect(DISTINCT consequence) WHERE x IS NOT NULL | \
                        coalesce(x.name, '') + '|' + coalesce(x.subtype, '')] AS consequences, \
                   [x IN collect(DISTINCT agent) WHERE x IS NOT NULL | \
                        coalesce(x.name, '') + '|' + coalesce(x.subtype, '')] AS agents, \
                   [x IN collect(DISTINCT next_step) WHERE x IS NOT NULL | \
                        coalesce(x.name, '') + '|' + coalesce(x.subtype, '')] AS next_steps";

        let mut result = self
            .graph
            .execute(query(cypher).param("uids", uids.to_vec()))
            .await
            .map_err(store_err)?;

        let format_rel = |prefix: &str, encoded: &str| -> Option<String> {
            let (name, subtype) = encoded.split_once('|')?;
            Some(format!("{prefix} {name} ({subtype})"))
        };

        let mut expanded = Vec::new();
        while let Ok(Some(row)) = result.next().await {
            let mut relationships = Vec::new();
            for encoded in row.get::<Vec<String>>("consequences").unwrap_or_default() {
                relationships.extend(format_rel("CAUSED ->", &encoded));
            }
            for encoded in row.get::<Vec<String>>("agents").unwrap_or_default() {
                relationships.extend(format_rel("INITIATED BY <-", &encoded));
            }
            for encoded in row.get::<Vec<String>>("next_steps").unwrap_or_default() {
                relationships.extend(format_rel("NEXT ->", &encoded));
            }

            expanded.push(NodeExpansion {
                uid: row.get::<String>("uid").unwrap_or_default(),
                node_type: row.get::<String>("node_type").unwrap_or_default(),
                name: row.get::<String>("name").unwrap_or_default(),
                description: row.get::<String>("description").unwrap_or_default(),
                relationships,
            });
        }
        Ok(expanded)
    }

    async fn old_unconsolidated_events(
        &self,
        cutoff: f64,
        limit: usize,
    ) -> Result<Vec<EventNode>, MemoryError> {
        let cypher = "\
            MATCH (e:Event) \
            WHERE e.timestamp < $cutoff \
              AND NOT (e)-[:CONSOLIDATED_INTO]->(:MacroEvent) \
            RETURN e ORDER BY e.timestamp ASC LIMIT $limit";

        let mut result = self
            .graph
            .execute(
                query(cypher)
                    .param("cutoff", cutoff)
                    .param("limit", limit as i64),
            )
            .await
            .map_err(store_err)?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = result.next().await {
            let Ok(node) = row.get::<neo4rs::Node>("e") else {
                continue;
            };
            events.push(EventNode {
                uid: node.get::<String>("uid").unwrap_or_default(),
                name: node.get::<String>("name").unwrap_or_default(),
                subtype: node.get::<String>("subtype").unwrap_or_default(),
                domain: node.get::<String>("domain").unwrap_or_default(),
                description: node.get::<String>("description").unwrap_or_default(),
                timestamp: node.get::<f64>("timestamp").unwrap_or_default(),
                flow_id: node.get::<String>("flow_id").unwrap_or_default(),
                flow_step: node.get::<i64>("flow_step").unwrap_or_default(),
                vector_id: node.get::<String>("vector_id").ok().filter(|v| !v.is_empty()),
            });
        }
        Ok(events)
    }

    async fn consolidate_events(
        &self,
        event_uids: &[String],
        macro_uid: &str,
    ) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "MATCH (m:MacroEvent {uid: $macro_uid}) \
                     MATCH (e:Event) WHERE e.uid IN $event_uids \
                     MERGE (e)-[:CONSOLIDATED_INTO]->(m)",
                )
                .param("macro_uid", macro_uid)
                .param("event_uids", event_uids.to_vec()),
            )
            .await
            .map_err(store_err)
    }

    async fn create_state(&self, state: &State) -> Result<(), MemoryError> {
        self.graph
            .run(
                query(
                    "CREATE (s:State {id: $id, type: $type, desc: $desc, status: $status, \
                     created: $created, updated: $updated, visit_count: $visit_count, \
                     last_visited: $last_visited})",
                )
                .param("id", state.id.as_str())
                .param("type", state.kind.as_str())
                .param("desc", state.desc.as_str())
                .param("status", state.status.as_str())
                .param("created", state.created)
                .param("updated", state.updated)
                .param("visit_count", state.visit_count as i64)
                .param("last_visited", state.last_visited),
            )
            .await
            .map_err(store_err)
    }

    async fn find_similar_state(
        &self,
        kind: StateKind,
        desc: &str,
    ) -> Result<Option<State>, MemoryError> {
        let needle: String = desc.to_lowercase().chars().take(30).collect();
        let mut result = self
            .graph
            .execute(
                query(
                    "MATCH (s:State {type: $type}) \
                     WHERE toLower(s.desc) CONTAINS $desc_part \
                        OR $desc_part CONTAINS toLower(s.desc) \
                     RETURN s LIMIT 1",
                )
                .param("type", kind.as_str())
                .param("desc_part", needle),
            )
            .await
            .map_err(store_err)?;

        match result.next().await {
            Ok(Some(row)) => Ok(row
                .get::<neo4rs::Node>("s")
                .ok()
                .and_then(|node| Self::state_from_node(&node))),
            _ => Ok(None),
        }
    }

    async fn update_state_status(
        &self,
        state_id: &str,
        status: StateStatus,
    ) -> Result<bool, MemoryError> {
        // Leaving `active` resets the fatigue counters.
        let mut result = self
            .graph
            .execute(
                query(
                    "MATCH (s:State {id: $id}) \
                     SET s.status = $status, s.updated = $updated, \
                         s.visit_count = CASE WHEN $status = 'active' \
                             THEN s.visit_count ELSE 0 END, \
                         s.last_visited = CASE WHEN $status = 'active' \
                             THEN s.last_visited ELSE 0.0 END \
                     RETURN s.id AS id",
                )
                .param("id", state_id)
                .param("status", status.as_str())
                .param("updated", unix_time()),
            )
            .await
            .map_err(store_err)?;

        Ok(matches!(result.next().await, Ok(Some(_))))
    }

    async fn active_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError> {
        self.states_where(kind, "active", "created", limit).await
    }

    async fn completed_states(
        &self,
        kind: StateKind,
        limit: usize,
    ) -> Result<Vec<State>, MemoryError> {
        self.states_where(kind, "completed", "updated", limit).await
    }

    async fn increment_state_visits(&self, state_ids: &[String]) -> Result<usize, MemoryError> {
        if state_ids.is_empty() {
            return Ok(0);
        }
        let mut result = self
            .graph
            .execute(
                query(
                    "UNWIND $state_ids AS state_id \
                     MATCH (s:State {id: state_id}) \
                     SET s.visit_count = coalesce(s.visit_count, 0) + 1, \
                         s.last_visited = $timestamp \
                     RETURN count(s) AS updated",
                )
                .param("state_ids", state_ids.to_vec())
                .param("timestamp", unix_time()),
            )
            .await
            .map_err(store_err)?;

        match result.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>("updated").unwrap_or_default().max(0) as usize),
            _ => Ok(0),
        }
    }

    async fn close(&self) {
        // The connection pool drains when the driver drops.
        info!("neo4j driver closed");
    }
}
