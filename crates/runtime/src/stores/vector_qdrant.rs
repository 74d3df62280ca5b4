//! Qdrant adapter for the vector-index port.
//!
//! One collection, cosine distance, payloads kept on disk. Point ids are the
//! node uids, so re-ingesting the same entity upserts the same point.

use async_trait::async_trait;
use qdrant_client::config::QdrantConfig as ClientConfig;
use qdrant_client::qdrant::{
    condition::ConditionOneOf, r#match::MatchValue, value::Kind, vectors_config,
    with_payload_selector::SelectorOptions, Condition, CreateCollection, Distance, FieldCondition,
    Filter, Match, PointStruct, SearchPoints, UpsertPoints, Value as QdrantValue, VectorParams,
    VectorsConfig, WithPayloadSelector,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{VectorHit, VectorIndex, VectorPayload};
use crate::types::MemoryError;

fn store_err(e: qdrant_client::QdrantError) -> MemoryError {
    MemoryError::Store {
        reason: format!("qdrant: {e}"),
    }
}

pub struct QdrantVectorIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
}

impl QdrantVectorIndex {
    pub fn connect(url: &str, collection: &str, dimension: usize) -> Result<Self, MemoryError> {
        let client = Qdrant::new(ClientConfig::from_url(url)).map_err(store_err)?;
        info!(url, collection, dimension, "qdrant client configured");
        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
        })
    }

    fn payload_map(payload: &VectorPayload) -> HashMap<String, QdrantValue> {
        HashMap::from([
            ("domain".to_string(), QdrantValue::from(payload.domain.clone())),
            ("node_id".to_string(), QdrantValue::from(payload.node_id.clone())),
            ("subtype".to_string(), QdrantValue::from(payload.subtype.clone())),
            ("name".to_string(), QdrantValue::from(payload.name.clone())),
            ("type".to_string(), QdrantValue::from(payload.node_type.clone())),
        ])
    }

    fn string_value(value: &QdrantValue) -> String {
        match &value.kind {
            Some(Kind::StringValue(s)) => s.clone(),
            _ => String::new(),
        }
    }

    fn keyword_condition(key: &str, value: &str) -> Condition {
        Condition {
            condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                key: key.to_string(),
                r#match: Some(Match {
                    match_value: Some(MatchValue::Keyword(value.to_string())),
                }),
                range: None,
                geo_bounding_box: None,
                geo_radius: None,
                values_count: None,
                geo_polygon: None,
                datetime_range: None,
                is_empty: None,
                is_null: None,
            })),
        }
    }

    /// Filter admitting the requested domain OR the `"general"` domain.
    fn domain_filter(domain: &str) -> Filter {
        Filter {
            should: vec![
                Self::keyword_condition("domain", domain),
                Self::keyword_condition("domain", "general"),
            ],
            min_should: None,
            must: vec![],
            must_not: vec![],
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn ensure_collection(&self) -> Result<(), MemoryError> {
        let collections = self.client.list_collections().await.map_err(store_err)?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);
        if exists {
            return Ok(());
        }

        let vectors_config = VectorsConfig {
            config: Some(vectors_config::Config::Params(VectorParams {
                size: self.dimension as u64,
                distance: Distance::Cosine as i32,
                hnsw_config: None,
                quantization_config: None,
                on_disk: None,
                datatype: None,
                multivector_config: None,
            })),
        };

        let create = CreateCollection {
            collection_name: self.collection.clone(),
            vectors_config: Some(vectors_config),
            on_disk_payload: Some(true),
            hnsw_config: None,
            wal_config: None,
            optimizers_config: None,
            shard_number: None,
            timeout: None,
            replication_factor: None,
            write_consistency_factor: None,
            init_from_collection: None,
            quantization_config: None,
            sharding_method: None,
            sparse_vectors_config: None,
            strict_mode_config: None,
        };

        self.client.create_collection(create).await.map_err(store_err)?;
        info!(collection = %self.collection, dimension = self.dimension, "created qdrant collection");
        Ok(())
    }

    async fn upsert(
        &self,
        point_id: &str,
        vector: &[f32],
        payload: &VectorPayload,
    ) -> Result<(), MemoryError> {
        let point = PointStruct::new(
            point_id.to_string(),
            vector.to_vec(),
            Self::payload_map(payload),
        );
        let upsert = UpsertPoints {
            collection_name: self.collection.clone(),
            wait: Some(true),
            points: vec![point],
            ordering: None,
            shard_key_selector: None,
        };
        self.client.upsert_points(upsert).await.map_err(store_err)?;
        debug!(point_id, "upserted vector point");
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        domain_filter: Option<&str>,
        score_floor: Option<f32>,
    ) -> Result<Vec<VectorHit>, MemoryError> {
        let search = SearchPoints {
            collection_name: self.collection.clone(),
            vector: vector.to_vec(),
            vector_name: None,
            filter: domain_filter.map(Self::domain_filter),
            limit: limit as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            params: None,
            score_threshold: score_floor,
            offset: None,
            with_vectors: None,
            read_consistency: None,
            shard_key_selector: None,
            sparse_indices: None,
            timeout: None,
        };

        let response = self.client.search_points(search).await.map_err(store_err)?;

        let hits = response
            .result
            .into_iter()
            .map(|point| {
                let payload = VectorPayload {
                    domain: point
                        .payload
                        .get("domain")
                        .map(Self::string_value)
                        .unwrap_or_default(),
                    node_id: point
                        .payload
                        .get("node_id")
                        .map(Self::string_value)
                        .unwrap_or_default(),
                    subtype: point
                        .payload
                        .get("subtype")
                        .map(Self::string_value)
                        .unwrap_or_default(),
                    name: point
                        .payload
                        .get("name")
                        .map(Self::string_value)
                        .unwrap_or_default(),
                    node_type: point
                        .payload
                        .get("type")
                        .map(Self::string_value)
                        .unwrap_or_default(),
                };
                VectorHit {
                    point_id: payload.node_id.clone(),
                    score: point.score,
                    payload,
                }
            })
            .collect();

        Ok(hits)
    }

    async fn shutdown(&self) {
        // The gRPC channel closes on drop; nothing to flush.
        info!("qdrant client shutdown");
    }
}
