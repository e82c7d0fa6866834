use super::listen::{listen_request, ListenStream};
use super::models::{
    Aggregation, CollectionSelector, CountAggregation, Direction, FieldReference, ListenRequest,
    Order, QueryTarget, RunAggregationQueryRequest, RunAggregationQueryResponse, RunQueryRequest,
    RunQueryResponse, StructuredAggregationQuery, StructuredQuery, Target,
};
use super::reference::{convert_value_to_serde_value, database_path, resource_root};
use super::snapshot::{DocumentSnapshot, QuerySnapshot};
use super::DocumentError;
use crate::core::parse_error_response;
use reqwest::header;
use reqwest_middleware::ClientWithMiddleware;

const COUNT_ALIAS: &str = "count";
const LISTEN_TARGET_ID: i32 = 1;

/// A definition of a Firestore query over one collection.
///
/// This struct allows you to build a query independently of a specific
/// backend, so the same definition drives one-shot reads and subscriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub(crate) collection_id: String,
    pub(crate) query: StructuredQuery,
}

impl Query {
    /// Creates a new `Query` targeting the specified collection.
    pub fn new(collection_id: impl Into<String>) -> Self {
        let collection_id = collection_id.into();
        Self {
            collection_id: collection_id.clone(),
            query: StructuredQuery {
                from: Some(vec![CollectionSelector {
                    collection_id,
                    all_descendants: None,
                }]),
                order_by: None,
                limit: None,
            },
        }
    }

    /// Sorts the query results by the specified field.
    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        let order = Order {
            field: FieldReference {
                field_path: field.to_string(),
            },
            direction,
        };

        if let Some(order_by) = &mut self.query.order_by {
            order_by.push(order);
        } else {
            self.query.order_by = Some(vec![order]);
        }

        self
    }

    /// Limits the number of documents returned.
    pub fn limit(mut self, limit: i32) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn orders(&self) -> &[Order] {
        self.query.order_by.as_deref().unwrap_or_default()
    }

    pub fn max_results(&self) -> Option<usize> {
        self.query.limit.and_then(|limit| usize::try_from(limit).ok())
    }
}

/// A `Query` attached to a Firestore client, ready for execution.
#[derive(Clone)]
pub struct ExecutableQuery<'a> {
    pub(crate) client: &'a ClientWithMiddleware,
    pub(crate) base_url: &'a str,
    pub(crate) query: Query,
}

impl<'a> ExecutableQuery<'a> {
    pub(crate) fn new(client: &'a ClientWithMiddleware, base_url: &'a str, query: Query) -> Self {
        Self {
            client,
            base_url,
            query,
        }
    }

    /// Executes the query and returns the results as a `QuerySnapshot`.
    pub async fn get(&self) -> Result<QuerySnapshot, DocumentError> {
        let url = format!("{}:runQuery", self.base_url);

        let request = RunQueryRequest {
            structured_query: self.query.query.clone(),
        };

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DocumentError::from_failure(
                parse_error_response(response, "Run query failed").await,
            ));
        }

        let responses: Vec<RunQueryResponse> = response.json().await?;

        let mut documents = Vec::new();
        let mut read_time = None;

        for res in responses {
            if let Some(rt) = res.read_time {
                read_time = Some(rt);
            }

            if let Some(doc) = res.document {
                documents.push(DocumentSnapshot::from_document(doc)?);
            }
        }

        Ok(QuerySnapshot {
            documents,
            read_time,
        })
    }

    /// Counts the documents matching the query on the server.
    pub async fn count(&self) -> Result<u64, DocumentError> {
        let url = format!("{}:runAggregationQuery", self.base_url);

        let request = RunAggregationQueryRequest {
            structured_aggregation_query: StructuredAggregationQuery {
                structured_query: self.query.query.clone(),
                aggregations: vec![Aggregation {
                    alias: COUNT_ALIAS.to_string(),
                    count: CountAggregation::default(),
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(&request)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DocumentError::from_failure(
                parse_error_response(response, "Count query failed").await,
            ));
        }

        let responses: Vec<RunAggregationQueryResponse> = response.json().await?;
        let value = responses
            .into_iter()
            .filter_map(|res| res.result)
            .find_map(|mut result| result.aggregate_fields.remove(COUNT_ALIAS))
            .ok_or_else(|| DocumentError::ApiError("Count query returned no result".into()))?;

        Ok(serde_json::from_value(convert_value_to_serde_value(value)?)?)
    }

    /// Opens a listen stream for the query's target, resuming from
    /// `resume_token` when one was handed out by an earlier stream.
    pub async fn listen(&self, resume_token: Option<String>) -> Result<ListenStream, DocumentError> {
        let request = ListenRequest {
            database: database_path(self.base_url).to_string(),
            add_target: Target {
                query: QueryTarget {
                    parent: resource_root(self.base_url).to_string(),
                    structured_query: self.query.query.clone(),
                },
                target_id: LISTEN_TARGET_ID,
                resume_token,
            },
        };

        listen_request(self.client, self.base_url, &request).await
    }
}
