use super::{RecordBatch, StartPosition, StreamSource};
use crate::error::StreamError;
use async_trait::async_trait;
use aws_sdk_dynamodbstreams::config::Credentials;
use aws_sdk_dynamodbstreams::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodbstreams::types::{AttributeValue, Record, ShardIteratorType, Stream, StreamRecord};
use aws_sdk_dynamodbstreams::Client;
use aws_types::region::Region;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// DynamoDB Streams as served by DynamoDB Local.
pub struct DynamoDbStreamSource {
    client: Client,
}

impl DynamoDbStreamSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a client for a local endpoint, e.g. http://localhost:8000.
    /// DynamoDB Local accepts any credentials, so static dummy ones are used
    /// to avoid depending on the developer's AWS profile.
    pub async fn connect(endpoint: &str, region: &str) -> Self {
        let config = aws_config::from_env()
            .endpoint_url(endpoint)
            .region(Region::new(region.to_owned()))
            .credentials_provider(Credentials::new("local", "local", None, None, "cloudly-dev"))
            .load()
            .await;

        debug!("DynamoDB Streams endpoint: {endpoint}");

        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl StreamSource for DynamoDbStreamSource {
    async fn describe_stream(&self, table: &str) -> Result<String, StreamError> {
        let mut streams = Vec::new();
        let mut start_after: Option<String> = None;

        // a re-created table keeps listing the streams of its previous incarnations
        loop {
            let resp = self
                .client
                .list_streams()
                .table_name(table)
                .set_exclusive_start_stream_arn(start_after.take())
                .send()
                .await
                .map_err(stream_error)?;

            streams.extend(resp.streams.unwrap_or_default());

            match resp.last_evaluated_stream_arn {
                Some(v) => start_after = Some(v),
                None => break,
            }
        }

        latest_stream_arn(streams).ok_or_else(|| StreamError::NotFound(format!("table {table} has no stream")))
    }

    async fn list_shards(&self, stream_id: &str) -> Result<Vec<String>, StreamError> {
        let mut shards = Vec::new();
        let mut start_after: Option<String> = None;

        // the shard list is paginated
        loop {
            let resp = self
                .client
                .describe_stream()
                .stream_arn(stream_id)
                .set_exclusive_start_shard_id(start_after.take())
                .send()
                .await
                .map_err(stream_error)?;

            let Some(description) = resp.stream_description else {
                return Err(StreamError::NotFound(format!("stream {stream_id} has no description")));
            };

            shards.extend(
                description
                    .shards
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|s| s.shard_id),
            );

            match description.last_evaluated_shard_id {
                Some(v) => start_after = Some(v),
                None => break,
            }
        }

        Ok(shards)
    }

    async fn get_iterator(
        &self,
        stream_id: &str,
        shard_id: &str,
        position: StartPosition,
    ) -> Result<String, StreamError> {
        let iterator_type = match position {
            StartPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
        };

        let resp = self
            .client
            .get_shard_iterator()
            .stream_arn(stream_id)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type)
            .send()
            .await
            .map_err(stream_error)?;

        resp.shard_iterator
            .ok_or_else(|| StreamError::NotFound(format!("no iterator for shard {shard_id}")))
    }

    async fn fetch(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamError> {
        let resp = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(stream_error)?;

        Ok(RecordBatch {
            records: resp.records.unwrap_or_default().iter().map(record_to_json).collect(),
            next_token: resp.next_shard_iterator,
        })
    }
}

/// Stream labels are creation timestamps (`2024-05-01T10:00:00.000`), so the greatest label is the newest stream.
fn latest_stream_arn(streams: Vec<Stream>) -> Option<String> {
    streams
        .into_iter()
        .filter(|s| s.stream_arn.is_some())
        .max_by(|a, b| a.stream_label.cmp(&b.stream_label))
        .and_then(|s| s.stream_arn)
}

/// Errors that mean the cursor or stream is no longer valid are reported as NotFound
/// so that the poller starts over with discovery.
fn stream_error<E, R>(err: SdkError<E, R>) -> StreamError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.code() {
        Some("ResourceNotFoundException") | Some("ExpiredIteratorException") | Some("TrimmedDataAccessException") => {
            StreamError::NotFound(message)
        }
        _ => StreamError::Transport(message),
    }
}

/// Converts an SDK record into the JSON shape lambda handlers get from the DynamoDB event source.
pub fn record_to_json(record: &Record) -> Value {
    let mut v = Map::new();

    if let Some(id) = &record.event_id {
        v.insert("eventID".to_owned(), json!(id));
    }
    if let Some(name) = &record.event_name {
        v.insert("eventName".to_owned(), json!(name.as_str()));
    }
    if let Some(version) = &record.event_version {
        v.insert("eventVersion".to_owned(), json!(version));
    }
    if let Some(source) = &record.event_source {
        v.insert("eventSource".to_owned(), json!(source));
    }
    if let Some(region) = &record.aws_region {
        v.insert("awsRegion".to_owned(), json!(region));
    }
    if let Some(dynamodb) = &record.dynamodb {
        v.insert("dynamodb".to_owned(), stream_record_to_json(dynamodb));
    }
    if let Some(identity) = &record.user_identity {
        v.insert(
            "userIdentity".to_owned(),
            json!({"principalId": identity.principal_id, "type": identity.r#type}),
        );
    }

    Value::Object(v)
}

fn stream_record_to_json(record: &StreamRecord) -> Value {
    let mut v = Map::new();

    if let Some(dt) = &record.approximate_creation_date_time {
        v.insert("ApproximateCreationDateTime".to_owned(), json!(dt.secs()));
    }
    if let Some(keys) = &record.keys {
        v.insert("Keys".to_owned(), item_to_json(keys));
    }
    if let Some(image) = &record.new_image {
        v.insert("NewImage".to_owned(), item_to_json(image));
    }
    if let Some(image) = &record.old_image {
        v.insert("OldImage".to_owned(), item_to_json(image));
    }
    if let Some(seq) = &record.sequence_number {
        v.insert("SequenceNumber".to_owned(), json!(seq));
    }
    if let Some(size) = record.size_bytes {
        v.insert("SizeBytes".to_owned(), json!(size));
    }
    if let Some(view) = &record.stream_view_type {
        v.insert("StreamViewType".to_owned(), json!(view.as_str()));
    }

    Value::Object(v)
}

fn item_to_json(item: &HashMap<String, AttributeValue>) -> Value {
    Value::Object(item.iter().map(|(k, v)| (k.clone(), attribute_to_json(v))).collect())
}

/// Typed attribute in DynamoDB JSON, e.g. `{"S": "abc"}` or `{"N": "42"}`.
pub fn attribute_to_json(value: &AttributeValue) -> Value {
    let b64 = |b: &[u8]| base64::engine::general_purpose::STANDARD.encode(b);

    match value {
        AttributeValue::S(s) => json!({ "S": s }),
        AttributeValue::N(n) => json!({ "N": n }),
        AttributeValue::B(b) => json!({ "B": b64(b.as_ref()) }),
        AttributeValue::Bool(b) => json!({ "BOOL": b }),
        AttributeValue::Null(b) => json!({ "NULL": b }),
        AttributeValue::Ss(v) => json!({ "SS": v }),
        AttributeValue::Ns(v) => json!({ "NS": v }),
        AttributeValue::Bs(v) => json!({ "BS": v.iter().map(|b| b64(b.as_ref())).collect::<Vec<_>>() }),
        AttributeValue::L(v) => json!({ "L": v.iter().map(attribute_to_json).collect::<Vec<_>>() }),
        AttributeValue::M(m) => json!({ "M": item_to_json(m) }),
        _ => Value::Null,
    }
}
