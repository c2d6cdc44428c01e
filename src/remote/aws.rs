//! remote::aws
//!
//! S3 object store and DynamoDB lock table (requires the `aws` feature).
//!
//! Credentials come from the SDK's default provider chain. Service error
//! codes are mapped onto [`StoreError`] so the retry policy can tell
//! throttling from permission problems.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType,
    ScalarAttributeType, TableStatus,
};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration, Delete,
    ObjectIdentifier, ServerSideEncryption, ServerSideEncryptionByDefault,
    ServerSideEncryptionConfiguration, ServerSideEncryptionRule, VersioningConfiguration,
};
use tracing::debug;

use super::traits::{
    CreateOutcome, DeleteOutcome, LockRecord, LockTable, ObjectStore, ObjectVersion, PutOutcome,
    StoreError, LOCK_TABLE_KEY,
};
use crate::core::types::{BucketName, HolderId, StateId, TableName, UtcTimestamp};

const HOLDER_ATTR: &str = "Holder";
const ACQUIRED_AT_ATTR: &str = "AcquiredAt";

/// Region whose buckets must be created without a location constraint.
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Polls while waiting for a new table to become active.
const TABLE_ACTIVE_POLLS: u32 = 60;
const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// S3 and DynamoDB clients for one region.
#[derive(Debug, Clone)]
pub struct AwsBackend {
    s3: aws_sdk_s3::Client,
    dynamodb: aws_sdk_dynamodb::Client,
    region: String,
}

impl AwsBackend {
    /// Load the default credential chain and build clients for `region`.
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            s3: aws_sdk_s3::Client::new(&config),
            dynamodb: aws_sdk_dynamodb::Client::new(&config),
            region: region.to_string(),
        }
    }

    /// Region the clients talk to.
    pub fn region(&self) -> &str {
        &self.region
    }

    async fn wait_for_active(&self, table: &TableName) -> Result<(), StoreError> {
        for _ in 0..TABLE_ACTIVE_POLLS {
            if self.table_status(table).await? == Some(TableStatus::Active) {
                return Ok(());
            }
            debug!(table = %table, "waiting for lock table to become active");
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }
        Err(StoreError::NotReady(format!(
            "table {} is not active after {}s",
            table,
            TABLE_ACTIVE_POLLS as u64 * TABLE_POLL_INTERVAL.as_secs()
        )))
    }

    async fn table_status(&self, table: &TableName) -> Result<Option<TableStatus>, StoreError> {
        match self
            .dynamodb
            .describe_table()
            .table_name(table.as_str())
            .send()
            .await
        {
            Ok(output) => Ok(output
                .table()
                .and_then(|t| t.table_status())
                .cloned()),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(err) => Err(classify(err, "describe table")),
        }
    }
}

/// Map an SDK error onto a store error by service error code.
fn classify<E, R>(err: SdkError<E, R>, action: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let message = format!("{}: {}", action, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            return StoreError::Network(message)
        }
        _ => {}
    }
    match err.code() {
        Some(
            "ThrottlingException"
            | "Throttling"
            | "ProvisionedThroughputExceededException"
            | "RequestLimitExceeded"
            | "SlowDown"
            | "InternalError"
            | "ServiceUnavailable",
        ) => StoreError::Throttled(message),
        Some(
            "AccessDenied"
            | "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidAccessKeyId"
            | "ExpiredToken",
        ) => StoreError::AccessDenied(message),
        Some("NoSuchBucket" | "ResourceNotFoundException") => StoreError::NotFound(message),
        Some("ResourceInUseException" | "BucketNotEmpty" | "OperationAborted") => {
            StoreError::Conflict(message)
        }
        _ => StoreError::Service(message),
    }
}

fn build_error(err: impl std::fmt::Display) -> StoreError {
    StoreError::Service(format!("invalid request: {}", err))
}

fn string_attr(item: &HashMap<String, AttributeValue>, name: &str) -> Result<String, StoreError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StoreError::Corrupt(format!("lock item is missing '{}'", name)))
}

fn record_from_item(item: &HashMap<String, AttributeValue>) -> Result<LockRecord, StoreError> {
    let state_id = StateId::new(string_attr(item, LOCK_TABLE_KEY)?)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let holder = HolderId::new(string_attr(item, HOLDER_ATTR)?)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let acquired_at = string_attr(item, ACQUIRED_AT_ATTR)?;
    let acquired_at = UtcTimestamp::parse(&acquired_at)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp '{}'", acquired_at)))?;
    Ok(LockRecord {
        state_id,
        holder,
        acquired_at,
    })
}

#[async_trait]
impl ObjectStore for AwsBackend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn bucket_exists(&self, bucket: &BucketName) -> Result<bool, StoreError> {
        match self.s3.head_bucket().bucket(bucket.as_str()).send().await {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => {
                let forbidden = err
                    .raw_response()
                    .map(|r| r.status().as_u16() == 403)
                    .unwrap_or(false);
                if forbidden {
                    Err(StoreError::AccessDenied(format!(
                        "bucket {} exists but is not accessible",
                        bucket
                    )))
                } else {
                    Err(classify(err, "head bucket"))
                }
            }
        }
    }

    async fn create_bucket(
        &self,
        bucket: &BucketName,
        region: &str,
    ) -> Result<CreateOutcome, StoreError> {
        let mut request = self.s3.create_bucket().bucket(bucket.as_str());
        if region != DEFAULT_S3_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(err) => match err.as_service_error() {
                Some(e) if e.is_bucket_already_owned_by_you() => Ok(CreateOutcome::AlreadyExists),
                Some(e) if e.is_bucket_already_exists() => Err(StoreError::Conflict(format!(
                    "bucket {} already exists and is owned by another account",
                    bucket
                ))),
                _ => Err(classify(err, "create bucket")),
            },
        }
    }

    async fn enable_versioning(&self, bucket: &BucketName) -> Result<(), StoreError> {
        self.s3
            .put_bucket_versioning()
            .bucket(bucket.as_str())
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(e, "enable versioning"))?;
        Ok(())
    }

    async fn enable_encryption(&self, bucket: &BucketName) -> Result<(), StoreError> {
        let default = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::Aes256)
            .build()
            .map_err(build_error)?;
        let config = ServerSideEncryptionConfiguration::builder()
            .rules(
                ServerSideEncryptionRule::builder()
                    .apply_server_side_encryption_by_default(default)
                    .build(),
            )
            .build()
            .map_err(build_error)?;

        self.s3
            .put_bucket_encryption()
            .bucket(bucket.as_str())
            .server_side_encryption_configuration(config)
            .send()
            .await
            .map_err(|e| classify(e, "enable encryption"))?;
        Ok(())
    }

    async fn list_object_versions(
        &self,
        bucket: &BucketName,
    ) -> Result<Vec<ObjectVersion>, StoreError> {
        let mut versions = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let output = self
                .s3
                .list_object_versions()
                .bucket(bucket.as_str())
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| classify(e, "list object versions"))?;

            for v in output.versions() {
                if let Some(key) = v.key() {
                    versions.push(ObjectVersion {
                        key: key.to_string(),
                        version_id: v.version_id().map(str::to_string),
                    });
                }
            }
            for marker in output.delete_markers() {
                if let Some(key) = marker.key() {
                    versions.push(ObjectVersion {
                        key: key.to_string(),
                        version_id: marker.version_id().map(str::to_string),
                    });
                }
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            version_marker = output.next_version_id_marker().map(str::to_string);
        }

        Ok(versions)
    }

    async fn delete_objects(
        &self,
        bucket: &BucketName,
        versions: &[ObjectVersion],
    ) -> Result<(), StoreError> {
        // DeleteObjects accepts at most 1000 keys per request.
        for chunk in versions.chunks(1000) {
            let objects = chunk
                .iter()
                .map(|v| {
                    ObjectIdentifier::builder()
                        .key(&v.key)
                        .set_version_id(v.version_id.clone())
                        .build()
                        .map_err(build_error)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(build_error)?;

            self.s3
                .delete_objects()
                .bucket(bucket.as_str())
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(e, "delete objects"))?;
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketName) -> Result<(), StoreError> {
        self.s3
            .delete_bucket()
            .bucket(bucket.as_str())
            .send()
            .await
            .map_err(|e| classify(e, "delete bucket"))?;
        Ok(())
    }
}

#[async_trait]
impl LockTable for AwsBackend {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        match self.table_status(table).await? {
            None => Ok(false),
            Some(TableStatus::Active) => Ok(true),
            Some(_) => {
                self.wait_for_active(table).await?;
                Ok(true)
            }
        }
    }

    async fn create_table(&self, table: &TableName) -> Result<CreateOutcome, StoreError> {
        let attribute = AttributeDefinition::builder()
            .attribute_name(LOCK_TABLE_KEY)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(build_error)?;
        let key = KeySchemaElement::builder()
            .attribute_name(LOCK_TABLE_KEY)
            .key_type(KeyType::Hash)
            .build()
            .map_err(build_error)?;

        let outcome = match self
            .dynamodb
            .create_table()
            .table_name(table.as_str())
            .attribute_definitions(attribute)
            .key_schema(key)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
        {
            Ok(_) => CreateOutcome::Created,
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_resource_in_use_exception())
                    .unwrap_or(false) =>
            {
                CreateOutcome::AlreadyExists
            }
            Err(err) => return Err(classify(err, "create table")),
        };

        self.wait_for_active(table).await?;
        Ok(outcome)
    }

    async fn put_if_absent(
        &self,
        table: &TableName,
        record: &LockRecord,
    ) -> Result<PutOutcome, StoreError> {
        let result = self
            .dynamodb
            .put_item()
            .table_name(table.as_str())
            .item(LOCK_TABLE_KEY, AttributeValue::S(record.state_id.to_string()))
            .item(HOLDER_ATTR, AttributeValue::S(record.holder.to_string()))
            .item(ACQUIRED_AT_ATTR, AttributeValue::S(record.acquired_at.to_string()))
            .condition_expression("attribute_not_exists(#key)")
            .expression_attribute_names("#key", LOCK_TABLE_KEY)
            .send()
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Written),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Ok(PutOutcome::AlreadyHeld(self.get(table, &record.state_id).await?))
            }
            Err(err) => Err(classify(err, "put lock item")),
        }
    }

    async fn get(
        &self,
        table: &TableName,
        state_id: &StateId,
    ) -> Result<Option<LockRecord>, StoreError> {
        let output = self
            .dynamodb
            .get_item()
            .table_name(table.as_str())
            .key(LOCK_TABLE_KEY, AttributeValue::S(state_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify(e, "get lock item"))?;

        output.item().map(record_from_item).transpose()
    }

    async fn delete_if_holder(
        &self,
        table: &TableName,
        state_id: &StateId,
        holder: &HolderId,
    ) -> Result<DeleteOutcome, StoreError> {
        let result = self
            .dynamodb
            .delete_item()
            .table_name(table.as_str())
            .key(LOCK_TABLE_KEY, AttributeValue::S(state_id.to_string()))
            .condition_expression("attribute_exists(#key) AND #holder = :holder")
            .expression_attribute_names("#key", LOCK_TABLE_KEY)
            .expression_attribute_names("#holder", HOLDER_ATTR)
            .expression_attribute_values(":holder", AttributeValue::S(holder.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                match self.get(table, state_id).await? {
                    None => Ok(DeleteOutcome::Missing),
                    Some(existing) => Ok(DeleteOutcome::HeldByOther(existing.holder)),
                }
            }
            Err(err) => Err(classify(err, "delete lock item")),
        }
    }

    async fn delete_table(&self, table: &TableName) -> Result<(), StoreError> {
        self.dynamodb
            .delete_table()
            .table_name(table.as_str())
            .send()
            .await
            .map_err(|e| classify(e, "delete table"))?;
        Ok(())
    }
}


#[cfg(all(test, feature = "live_aws_tests"))]
mod live_tests {
    //! Run with `cargo test --features live_aws_tests` and AWS credentials.

    use super::*;

    #[tokio::test]
    async fn lock_table_round_trip() {
        let backend = AwsBackend::connect("us-west-2").await;
        let table = TableName::new(format!("stackguard_test_{}", uuid::Uuid::new_v4().simple()))
            .unwrap();
        backend.create_table(&table).await.unwrap();

        let record = LockRecord::new(StateId::new("live").unwrap(), HolderId::current());
        assert_eq!(
            backend.put_if_absent(&table, &record).await.unwrap(),
            PutOutcome::Written
        );
        assert!(matches!(
            backend.put_if_absent(&table, &record).await.unwrap(),
            PutOutcome::AlreadyHeld(_)
        ));
        assert_eq!(
            backend
                .delete_if_holder(&table, &record.state_id, &record.holder)
                .await
                .unwrap(),
            DeleteOutcome::Deleted
        );

        backend.delete_table(&table).await.unwrap();
    }
}
