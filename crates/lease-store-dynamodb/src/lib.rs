//! Implementation of the lease store using DynamoDB conditional expressions.
//! Lease items share the certificate table and its `Domain` partition key.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod item;

pub use error::Error;
pub use item::{
    DOMAIN_ATTRIBUTE, EXPIRES_AT_ATTRIBUTE, OWNER_TOKEN_ATTRIBUTE, RESOURCE_KEY_ATTRIBUTE,
};

use std::time::SystemTime;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::delete_item::DeleteItemError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use leasehold_lease_store::{
    ConditionalOutcome, LeaseRecord, LeaseStore, OwnerToken, PutOutcome, system_time_to_millis,
};
use tracing::{debug, instrument};

use item::{is_retriable_code, item_to_record, record_to_item};

/// Options for configuring a `DynamoDbLeaseStore`.
#[derive(Clone, Debug, Default)]
pub struct DynamoDbLeaseStoreOptions {
    /// The table to use (must be created in advance, keyed by a `Domain`
    /// string partition key).
    pub table: String,

    /// The AWS region to use. Falls back to the environment when `None`.
    pub region: Option<String>,

    /// Custom endpoint, e.g. DynamoDB Local.
    pub endpoint_url: Option<String>,
}

/// Lease store using DynamoDB.
#[derive(Clone, Debug)]
pub struct DynamoDbLeaseStore {
    client: Client,
    table: String,
}

impl DynamoDbLeaseStore {
    /// Creates a new `DynamoDbLeaseStore`, loading AWS configuration from the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no table name is given.
    pub async fn new(
        DynamoDbLeaseStoreOptions {
            table,
            region,
            endpoint_url,
        }: DynamoDbLeaseStoreOptions,
    ) -> Result<Self, Error> {
        Self::validate_table(&table)?;

        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint_url) = endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        let config = loader.load().await;

        Ok(Self {
            client: Client::new(&config),
            table,
        })
    }

    /// Creates a store from an already configured client.
    ///
    /// # Errors
    ///
    /// Returns an error if no table name is given.
    pub fn with_client(client: Client, table: impl Into<String>) -> Result<Self, Error> {
        let table = table.into();
        Self::validate_table(&table)?;

        Ok(Self { client, table })
    }

    fn validate_table(table: &str) -> Result<(), Error> {
        if table.is_empty() {
            return Err(Error::Config("table name is required".to_string()));
        }
        Ok(())
    }

    fn domain_key(key: &str) -> AttributeValue {
        AttributeValue::S(key.to_string())
    }

    fn millis(time: SystemTime) -> AttributeValue {
        AttributeValue::N(system_time_to_millis(time).to_string())
    }
}

fn request_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata,
    aws_sdk_dynamodb::Error: From<SdkError<E, R>>,
{
    let retriable = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service) => is_retriable_code(service.err().code()),
        _ => false,
    };

    Error::Request {
        operation,
        retriable,
        source: Box::new(err.into()),
    }
}

#[async_trait]
impl LeaseStore for DynamoDbLeaseStore {
    type Error = Error;

    #[instrument(skip(self, record), fields(table = %self.table, key = %key))]
    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        record: &LeaseRecord,
        now: SystemTime,
    ) -> Result<PutOutcome, Self::Error> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(record_to_item(key, record)))
            .condition_expression("attribute_not_exists(#domain) OR #expires_at < :now")
            .expression_attribute_names("#domain", DOMAIN_ATTRIBUTE)
            .expression_attribute_names("#expires_at", EXPIRES_AT_ATTRIBUTE)
            .expression_attribute_values(":now", Self::millis(now))
            .return_values(ReturnValue::AllOld)
            .send()
            .await;

        match result {
            Ok(output) => match output.attributes {
                Some(previous) if !previous.is_empty() => {
                    Ok(PutOutcome::ReplacedExpired(item_to_record(&previous)?))
                }
                _ => Ok(PutOutcome::Created),
            },
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(PutItemError::is_conditional_check_failed_exception) =>
            {
                debug!("Lease item exists and has not expired");
                Ok(PutOutcome::ConditionFailed)
            }
            Err(err) => Err(request_error("PutItem", err)),
        }
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn update_if_owner_matches(
        &self,
        key: &str,
        new_expiry: SystemTime,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error> {
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(DOMAIN_ATTRIBUTE, Self::domain_key(key))
            .update_expression("SET #expires_at = :expires_at")
            .condition_expression("#owner = :owner")
            .expression_attribute_names("#expires_at", EXPIRES_AT_ATTRIBUTE)
            .expression_attribute_names("#owner", OWNER_TOKEN_ATTRIBUTE)
            .expression_attribute_values(":expires_at", Self::millis(new_expiry))
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(ConditionalOutcome::Applied),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(UpdateItemError::is_conditional_check_failed_exception) =>
            {
                Ok(ConditionalOutcome::ConditionFailed)
            }
            Err(err) => Err(request_error("UpdateItem", err)),
        }
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn delete_if_owner_matches(
        &self,
        key: &str,
        owner: &OwnerToken,
    ) -> Result<ConditionalOutcome, Self::Error> {
        let result = self
            .client
            .delete_item()
            .table_name(&self.table)
            .key(DOMAIN_ATTRIBUTE, Self::domain_key(key))
            .condition_expression("#owner = :owner")
            .expression_attribute_names("#owner", OWNER_TOKEN_ATTRIBUTE)
            .expression_attribute_values(":owner", AttributeValue::S(owner.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(ConditionalOutcome::Applied),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(DeleteItemError::is_conditional_check_failed_exception) =>
            {
                Ok(ConditionalOutcome::ConditionFailed)
            }
            Err(err) => Err(request_error("DeleteItem", err)),
        }
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(DOMAIN_ATTRIBUTE, Self::domain_key(key))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| request_error("GetItem", err))?;

        output
            .item
            .filter(|item| !item.is_empty())
            .map(|item| item_to_record(&item))
            .transpose()
    }
}
