use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;
use leasehold_lease_store::{LeaseRecord, OwnerToken};

use crate::Error;

/// Partition key of the certificate table. Lease items live beside the
/// certificate items under their derived lock keys.
pub const DOMAIN_ATTRIBUTE: &str = "Domain";
/// The protected resource.
pub const RESOURCE_KEY_ATTRIBUTE: &str = "ResourceKey";
/// The fencing token of the current owner.
pub const OWNER_TOKEN_ATTRIBUTE: &str = "OwnerToken";
/// Lease expiry in milliseconds since the UNIX epoch.
pub const EXPIRES_AT_ATTRIBUTE: &str = "ExpiresAt";

pub fn record_to_item(key: &str, record: &LeaseRecord) -> HashMap<String, AttributeValue> {
    HashMap::from([
        (
            DOMAIN_ATTRIBUTE.to_string(),
            AttributeValue::S(key.to_string()),
        ),
        (
            RESOURCE_KEY_ATTRIBUTE.to_string(),
            AttributeValue::S(record.resource_key().to_string()),
        ),
        (
            OWNER_TOKEN_ATTRIBUTE.to_string(),
            AttributeValue::S(record.owner_token().to_string()),
        ),
        (
            EXPIRES_AT_ATTRIBUTE.to_string(),
            AttributeValue::N(record.expires_at_ms().to_string()),
        ),
    ])
}

pub fn item_to_record(item: &HashMap<String, AttributeValue>) -> Result<LeaseRecord, Error> {
    let resource_key = item
        .get(RESOURCE_KEY_ATTRIBUTE)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| Error::MalformedItem(format!("missing {RESOURCE_KEY_ATTRIBUTE}")))?;

    let owner_token = item
        .get(OWNER_TOKEN_ATTRIBUTE)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| Error::MalformedItem(format!("missing {OWNER_TOKEN_ATTRIBUTE}")))?
        .parse::<OwnerToken>()
        .map_err(|e| Error::MalformedItem(format!("invalid {OWNER_TOKEN_ATTRIBUTE}: {e}")))?;

    let expires_at_ms = item
        .get(EXPIRES_AT_ATTRIBUTE)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| {
            Error::MalformedItem(format!("missing or invalid {EXPIRES_AT_ATTRIBUTE}"))
        })?;

    Ok(LeaseRecord::from_parts(
        resource_key.clone(),
        owner_token,
        expires_at_ms,
    ))
}

/// Service error codes worth retrying.
pub fn is_retriable_code(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(
            "ThrottlingException"
                | "ProvisionedThroughputExceededException"
                | "RequestLimitExceeded"
                | "InternalServerError"
                | "ServiceUnavailable"
                | "TransactionConflictException"
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_item_layout() {
        let owner = OwnerToken::mint();
        let record = LeaseRecord::from_parts("example.com", owner, 1_700_000_000_123);
        let item = record_to_item("locks/example.com.lock", &record);

        assert_eq!(
            item.get(DOMAIN_ATTRIBUTE),
            Some(&AttributeValue::S("locks/example.com.lock".to_string()))
        );
        assert_eq!(
            item.get(OWNER_TOKEN_ATTRIBUTE),
            Some(&AttributeValue::S(owner.to_string()))
        );
        assert_eq!(
            item.get(EXPIRES_AT_ATTRIBUTE),
            Some(&AttributeValue::N("1700000000123".to_string()))
        );
        assert_eq!(item_to_record(&item).unwrap(), record);
    }

    #[test]
    fn test_missing_owner_is_malformed() {
        let record = LeaseRecord::from_parts("example.com", OwnerToken::mint(), 1);
        let mut item = record_to_item("locks/example.com.lock", &record);
        item.remove(OWNER_TOKEN_ATTRIBUTE);

        assert_matches!(item_to_record(&item), Err(Error::MalformedItem(_)));
    }

    #[test]
    fn test_bad_values_are_malformed() {
        let record = LeaseRecord::from_parts("example.com", OwnerToken::mint(), 1);

        let mut item = record_to_item("locks/example.com.lock", &record);
        item.insert(
            OWNER_TOKEN_ATTRIBUTE.to_string(),
            AttributeValue::S("someone".to_string()),
        );
        assert_matches!(item_to_record(&item), Err(Error::MalformedItem(_)));

        let mut item = record_to_item("locks/example.com.lock", &record);
        item.insert(
            EXPIRES_AT_ATTRIBUTE.to_string(),
            AttributeValue::S("tomorrow".to_string()),
        );
        assert_matches!(item_to_record(&item), Err(Error::MalformedItem(_)));
    }

    #[test]
    fn test_retriable_codes() {
        assert!(is_retriable_code(Some("ThrottlingException")));
        assert!(is_retriable_code(Some("ProvisionedThroughputExceededException")));
        assert!(!is_retriable_code(Some("ConditionalCheckFailedException")));
        assert!(!is_retriable_code(Some("ResourceNotFoundException")));
        assert!(!is_retriable_code(None));
    }
}
