//! Request side of the storefront acquisition exchange

use crate::error::AcquisitionError;
use serde::Serialize;

pub const PLIST_CONTENT_TYPE: &str = "application/x-apple-plist";
pub const DSID_HEADER: &str = "iCloud-DSID";
pub const DSID_HEADER_ALT: &str = "X-Dsid";

/// What to acquire: a storefront item and optionally a historical build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub item_id: String,
    pub external_version_id: Option<String>,
}

impl AcquisitionRequest {
    pub fn new(
        item_id: impl Into<String>,
        external_version_id: Option<String>,
    ) -> Result<Self, AcquisitionError> {
        let item_id = item_id.into().trim().to_string();
        if item_id.is_empty() {
            return Err(AcquisitionError::InvalidRequest(
                "bundle/item identifier must not be empty".to_string(),
            ));
        }
        Ok(Self {
            item_id,
            external_version_id: external_version_id
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcquisitionPayload<'a> {
    credit_display: &'a str,
    guid: &'a str,
    salable_adam_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_version_id: Option<&'a str>,
}

/// Serialize the request body as an XML property list
pub fn encode_payload(
    request: &AcquisitionRequest,
    device_identifier: &str,
) -> Result<Vec<u8>, AcquisitionError> {
    let payload = AcquisitionPayload {
        credit_display: "",
        guid: device_identifier,
        salable_adam_id: &request.item_id,
        external_version_id: request.external_version_id.as_deref(),
    };

    let mut body = Vec::new();
    plist::to_writer_xml(&mut body, &payload)
        .map_err(|e| AcquisitionError::InvalidRequest(e.to_string()))?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(body: &[u8]) -> plist::Dictionary {
        plist::Value::from_reader(std::io::Cursor::new(body))
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    #[test]
    fn test_payload_keys() {
        let request = AcquisitionRequest::new("com.example.app", Some("8123".to_string())).unwrap();
        let dict = decode(&encode_payload(&request, "AABBCCDDEEFF").unwrap());

        assert_eq!(dict.get("creditDisplay").unwrap().as_string(), Some(""));
        assert_eq!(dict.get("guid").unwrap().as_string(), Some("AABBCCDDEEFF"));
        assert_eq!(
            dict.get("salableAdamId").unwrap().as_string(),
            Some("com.example.app")
        );
        assert_eq!(dict.get("externalVersionId").unwrap().as_string(), Some("8123"));
    }

    #[test]
    fn test_version_omitted_when_absent() {
        let request = AcquisitionRequest::new("com.example.app", Some("  ".to_string())).unwrap();
        assert_eq!(request.external_version_id, None);

        let dict = decode(&encode_payload(&request, "AABBCCDDEEFF").unwrap());
        assert!(dict.get("externalVersionId").is_none());
    }

    #[test]
    fn test_empty_item_rejected() {
        assert!(matches!(
            AcquisitionRequest::new(" ", None),
            Err(AcquisitionError::InvalidRequest(_))
        ));
    }
}
