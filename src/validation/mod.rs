use serde::{Deserialize, Deserializer};
use std::fmt;
use utoipa::ToSchema;

use crate::config::catalog::{find_product, product_codes, Product};
use crate::domain::PurchaseIntent;

pub const EMAIL_MAX_LEN: usize = 254;
pub const PRODUCT_CODE_MAX_LEN: usize = 32;
pub const DELIVERY_STATUS_MAX_LEN: usize = 64;
/// Largest order accepted, in GHS.
pub const MAX_AMOUNT: f64 = 1000.0;

/// Body of `POST /api/initiate-payment`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    #[schema(example = "mtn-1gb")]
    pub product_code: String,
    #[schema(example = "0551234567")]
    pub target_contact: String,
    /// Bundle volume in MB. Numbers are accepted as well as strings.
    #[serde(deserialize_with = "string_or_number")]
    #[schema(example = "1000")]
    pub volume: String,
    /// Amount in GHS.
    #[schema(example = 5.5)]
    pub amount: f64,
    #[schema(example = "a@b.com")]
    pub purchaser_email: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult = Result<(), ValidationError>;

pub fn sanitize_string(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn validate_required(field: &'static str, value: &str) -> ValidationResult {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }

    Ok(())
}

pub fn validate_max_len(field: &'static str, value: &str, max_len: usize) -> ValidationResult {
    if value.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", max_len),
        ));
    }

    Ok(())
}

/// Accepts `0XXXXXXXXX`, `233XXXXXXXXX` or `+233XXXXXXXXX` and returns the 10-digit
/// local form.
pub fn normalize_contact(contact: &str) -> Result<String, ValidationError> {
    let compact: String = contact
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '-')
        .collect();
    validate_required("targetContact", &compact)?;

    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    if !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(ValidationError::new("targetContact", "must contain only digits"));
    }

    let subscriber = if let Some(rest) = digits.strip_prefix("233") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        return Err(ValidationError::new(
            "targetContact",
            "must start with 0 or 233",
        ));
    };

    if subscriber.len() != 9 || subscriber.starts_with('0') {
        return Err(ValidationError::new(
            "targetContact",
            "must be a 10-digit Ghanaian mobile number",
        ));
    }

    Ok(format!("0{}", subscriber))
}

pub fn validate_email(email: &str) -> ValidationResult {
    validate_required("purchaserEmail", email)?;
    validate_max_len("purchaserEmail", email, EMAIL_MAX_LEN)?;

    let invalid = || ValidationError::new("purchaserEmail", "must be a valid email address");
    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(invalid());
    }

    Ok(())
}

pub fn validate_product(code: &str) -> Result<&'static Product, ValidationError> {
    let code = sanitize_string(code);
    validate_required("productCode", &code)?;
    validate_max_len("productCode", &code, PRODUCT_CODE_MAX_LEN)?;

    find_product(&code).ok_or_else(|| {
        ValidationError::new(
            "productCode",
            format!("must be one of: {}", product_codes().join(", ")),
        )
    })
}

/// Converts a GHS amount to pesewas after range checks.
pub fn validate_amount(amount: f64) -> Result<u64, ValidationError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(ValidationError::new("amount", "must be greater than zero"));
    }
    if amount > MAX_AMOUNT {
        return Err(ValidationError::new(
            "amount",
            format!("must not exceed {:.2}", MAX_AMOUNT),
        ));
    }

    Ok((amount * 100.0).round() as u64)
}

/// Validates the request against the catalog and builds the immutable purchase intent.
pub fn validate_purchase(
    request: &PurchaseRequest,
) -> Result<(PurchaseIntent, &'static Product), ValidationError> {
    let product = validate_product(&request.product_code)?;
    let target_contact = normalize_contact(&request.target_contact)?;

    let email = request.purchaser_email.trim();
    validate_email(email)?;

    let volume: u32 = request
        .volume
        .trim()
        .parse()
        .map_err(|_| ValidationError::new("volume", "must be a whole number of MB"))?;
    if volume != product.volume_mb {
        return Err(ValidationError::new(
            "volume",
            format!("must be {} for {}", product.volume_mb, product.code),
        ));
    }

    let amount_minor = validate_amount(request.amount)?;
    if amount_minor != product.price_minor {
        return Err(ValidationError::new(
            "amount",
            format!(
                "must be {:.2} for {}",
                product.price_minor as f64 / 100.0,
                product.code
            ),
        ));
    }

    let intent = PurchaseIntent {
        product_code: product.code.to_string(),
        network: product.network.to_string(),
        target_contact,
        volume_mb: volume,
        amount_minor,
        purchaser_email: email.to_string(),
    };

    Ok((intent, product))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PurchaseRequest {
        PurchaseRequest {
            product_code: "mtn-1gb".to_string(),
            target_contact: "0551234567".to_string(),
            volume: "1000".to_string(),
            amount: 5.50,
            purchaser_email: "a@b.com".to_string(),
        }
    }

    #[test]
    fn validates_required_field() {
        assert!(validate_required("field", "value").is_ok());
        assert!(validate_required("field", "   ").is_err());
    }

    #[test]
    fn sanitizes_string() {
        assert_eq!(sanitize_string("  hello\tworld  "), "hello world");
        assert_eq!(sanitize_string("ab\u{0000}cd\u{0007}"), "abcd");
    }

    #[test]
    fn normalizes_contacts() {
        assert_eq!(normalize_contact("0551234567").unwrap(), "0551234567");
        assert_eq!(normalize_contact("+233551234567").unwrap(), "0551234567");
        assert_eq!(normalize_contact("233 55 123 4567").unwrap(), "0551234567");
        assert!(normalize_contact("055123456").is_err());
        assert!(normalize_contact("1551234567").is_err());
        assert!(normalize_contact("05512345ab").is_err());
        assert!(normalize_contact("0051234567").is_err());
        assert!(normalize_contact("").is_err());
    }

    #[test]
    fn validates_emails() {
        assert!(validate_email("a@b.com").is_ok());
        assert!(validate_email("first.last@mail.example.gh").is_ok());
        assert!(validate_email("@b.com").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("a@@b.com").is_err());
        assert!(validate_email("a b@c.com").is_err());
        assert!(validate_email("a@b..com").is_err());
    }

    #[test]
    fn validates_amount_bounds() {
        assert_eq!(validate_amount(5.5).unwrap(), 550);
        assert_eq!(validate_amount(0.1 + 0.2).unwrap(), 30);
        assert!(validate_amount(0.0).is_err());
        assert!(validate_amount(-3.0).is_err());
        assert!(validate_amount(1000.01).is_err());
        assert!(validate_amount(f64::NAN).is_err());
    }

    #[test]
    fn builds_intent_from_valid_request() {
        let (intent, product) = validate_purchase(&request()).unwrap();
        assert_eq!(product.reference_prefix, "MTN_DATA");
        assert_eq!(intent.network, "mtn");
        assert_eq!(intent.amount_minor, 550);
        assert_eq!(intent.volume_mb, 1000);
    }

    #[test]
    fn rejects_price_tampering() {
        let mut tampered = request();
        tampered.amount = 1.0;
        let err = validate_purchase(&tampered).unwrap_err();
        assert_eq!(err.field, "amount");
    }

    #[test]
    fn rejects_volume_mismatch_and_unknown_product() {
        let mut wrong_volume = request();
        wrong_volume.volume = "2000".to_string();
        assert_eq!(validate_purchase(&wrong_volume).unwrap_err().field, "volume");

        let mut unknown = request();
        unknown.product_code = "glo-1gb".to_string();
        assert_eq!(validate_purchase(&unknown).unwrap_err().field, "productCode");
    }

    #[test]
    fn accepts_numeric_volume() {
        let parsed: PurchaseRequest = serde_json::from_str(
            r#"{"productCode":"at-5gb","targetContact":"0271234567","volume":5000,"amount":20,"purchaserEmail":"x@y.com"}"#,
        )
        .unwrap();
        assert_eq!(parsed.volume, "5000");
        assert!(validate_purchase(&parsed).is_ok());
    }
}
