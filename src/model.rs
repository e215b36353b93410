use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ParseError;

pub const CURRENCY_BRL: &str = "BRL";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    #[serde(rename = "PIX")]
    Pix,
    #[serde(rename = "BOLETO")]
    Boleto,
    #[serde(rename = "TED")]
    Ted,
    #[serde(rename = "CARD")]
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Pix => "PIX",
            PaymentMethod::Boleto => "BOLETO",
            PaymentMethod::Ted => "TED",
            PaymentMethod::Card => "CARD",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment rail with its selection weight and amount bounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rail {
    pub method: PaymentMethod,
    pub weight: f64,
    #[serde(alias = "min")]
    pub min_amount: Decimal,
    #[serde(alias = "max")]
    pub max_amount: Decimal,
}

impl Rail {
    pub fn new(method: PaymentMethod, weight: f64, min_amount: Decimal, max_amount: Decimal) -> Self {
        Self {
            method,
            weight,
            min_amount,
            max_amount,
        }
    }
}

/// Production traffic mix: weights sum to 100.
pub fn default_rails() -> Vec<Rail> {
    vec![
        Rail::new(PaymentMethod::Pix, 65.0, dec!(5), dec!(4800)),
        Rail::new(PaymentMethod::Boleto, 20.0, dec!(10), dec!(9000)),
        Rail::new(PaymentMethod::Ted, 10.0, dec!(80), dec!(19000)),
        Rail::new(PaymentMethod::Card, 5.0, dec!(2), dec!(7000)),
    ]
}

/// Body of `POST /payments`. Built once per logical request and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub destination: String,
}

impl PaymentRequest {
    pub fn new(amount: Decimal, method: PaymentMethod, destination: impl Into<String>) -> Self {
        Self {
            amount,
            currency: CURRENCY_BRL.to_string(),
            method,
            destination: destination.into(),
        }
    }
}

/// Header identity attached to a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub merchant_id: String,
    pub customer_id: String,
    pub account_id: String,
    pub idempotency_key: String,
}

/// A request ready for transmission: the serialized body is frozen here so
/// that every send of the same logical request carries the same bytes.
#[derive(Debug, Clone)]
pub struct PreparedPayment {
    pub request: PaymentRequest,
    pub identity: RequestIdentity,
    pub body: Vec<u8>,
}

impl PreparedPayment {
    pub fn new(request: PaymentRequest, identity: RequestIdentity) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(&request)?;
        Ok(Self {
            request,
            identity,
            body,
        })
    }
}

/// The fields of an API response the harness cares about.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ParsedBody {
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ParsedBody {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::EmptyBody);
        }
        serde_json::from_slice(bytes).map_err(|e| ParseError::Json(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum ResponseOutcome {
    #[serde(rename = "ALLOWED")]
    Allowed,
    #[serde(rename = "BLOCKED")]
    Blocked,
    #[serde(rename = "IN_REVIEW")]
    InReview,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
    #[serde(rename = "SERVER_ERROR")]
    ServerError,
    #[serde(rename = "UNCLASSIFIED")]
    Unclassified,
}

impl ResponseOutcome {
    pub const ALL: [ResponseOutcome; 7] = [
        ResponseOutcome::Allowed,
        ResponseOutcome::Blocked,
        ResponseOutcome::InReview,
        ResponseOutcome::RateLimited,
        ResponseOutcome::ValidationError,
        ResponseOutcome::ServerError,
        ResponseOutcome::Unclassified,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionResult {
    pub first_payment_id: Option<String>,
    pub second_payment_id: Option<String>,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairVerdict {
    /// At least one call did not return 202; counted individually only.
    Excluded,
    SameResource(CollisionResult),
    Mismatch(CollisionResult),
}
