use crate::error::ParseError;
use crate::model::{CollisionResult, PairVerdict, ParsedBody, ResponseOutcome};

pub const STATUS_ACCEPTED: u16 = 202;
pub const BODY_STATUS_BLOCKED: &str = "BLOCKED";
pub const BODY_STATUS_IN_REVIEW: &str = "IN_REVIEW";

/// Maps a response to the outcome taxonomy.
///
/// `status` is `None` when the call never got a response. The body is only
/// consulted for 202: there an unparseable body is unclassified, while a
/// parsed body without a recognised `status` counts as allowed.
///
/// A 202 whose body cannot be read is never counted as allowed; it lands in
/// `UNCLASSIFIED` and in `response_parse_errors_total`.
pub fn classify(status: Option<u16>, body: &Result<ParsedBody, ParseError>) -> ResponseOutcome {
    let Some(status) = status else {
        return ResponseOutcome::Unclassified;
    };
    match status {
        STATUS_ACCEPTED => match body {
            Ok(parsed) => match parsed.status.as_deref() {
                Some(BODY_STATUS_BLOCKED) => ResponseOutcome::Blocked,
                Some(BODY_STATUS_IN_REVIEW) => ResponseOutcome::InReview,
                _ => ResponseOutcome::Allowed,
            },
            Err(_) => ResponseOutcome::Unclassified,
        },
        429 => ResponseOutcome::RateLimited,
        400 | 403 | 422 => ResponseOutcome::ValidationError,
        s if s >= 500 => ResponseOutcome::ServerError,
        _ => ResponseOutcome::Unclassified,
    }
}

/// Accepted, or rejected on purpose by an admission control.
pub fn is_controlled(status: Option<u16>) -> bool {
    matches!(status, Some(202 | 403 | 422 | 429))
}

/// Failed in the load-testing sense: no response, or a status >= 400.
pub fn is_failed_request(status: Option<u16>) -> bool {
    status.is_none_or(|s| s >= 400)
}

/// One side of an idempotency pair as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub struct PairSide<'a> {
    pub status: Option<u16>,
    pub payment_id: Option<&'a str>,
}

/// Compares the two calls of a pair. Pairs where either call was not
/// accepted are excluded; a missing id on an accepted call is a mismatch.
pub fn compare_pair(first: PairSide<'_>, second: PairSide<'_>) -> PairVerdict {
    if first.status != Some(STATUS_ACCEPTED) || second.status != Some(STATUS_ACCEPTED) {
        return PairVerdict::Excluded;
    }
    let matched = match (first.payment_id, second.payment_id) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    let result = CollisionResult {
        first_payment_id: first.payment_id.map(str::to_string),
        second_payment_id: second.payment_id.map(str::to_string),
        matched,
    };
    if matched {
        PairVerdict::SameResource(result)
    } else {
        PairVerdict::Mismatch(result)
    }
}
