//! Workload generation: rail selection, amount synthesis, destinations and
//! request identities.
//!
//! Everything random draws from a caller-supplied [`Rng`], so a seeded
//! generator replays the exact same traffic. Everything else is plain index
//! arithmetic over `(worker, iteration)`.

use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::HarnessError;
use crate::model::{PaymentMethod, PaymentRequest, PreparedPayment, Rail, RequestIdentity};

pub const CUSTOMER_NONE: &str = "customer-none-001";
pub const CUSTOMER_BASIC: &str = "customer-basic-001";
pub const CUSTOMER_FULL: &str = "customer-full-001";

/// Non-empty, validated rail list.
#[derive(Debug, Clone)]
pub struct RailTable {
    rails: Vec<Rail>,
    total_weight: f64,
}

impl RailTable {
    pub fn new(rails: Vec<Rail>) -> Result<Self, HarnessError> {
        if rails.is_empty() {
            return Err(HarnessError::invalid("rails", "at least one rail is required"));
        }
        for rail in &rails {
            let field = format!("rails.{}", rail.method);
            if !(rail.weight.is_finite() && rail.weight > 0.0) {
                return Err(HarnessError::invalid(field, "weight must be positive"));
            }
            if rail.min_amount <= Decimal::ZERO || rail.min_amount > rail.max_amount {
                return Err(HarnessError::invalid(
                    field,
                    format!("bounds [{}, {}] are not a positive range", rail.min_amount, rail.max_amount),
                ));
            }
            if rail.min_amount.normalize().scale() > 2 || rail.max_amount.normalize().scale() > 2 {
                return Err(HarnessError::invalid(field, "bounds must have at most 2 decimal places"));
            }
        }
        let total_weight = rails.iter().map(|r| r.weight).sum();
        Ok(Self { rails, total_weight })
    }

    pub fn rails(&self) -> &[Rail] {
        &self.rails
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Cumulative-weight draw over a uniform ticket in `[0, total_weight)`.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &Rail {
        let ticket = rng.gen_range(0.0..self.total_weight);
        self.select(ticket)
    }

    /// Returns the first rail whose cumulative weight reaches `ticket`,
    /// falling back to the first rail when rounding leaves the ticket past
    /// the last cumulative sum.
    pub fn select(&self, ticket: f64) -> &Rail {
        let mut cumulative = 0.0;
        for rail in &self.rails {
            cumulative += rail.weight;
            if ticket <= cumulative {
                return rail;
            }
        }
        &self.rails[0]
    }
}

/// Uniform amount in `[min, max]`, rounded half-away-from-zero to cents.
pub fn synthesize_amount<R: Rng + ?Sized>(rail: &Rail, rng: &mut R) -> Decimal {
    let unit: f64 = rng.gen_range(0.0..=1.0);
    let unit = Decimal::from_f64(unit).unwrap_or(Decimal::ZERO).round_dp(10);
    let span = rail.max_amount - rail.min_amount;
    (rail.min_amount + span * unit)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .clamp(rail.min_amount, rail.max_amount)
}

/// Occasionally the known-blocked destination, otherwise one unique to this
/// `(worker, iteration)`. `block_ratio` must lie in `[0, 1]`.
pub fn destination_for<R: Rng + ?Sized>(
    worker: u64,
    iteration: u64,
    block_ratio: f64,
    blocked_destination: &str,
    rng: &mut R,
) -> String {
    if rng.gen_bool(block_ratio) {
        return blocked_destination.to_string();
    }
    format!("dest-{}-{}", worker, iteration)
}

/// Customers map to KYC tiers by convention: TED needs FULL, the others
/// BASIC, and a slice of traffic uses under-verified customers on purpose.
pub fn customer_for(method: PaymentMethod, iteration: u64) -> &'static str {
    match method {
        PaymentMethod::Ted => {
            if iteration % 10 == 0 {
                CUSTOMER_BASIC
            } else {
                CUSTOMER_FULL
            }
        }
        _ => {
            if iteration % 20 == 0 {
                CUSTOMER_NONE
            } else {
                CUSTOMER_BASIC
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MixedWorkload {
    rails: RailTable,
    block_ratio: f64,
    blocked_destination: String,
    merchant_cardinality: u64,
    account_cardinality: u64,
}

impl MixedWorkload {
    pub fn new(
        rails: RailTable,
        block_ratio: f64,
        blocked_destination: impl Into<String>,
        merchant_cardinality: u64,
        account_cardinality: u64,
    ) -> Result<Self, HarnessError> {
        if !(0.0..=1.0).contains(&block_ratio) {
            return Err(HarnessError::invalid(
                "mixed.destination_block_ratio",
                format!("{} is outside [0, 1]", block_ratio),
            ));
        }
        let blocked_destination = blocked_destination.into();
        if blocked_destination.trim().is_empty() {
            return Err(HarnessError::invalid("mixed.blocked_destination", "must not be empty"));
        }
        if merchant_cardinality == 0 || account_cardinality == 0 {
            return Err(HarnessError::invalid(
                "mixed.merchant_cardinality",
                "cardinalities must be at least 1",
            ));
        }
        Ok(Self {
            rails,
            block_ratio,
            blocked_destination,
            merchant_cardinality,
            account_cardinality,
        })
    }

    pub fn rails(&self) -> &RailTable {
        &self.rails
    }

    pub fn block_ratio(&self) -> f64 {
        self.block_ratio
    }

    pub fn identity(&self, method: PaymentMethod, worker: u64, iteration: u64) -> RequestIdentity {
        RequestIdentity {
            merchant_id: format!("merchant-{}", (iteration % self.merchant_cardinality) + 1),
            customer_id: customer_for(method, iteration).to_string(),
            account_id: format!("account-{}", (iteration % self.account_cardinality) + 1),
            idempotency_key: format!("mixed-{}-{}-{}", method, worker, iteration),
        }
    }

    /// Builds the request for one mixed-traffic iteration.
    pub fn next<R: Rng + ?Sized>(
        &self,
        worker: u64,
        iteration: u64,
        rng: &mut R,
    ) -> Result<PreparedPayment, serde_json::Error> {
        let rail = self.rails.choose(rng);
        let amount = synthesize_amount(rail, rng);
        let destination = destination_for(
            worker,
            iteration,
            self.block_ratio,
            &self.blocked_destination,
            rng,
        );
        let identity = self.identity(rail.method, worker, iteration);
        PreparedPayment::new(PaymentRequest::new(amount, rail.method, destination), identity)
    }
}

#[derive(Debug, Clone)]
pub struct CollisionWorkload {
    pub amount: Decimal,
    pub key_prefix: String,
    pub identity_cardinality: u64,
    pub destination_cardinality: u64,
}

impl CollisionWorkload {
    /// The single request shared by both calls of pair `pair_index`.
    pub fn pair(&self, worker: u64, pair_index: u64) -> Result<PreparedPayment, serde_json::Error> {
        let request = PaymentRequest::new(
            self.amount,
            PaymentMethod::Pix,
            format!("dest-idem-collision-{}", pair_index % self.destination_cardinality),
        );
        let slot = worker % self.identity_cardinality;
        let identity = RequestIdentity {
            merchant_id: format!("merchant-idem-{}", slot),
            customer_id: CUSTOMER_BASIC.to_string(),
            account_id: format!("account-idem-{}", slot),
            idempotency_key: format!("{}-{}-{}", self.key_prefix, worker, pair_index),
        };
        PreparedPayment::new(request, identity)
    }
}
