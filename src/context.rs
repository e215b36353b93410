use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Produces the random source for one worker.
/// Decouples workload generation from `thread_rng()` so runs can be replayed.
pub trait RngFactory: Send + Sync {
    fn for_worker(&self, worker_index: u64) -> StdRng;
}

/// Context handed to every scenario pipeline.
#[derive(Clone)]
pub struct HarnessContext {
    pub rng: Arc<dyn RngFactory>,
}

impl HarnessContext {
    pub fn new_system() -> Self {
        Self {
            rng: Arc::new(EntropyRngFactory),
        }
    }

    pub fn new_seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(SeededRngFactory::new(seed)),
        }
    }

    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::new_seeded(seed),
            None => Self::new_system(),
        }
    }
}

// --- Live Implementation ---

pub struct EntropyRngFactory;

impl RngFactory for EntropyRngFactory {
    fn for_worker(&self, _worker_index: u64) -> StdRng {
        StdRng::from_entropy()
    }
}

// --- Replay Implementation ---

pub struct SeededRngFactory {
    seed: u64,
}

impl SeededRngFactory {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl RngFactory for SeededRngFactory {
    fn for_worker(&self, worker_index: u64) -> StdRng {
        StdRng::seed_from_u64(splitmix64(self.seed ^ worker_index))
    }
}

// Spreads adjacent worker indices across the seed space.
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
