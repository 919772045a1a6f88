//! Security access (service 0x27) session management

mod key;
mod manager;

pub use key::{
    compute_key, generate_seed, key_matches, level_for_sub_function, KEY_MASK, SEED_LEN,
};
pub use manager::{KeyOutcome, SecurityManager, MAX_FAILED_ATTEMPTS};
