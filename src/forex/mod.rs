// =============================================================================
// Forex rates and conversion
// =============================================================================
//
//   cache    short-TTL pair cache over the broker quote stream, with a
//            deterministic mock-rate fallback for non-finite quotes
//   engine   direct / inverse / cross-via-USD conversion arithmetic
// =============================================================================

pub mod cache;
pub mod engine;

pub use cache::{ForexCache, ForexRate, RateSource};
pub use engine::{ConversionMethod, ConversionResult, ForexEngine};
