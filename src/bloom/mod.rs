//! Bloom pre-filter for candidate search.
//!
//! A negative answer proves no entity in the organization shares a token
//! with the query, so the registry can skip the text index entirely.

mod filter;
mod index;

pub use filter::BloomFilter;
pub use index::{BloomIndex, BloomStats};
