//! External bucket-partitioned sort.
//!
//! Entries are distributed into buckets by the high bits of their sort key
//! as they arrive; each bucket is later sorted in memory, one at a time, as
//! the consumer's read position crosses into it. Because the bucket index
//! is the key's high prefix, the concatenation of sorted buckets is
//! globally sorted. Every plotting phase moves its tables through one of
//! these.

pub mod manager;
pub mod quicksort;
pub mod uniform;

pub use manager::{SortConfig, SortManager, SortStrategy};
