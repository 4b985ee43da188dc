//! Prefix-sharing KV block pool.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`block`]: KvBlock, BlockState, BlockTable, Tier definitions
//! - [`manager`]: Block manager that orchestrates allocation, sharing and swapping
//! - [`evictor`]: LRU eviction order
//! - [`trie`]: Token trie indexing cached prefixes
//! - [`sequence`]: The sequence interface the manager consumes

pub mod block;
pub mod evictor;
pub mod manager;
pub mod sequence;
pub mod trie;
