//! kv-prefix-pool: a prefix-sharing KV-cache block pool for LLM inference.
//!
//! A fixed pool of token blocks holds KV state for running sequences:
//!   - sequences sharing a prompt prefix share the blocks caching it
//!   - a token trie finds those blocks, and forks partially matching ones
//!   - unclaimed blocks are swapped GPU VRAM → host RAM in LRU order and
//!     revived from RAM when their prefix is requested again
//!
//! [`cache::manager::BlockManager`] is the entry point; the scheduler drives
//! it through [`cache::sequence::BlockSequence`].

pub mod cache;
pub mod config;
pub mod metrics;
pub mod storage;
