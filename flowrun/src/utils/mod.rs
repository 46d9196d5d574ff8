//! Utility functions for identifiers, timestamps, and cache keys.

mod hashing;
pub mod timestamps;
mod uuid_utils;

pub use hashing::task_cache_key;
pub use timestamps::{add_millis, format_timestamp, now_utc, parse_timestamp, Timestamp};
pub use uuid_utils::{generate_uuid_v7, parse_uuid};
