//! Utility functions for identifiers, timestamps and paths.

pub mod paths;
pub mod timestamps;
mod uuid_utils;

pub use paths::{canonical_path, canonical_path_string, canonical_path_strings, file_stem_string};
pub use timestamps::{format_timestamp, now_local, parse_timestamp, Timestamp, DATETIME_FORMAT};
pub use uuid_utils::{generate_run_id, generate_uuid, is_valid_run_id, RUN_ID_LEN};
