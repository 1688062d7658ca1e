//! Generic node toolbox.

pub mod fetch_url;
pub mod misc;

pub use fetch_url::FetchUrl;
pub use misc::{
    Assign, FindFiles, InterruptIf, Rename, SkipIf, Sub, range_node, walk_files,
};
