// src/crawl/providers/mod.rs
pub mod json;
pub mod rss;

pub use json::JsonSource;
pub use rss::RssSource;
