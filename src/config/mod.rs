// src/config/mod.rs
pub mod crawlers;

pub use crawlers::{
    load_config_default, load_config_from, BudgetConfig, DaemonConfig, SourceConfig, SourceKind,
};
