//! Declarative mapping of library models into application directories.

pub mod config;
mod engine;

pub use config::{
    load_merged_rules, save_config, MappingConfig, MappingRule, MergedRules, RuleFilters,
};
pub use engine::{
    MappingAction, MappingActionType, MappingPreview, MappingReport, ModelMapper,
};
