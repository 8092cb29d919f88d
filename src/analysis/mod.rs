//! Bottleneck detection against per-operation baselines.

pub mod bottleneck;

pub use bottleneck::{
    ActionItem, ActionPlan, Bottleneck, BottleneckAnalyzer, BottleneckType, Severity, SystemBottlenecks,
};
