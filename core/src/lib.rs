//! Settlement engine for benefit payments: payment chains, the timeline
//! they project, and the saga that commits a decision as a new batch.

pub mod batch;
pub mod clawback;
pub mod clock;
pub mod config;
pub mod decision;
pub mod delivery;
pub mod error;
pub mod event;
pub mod line;
pub mod period;
pub mod rng;
pub mod saga;
pub mod simulation;
pub mod store;
pub mod strategy;
pub mod timeline;
pub mod types;
