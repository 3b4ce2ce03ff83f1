//! Persistence collaborators. The engine only ever talks to the
//! [`stats::StatsStore`] trait; lobby listings and leaderboards read the
//! persisted data elsewhere.

pub mod stats;
