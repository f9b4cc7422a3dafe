//! Utility modules for logtap.
//!
//! This module contains helpers for structured-object queries, timestamp
//! normalization, and CloudWatch Logs attribute derivation.

pub mod cloudwatch;
pub mod query;
pub mod timestamp;
