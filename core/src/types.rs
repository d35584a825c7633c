//! Shared primitive types used across the engine.

/// A stable customer identifier, as assigned by the upstream CRM.
pub type CustomerId = i64;

/// Ledger row identifier.
pub type TransactionId = i64;
