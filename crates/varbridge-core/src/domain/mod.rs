/// Variable aggregate and identities
pub mod variable;

/// Typed values and constraint maps
pub mod value;

/// Pluggable variable types
pub mod types;

/// Dependency graph
pub mod dependency;

/// Access rules and evaluation
pub mod access;

/// Update, lock and audit events
pub mod events;

/// Optimization lock records
pub mod optimization;

/// Exported session contents
pub mod snapshot;

/// External collaborator interfaces
pub mod collaborators;
