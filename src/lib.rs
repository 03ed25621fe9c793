//! Auditable mutation ledger for a parts-work companion.
//!
//! Every create or update of a part or relationship is recorded with its
//! before and after state so it can be undone later, either by action id or
//! by a free-text description matched against recent actions. Structural
//! changes (splitting one part into several, merging several into one) go
//! through a propose → approve/reject → execute lifecycle with idempotent
//! submission and lineage tracking.
//!
//! ```text
//!  PartService ─┐
//!               ├─► MutationLedger ─► Database (libSQL | PostgreSQL)
//!  ProposalWorkflow ┘        ▲
//!  RollbackEngine ───────────┘
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod parts;
pub mod proposals;
pub mod settings;

#[cfg(all(test, feature = "libsql"))]
mod testing;

pub use config::{Config, DatabaseConfig, LedgerConfig};
pub use db::{ActionKind, Database, EntityTable};
pub use error::{ConfigError, DatabaseError, LedgerError};
pub use ledger::{MutationLedger, RollbackEngine, RollbackOutcome, TrustLevel};
pub use parts::PartService;
pub use proposals::ProposalWorkflow;
pub use settings::Settings;
