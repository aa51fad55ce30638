pub mod ledger;
pub mod memory;
pub mod repo;

pub use ledger::ResetTokenLedger;
pub use memory::MemoryResetTokenRepository;
pub use repo::{PgResetTokenRepository, ResetToken, ResetTokenRepository};
