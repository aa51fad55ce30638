pub mod memory;
pub mod repo;
pub mod repo_types;

pub use memory::MemoryUserRepository;
pub use repo::{PgUserRepository, UserRepository, UserUpdate};
pub use repo_types::{normalize_email, AuthProvider, NewUser, User};
