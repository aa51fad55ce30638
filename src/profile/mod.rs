pub mod coordinator;
pub mod images;

pub use coordinator::{ImageUpload, ProfileImageCoordinator};
pub use images::{HttpImageSource, RemoteImageSource};
