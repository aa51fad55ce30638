pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod notify;
pub mod oauth;
pub mod profile;
pub mod reset;
pub mod state;
pub mod storage;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;
