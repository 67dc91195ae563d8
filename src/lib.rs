pub mod app;
pub mod closure;
pub mod config;
pub mod controller;
pub mod counter;
pub mod error;
pub mod history;
pub mod identity;
pub mod notify;
pub mod responder;
pub mod satisfaction;
pub mod store;
pub mod types;
pub mod ui_state;

#[cfg(test)]
mod test_support;
