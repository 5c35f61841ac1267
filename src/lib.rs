//! Client-side cache and coordinators for a paginated users admin list.

pub mod api;
pub mod cache;
pub mod error;
pub mod event;
pub mod fetch;
pub mod filters;
pub mod mutation;
pub mod prefetch;
pub mod session;
pub mod sync;
pub mod tasks;
pub mod view;

pub use error::{ListError, Result};
pub use session::{ListSession, SessionOptions};
