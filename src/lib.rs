pub mod api;
pub mod cache;
pub mod database;
pub mod error;
pub mod models;
pub mod services;
pub mod usage;
pub mod utils;

pub use error::{PersistenceError, PriceError};
pub use services::{PortfolioRefresh, PortfolioServices};
