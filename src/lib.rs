pub mod audit;
pub mod backends;
pub mod catalog;
pub mod clarification;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fuzzy_matcher;
pub mod intent;
pub mod memory;
pub mod resolver;
pub mod router;
pub mod scope;
pub mod sql_generator;
pub mod sql_validator;
pub mod time;

pub use catalog::{Catalog, CatalogBuilder, CatalogHandle};
pub use classifier::Tool;
pub use config::RouterConfig;
pub use error::{ErrorCategory, Result, RouterError};
pub use router::{RouteRequest, RouteResult, RouteStage, Router};
pub use scope::{RouteContext, ScopeContext};
