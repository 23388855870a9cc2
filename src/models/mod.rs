//! Model ids and routing.

pub mod routes;
pub mod selector;

pub use routes::{
    BackendKind, ModelRoute, ProviderRoutes, RouteEntry, RouteOverride, RouteTable, WILDCARD,
};
pub use selector::{ModelRef, ModelSelector};
