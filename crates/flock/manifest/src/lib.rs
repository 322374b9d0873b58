mod error;
mod fetch;
mod resolver;
pub mod schema;

pub use self::{
    error::ManifestError,
    resolver::{ManifestResolver, ResolverOptions},
};
