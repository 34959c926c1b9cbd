//! RPC facade for geodb.
//!
//! The outward service is a tarpc trait implemented by
//! [`handler::Handler`]; mutations are funneled through [`writer`]'s
//! dedicated background thread so the tokio runtime never blocks on the
//! substrate's synchronous write path.

pub mod error;
pub mod handler;
pub mod protocol;
pub mod writer;

pub use error::{Error, Status};
pub use handler::Handler;
pub use protocol::{GeodbService, GeodbServiceClient, StreamFilter};
