//! CDR mediation: BER record decoding, schema-free record trees, field
//! derivation and destination routing.

pub mod ber;
pub mod codec;
pub mod collab;
pub mod config;
pub mod derive;
pub mod error;
pub mod filter;
pub mod framer;
pub mod pipeline;
pub mod routing;
pub mod schema;
pub mod tree;

pub use config::MediationConfig;
pub use derive::{derive, Category, Projection};
pub use error::{PipelineError, Result};
