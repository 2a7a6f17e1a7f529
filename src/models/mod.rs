//! Request/response shapes exchanged with the wrapped services.
//!
//! None of these are owned or persisted by the facade; they only describe
//! what goes over the wire to the object store, CDN and search index.

pub mod invalidation;
pub mod object;
pub mod search;
