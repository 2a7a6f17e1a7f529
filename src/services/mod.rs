pub mod cache_service;
pub mod cdn;
pub mod local_store;
pub mod object_store;
pub mod s3_store;
pub mod search_index;
