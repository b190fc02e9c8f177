// Generation jobs: store, worker, client and the HTTP handlers over them.
// Generators are the only code that calls the language model.

pub mod client;
pub mod generator;
pub mod handlers;
pub mod job;
pub mod pg_store;
pub mod profile;
pub mod prompts;
pub mod recommendations;
pub mod responses;
pub mod store;
pub mod worker;
