//! In-process reference adapters for `sequent-core`'s substrate seams:
//! [`topic::InMemoryTopicFactory`] (the `TopicFactory`/`Topic` contract) and
//! [`client::InMemoryClientFactory`] (the `ReadModelClientFactory`
//! contract). Useful for unit tests, local development, and as a worked
//! example of both seams for application substrates to follow.

pub mod client;
pub mod topic;

pub use client::{InMemoryClient, InMemoryClientFactory};
pub use topic::InMemoryTopicFactory;
