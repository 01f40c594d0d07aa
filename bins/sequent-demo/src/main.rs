//! # Sequent Demo
//!
//! A minimal end-to-end walkthrough of the Sequent building blocks, running
//! entirely in-process against `sequent-memory`'s reference adapters:
//!
//! - Declares a `UserRegistered` event type scoped to a `User` aggregate
//! - Evolves it with `addFields` into `UserRegisteredWithPlan`
//! - Produces a handful of users onto the original generation
//! - Projects the evolved generation into an in-memory read model, which
//!   migrates the existing backlog through the new field before ingesting
//!
//! ## Usage
//!
//! ```bash
//! sequent-demo --users 5
//! RUST_LOG=debug sequent-demo --users 20
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sequent_core::{
    Aggregate, ComputedField, EventType, Field, ReadModel, RunOptions, Schema,
};
use sequent_memory::{InMemoryClient, InMemoryClientFactory, InMemoryTopicFactory};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the Sequent demo runner.
#[derive(Parser, Debug)]
#[command(name = "sequent-demo")]
#[command(about = "Declares, evolves, and projects an event type end to end")]
struct Args {
    /// Number of users to register before projecting.
    #[arg(long, default_value_t = 5)]
    users: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRegistered {
    id: String,
    email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRegisteredWithPlan {
    id: String,
    email: String,
    plan: String,
}

fn user_registered_schema() -> Schema {
    Schema::record(vec![Field::new("id", Schema::String), Field::new("email", Schema::String)])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cancel = CancellationToken::new();

    let topic_factory: Arc<InMemoryTopicFactory> = Arc::new(InMemoryTopicFactory::new());
    let aggregate = Aggregate::new("User", topic_factory.clone());

    let user_registered: EventType<UserRegistered> = EventType::new("UserRegistered", user_registered_schema());
    // Bind once and evolve from the bound declaration, so the migrator chain
    // built below shares the same (aggregate-scoped) source topic as the
    // producer rather than the unbound generation's topic.
    let user_registered = user_registered.bound_to(aggregate.clone())?;

    let producer = user_registered.producer(aggregate.topic_factory(), RunOptions::default()).await?;
    for i in 0..args.users {
        producer
            .produce(
                UserRegistered {
                    id: format!("user-{i}"),
                    email: format!("user-{i}@example.com"),
                },
                None,
            )
            .await?;
    }
    tracing::info!(count = args.users, "registered users");

    let with_plan: EventType<UserRegisteredWithPlan> = user_registered.add_fields(
        vec![ComputedField::new("plan", Schema::String, |_: &UserRegistered| {
            Value::String("free".to_string())
        })],
        None,
    )?;

    // Running the evolved generation's own producer replicates the entire
    // backlog through the new `addFields` migrator before the read model
    // below ever opens a consumer on it.
    let _with_plan_producer = with_plan.producer(aggregate.topic_factory(), RunOptions::default()).await?;

    let read_model = ReadModel::<InMemoryClient>::new("users").on(
        &with_plan,
        "project",
        None,
        |event: UserRegisteredWithPlan, client: Arc<InMemoryClient>, _key| async move {
            client
                .put("users", event.id.clone(), serde_json::json!({"email": event.email, "plan": event.plan}))
                .await;
            Ok(())
        },
    );

    let client_factory = Arc::new(InMemoryClientFactory::new());
    let client = aggregate
        .use_client_factory(client_factory)
        .use_read_model(&read_model, RunOptions::default())
        .await?;

    let run = async {
        // `use_read_model` resolves once every ingestor is recency-caught-up,
        // not once the backlog has actually been handled and acked; give the
        // background merge loop a moment to drain it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let users = client.all("users").await;
        tracing::info!(projected = users.len(), "caught up");
        for user in &users {
            println!("{user}");
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            println!("received Ctrl-C, shutting down");
            cancel.cancel();
        }
        _ = run => {}
    }

    Ok(())
}
