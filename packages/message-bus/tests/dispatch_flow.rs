//! End-to-end dispatch through the public API.

mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use message_bus::{
    async_trait, AnyMessage, BatchPolicy, BusConfig, BusError, CommandHandler, Context, Event,
    EventHandler, HandlerContext, Message, MessageBus, MessageKind,
};
use serde::Serialize;

use common::{init_tracing, CreateUser, SendWelcome, UserCreated};

type Journal = Arc<Mutex<Vec<String>>>;

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().map(|j| j.clone()).unwrap_or_default()
}

// =============================================================================
// Breadth-first drain
// =============================================================================

#[derive(Debug, Serialize)]
struct Node(&'static str);
impl Message for Node {}
impl Event for Node {}

struct Tree(Journal);

#[async_trait]
impl EventHandler<Node> for Tree {
    async fn handle(&self, node: &Node, ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.0.lock().unwrap().push(node.0.to_string());
        match node.0 {
            "A" => {
                ctx.emit_event(Node("B"));
                ctx.emit_event(Node("C"));
            }
            "B" => ctx.emit_event(Node("D")),
            _ => {}
        }
        Ok(())
    }
}

#[tokio::test]
async fn emissions_drain_breadth_first() {
    init_tracing();
    let seen = journal();
    let bus = MessageBus::new().with_event_handler(Tree(seen.clone()));

    let dispatched = bus.publish(Node("A"), &mut Context::new()).await.unwrap();

    assert_eq!(entries(&seen), vec!["A", "B", "C", "D"]);
    assert_eq!(dispatched.trace().len(), 4);
    assert!(dispatched
        .trace()
        .iter()
        .all(|record| record.kind == MessageKind::Event));
}

// =============================================================================
// Command -> event -> command chain
// =============================================================================

struct CreateUserHandler;

#[async_trait]
impl CommandHandler<CreateUser> for CreateUserHandler {
    async fn handle(&self, cmd: CreateUser, ctx: &mut HandlerContext<'_>) -> Result<u64> {
        anyhow::ensure!(cmd.email.contains('@'), "invalid email: {}", cmd.email);
        let user_id = 100;
        ctx.emit_event(UserCreated {
            user_id,
            email: cmd.email,
        });
        Ok(user_id)
    }
}

struct WelcomePolicy;

#[async_trait]
impl EventHandler<UserCreated> for WelcomePolicy {
    async fn handle(&self, event: &UserCreated, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.emit_command(SendWelcome {
            user_id: event.user_id,
        });
        Ok(())
    }
}

struct SendWelcomeHandler(Journal);

#[async_trait]
impl CommandHandler<SendWelcome> for SendWelcomeHandler {
    async fn handle(&self, cmd: SendWelcome, _ctx: &mut HandlerContext<'_>) -> Result<()> {
        self.0.lock().unwrap().push(format!("welcome:{}", cmd.user_id));
        Ok(())
    }
}

fn user_bus(sent: Journal, config: BusConfig) -> MessageBus {
    MessageBus::with_config(config)
        .with_command_handler(CreateUserHandler)
        .with_event_handler(WelcomePolicy)
        .with_command_handler(SendWelcomeHandler(sent))
}

#[tokio::test]
async fn command_output_and_chained_emissions() {
    init_tracing();
    let sent = journal();
    let bus = user_bus(sent.clone(), BusConfig::default());

    let mut dispatched = bus
        .handle(
            AnyMessage::command(CreateUser {
                email: "ada@example.com".into(),
            }),
            &mut Context::new(),
        )
        .await
        .unwrap();

    assert_eq!(dispatched.take_output::<u64>(), Some(100));
    assert_eq!(
        dispatched.dispatched_types(),
        vec!["CreateUser", "user.created.v1", "SendWelcome"]
    );
    assert_eq!(entries(&sent), vec!["welcome:100"]);
}

#[tokio::test]
async fn batch_of_three_with_middle_failure() {
    init_tracing();
    let sent = journal();
    let bus = user_bus(sent.clone(), BusConfig::default());
    let mut ctx = Context::new();

    let outcomes = bus
        .batch_handle(
            vec![
                AnyMessage::command(CreateUser {
                    email: "ada@example.com".into(),
                }),
                AnyMessage::command(CreateUser {
                    email: "not-an-email".into(),
                }),
                AnyMessage::command(CreateUser {
                    email: "grace@example.com".into(),
                }),
            ],
            &mut ctx,
        )
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_ok());
    match &outcomes[1] {
        Err(BusError::HandlerFailed { message_type, source, .. }) => {
            assert_eq!(message_type, "CreateUser");
            assert!(source.to_string().contains("invalid email"));
        }
        other => panic!("expected handler failure, got {:?}", other),
    }
    assert!(outcomes[2].is_ok());
    assert_eq!(entries(&sent), vec!["welcome:100", "welcome:100"]);
}

#[tokio::test]
async fn batch_stop_on_failure_reports_not_attempted() {
    init_tracing();
    let sent = journal();
    let config = BusConfig::default().with_batch_policy(BatchPolicy::StopOnFailure);
    let bus = user_bus(sent.clone(), config);

    let outcomes = bus
        .batch_handle(
            vec![
                AnyMessage::command(CreateUser {
                    email: "bad".into(),
                }),
                AnyMessage::command(CreateUser {
                    email: "ada@example.com".into(),
                }),
            ],
            &mut Context::new(),
        )
        .await;

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].as_ref().unwrap_err().is_handler_failure());
    assert!(matches!(outcomes[1], Err(BusError::NotAttempted { .. })));
    assert!(entries(&sent).is_empty());
}

// =============================================================================
// Context sharing
// =============================================================================

struct Counter;

#[async_trait]
impl EventHandler<Node> for Counter {
    async fn before_handle(&self, context: &mut Context) -> Result<()> {
        let count = context.get::<u32>("before").copied().unwrap_or(0);
        context.insert("before", count + 1);
        Ok(())
    }

    async fn handle(&self, node: &Node, ctx: &mut HandlerContext<'_>) -> Result<()> {
        let count = ctx.get::<u32>("handled").copied().unwrap_or(0);
        ctx.insert("handled", count + 1);
        if node.0 == "root" {
            ctx.emit_event(Node("child"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn context_is_shared_across_the_drain() {
    init_tracing();
    let bus = MessageBus::new().with_event_handler(Counter);
    let mut ctx = Context::new().with("request_id", "r-1".to_string());

    bus.publish(Node("root"), &mut ctx).await.unwrap();

    assert_eq!(ctx.get::<u32>("before"), Some(&2));
    assert_eq!(ctx.get::<u32>("handled"), Some(&2));
    assert_eq!(ctx.get::<String>("request_id").map(String::as_str), Some("r-1"));
}

#[tokio::test]
async fn unregistered_command_is_an_error_and_event_is_not() {
    init_tracing();
    let bus = MessageBus::new();
    let mut ctx = Context::new();

    let err = bus
        .execute(SendWelcome { user_id: 1 }, &mut ctx)
        .await
        .unwrap_err();
    assert!(err.is_no_handler());

    let dispatched = bus
        .publish(
            UserCreated {
                user_id: 1,
                email: "a@b.c".into(),
            },
            &mut ctx,
        )
        .await
        .unwrap();
    assert!(dispatched.is_clean());
}
