//! Publishing events to server-side subscribers through the broker.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use common::{Harness, HelloRequest};
use microrpc::server::{Event, SubscriberFunc, SubscriberWrapper};
use microrpc::{Client, ClientOptions, Context, RpcError, Subscriber};

type Seen = Arc<Mutex<Vec<String>>>;

fn recording(topic: &str, seen: &Seen, tag: &'static str) -> Subscriber {
    let seen = Arc::clone(seen);
    Subscriber::new(topic, move |_ctx: Context, req: HelloRequest| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(format!("{}:{}", tag, req.name));
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    let seen: Seen = Arc::default();
    let harness = Harness::start_with(
        |opts| opts,
        |server| {
            server.subscribe(recording("greetings", &seen, "first")).unwrap();
            server.subscribe(recording("greetings", &seen, "second")).unwrap();
            server.subscribe(recording("farewells", &seen, "other")).unwrap();
        },
    )
    .await;
    assert_eq!(harness.broker.subscriber_count("greetings"), 1);
    let client = harness.client();

    for ct in ["application/bincode", "application/json"] {
        seen.lock().clear();
        let msg = client
            .new_publication("greetings", HelloRequest { name: "John".into() })
            .with_content_type(ct);
        client.publish(&Context::background(), &msg).await.unwrap();

        let mut got = seen.lock().clone();
        got.sort();
        assert_eq!(got, vec!["first:John".to_string(), "second:John".to_string()], "{}", ct);
    }

    harness.stop().await;
}

#[tokio::test]
async fn test_subscriber_failure_is_reported() {
    let seen: Seen = Arc::default();
    let harness = Harness::start_with(
        |opts| opts,
        |server| {
            server.subscribe(recording("alerts", &seen, "ok")).unwrap();
            server
                .subscribe(Subscriber::new("alerts", |_ctx: Context, _req: HelloRequest| async {
                    Err(RpcError::Internal("disk full".into()))
                }))
                .unwrap();
        },
    )
    .await;
    let client = harness.client();

    let msg = client.new_publication("alerts", HelloRequest { name: "x".into() });
    let err = client.publish(&Context::background(), &msg).await.unwrap_err();
    assert!(err.to_string().contains("disk full"), "{}", err);
    // The healthy subscriber still ran.
    assert_eq!(seen.lock().as_slice(), &["ok:x".to_string()]);

    harness.stop().await;
}

#[tokio::test]
async fn test_subscriber_wrappers_see_events() {
    let topics: Seen = Arc::default();
    let seen: Seen = Arc::default();
    let wrapper: SubscriberWrapper = {
        let topics = Arc::clone(&topics);
        Arc::new(move |next: SubscriberFunc| -> SubscriberFunc {
            let topics = Arc::clone(&topics);
            Arc::new(move |ctx: Context, event: Event| {
                topics.lock().push(event.topic().to_string());
                next(ctx, event)
            })
        })
    };
    let harness = Harness::start_with(
        |opts| opts.wrap_subscriber(wrapper),
        |server| {
            server.subscribe(recording("greetings", &seen, "s")).unwrap();
        },
    )
    .await;
    let client = harness.client();

    let msg = client.new_publication("greetings", HelloRequest { name: "Jane".into() });
    client.publish(&Context::background(), &msg).await.unwrap();
    assert_eq!(topics.lock().as_slice(), &["greetings".to_string()]);
    assert_eq!(seen.lock().as_slice(), &["s:Jane".to_string()]);

    harness.stop().await;
}

#[tokio::test]
async fn test_publish_without_broker() {
    let client = Client::new(ClientOptions::default());
    let msg = client.new_publication("greetings", HelloRequest { name: "x".into() });
    let err = client.publish(&Context::background(), &msg).await.unwrap_err();
    assert!(matches!(err, RpcError::Internal(_)), "{:?}", err);
}

#[tokio::test]
async fn test_stop_unsubscribes() {
    let seen: Seen = Arc::default();
    let harness = Harness::start_with(
        |opts| opts,
        |server| {
            server.subscribe(recording("greetings", &seen, "s")).unwrap();
        },
    )
    .await;
    let broker = Arc::clone(&harness.broker);
    assert_eq!(broker.subscriber_count("greetings"), 1);

    harness.stop().await;
    assert_eq!(broker.subscriber_count("greetings"), 0);
}
