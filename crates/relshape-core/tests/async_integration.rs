//! Integration tests for asynchronous enumeration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{blog_query, compiler, populate, store, BlogQuery};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use relshape_core::{
    CancellationSource, EnumeratorState, Error, InMemoryStore, Materialized, QueryContext,
    QueryOptions, RecordingDiagnostics, RetryPolicy, RetryingExecutionStrategy,
};

fn to_json(results: &[Materialized]) -> serde_json::Value {
    serde_json::Value::Array(results.iter().map(Materialized::to_json).collect())
}

fn context() -> QueryContext {
    QueryContext::new("BloggingContext")
}

#[tokio::test]
async fn test_async_matches_blocking() {
    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let store = store();
        let compiled = compiler(&store, options)
            .compile(blog_query(BlogQuery::with_comments()))
            .unwrap();
        let blocking = compiled.to_list(context()).unwrap();
        let asynchronous = compiled.to_list_async(context()).await.unwrap();
        assert_eq!(to_json(&asynchronous), to_json(&blocking));
        assert_eq!(store.open_readers(), 0);
    }
}

#[tokio::test]
async fn test_stream_yields_every_element() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();

    let names: Vec<String> = compiled
        .enumerate_async(context())
        .into_stream()
        .map(|result| {
            let blog = result.unwrap();
            blog.as_entity().unwrap().field("Name").unwrap().as_str().unwrap().to_string()
        })
        .collect()
        .await;
    assert_eq!(names, vec!["one", "two", "three"]);
    assert_eq!(store.open_readers(), 0);
}

#[tokio::test]
async fn test_stream_ends_after_failure() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().compensate_converted_bools(false))
        .compile(blog_query(BlogQuery::blogs().active_only()))
        .unwrap();
    let results: Vec<_> = compiled.enumerate_async(context()).into_stream().collect().await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(Error::InvalidExpression(_))));
}

#[tokio::test]
async fn test_overlapping_pulls_on_one_context_are_rejected() {
    let store = populate(InMemoryStore::new().with_read_latency(Duration::from_millis(20)));
    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let context = context().with_diagnostics(diagnostics.clone());
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();

    let mut first = compiled.enumerate_async(context.clone());
    let mut second = compiled.enumerate_async(context.clone());
    let (a, b) = tokio::join!(first.move_next(), second.move_next());

    assert!(a.unwrap().is_some());
    assert_eq!(b, Err(Error::ConcurrencyViolation));
    assert_eq!(second.state(), EnumeratorState::Faulted);
    assert_eq!(
        diagnostics.events(),
        vec![("BloggingContext".to_string(), Error::ConcurrencyViolation)]
    );

    // sequential pulls on the same context are fine
    assert!(first.move_next().await.unwrap().is_some());
    assert!(!context.detector().is_in_use());
}

#[tokio::test]
async fn test_cancellation() {
    let store = populate(InMemoryStore::new().with_read_latency(Duration::from_millis(5)));
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();

    let source = CancellationSource::new();
    source.cancel();
    let mut cancelled = compiled.enumerate_async(context().with_cancellation(source.signal()));
    assert_eq!(cancelled.move_next().await, Err(Error::Cancelled));
    assert_eq!(cancelled.state(), EnumeratorState::Faulted);
    assert_eq!(store.readers_opened(), 0);

    let source = CancellationSource::new();
    let mut enumerator = compiled.enumerate_async(context().with_cancellation(source.signal()));
    assert!(enumerator.move_next().await.unwrap().is_some());
    source.cancel();
    assert_eq!(enumerator.move_next().await, Err(Error::Cancelled));
    drop(enumerator);
    assert_eq!(store.open_readers(), 0);
}

#[tokio::test]
async fn test_cancellation_interrupts_pending_read() {
    let store = populate(InMemoryStore::new().with_read_latency(Duration::from_secs(60)));
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();

    let source = CancellationSource::new();
    let mut enumerator = compiled.enumerate_async(context().with_cancellation(source.signal()));
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();
    };
    let (result, ()) = tokio::join!(enumerator.move_next(), cancel);
    assert_eq!(result, Err(Error::Cancelled));
}

#[tokio::test]
async fn test_async_retry() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();
    let policy = RetryPolicy::with_max_retries(2)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(2));

    store.fail_next_opens(2);
    let context = context().with_strategy(Arc::new(RetryingExecutionStrategy::new(policy.clone())));
    assert_eq!(compiled.to_list_async(context).await.unwrap().len(), 3);

    store.fail_next_opens(3);
    let context = QueryContext::new("BloggingContext")
        .with_strategy(Arc::new(RetryingExecutionStrategy::new(policy)));
    assert!(compiled.to_list_async(context).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_dispose_async() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();
    let mut enumerator = compiled.enumerate_async(context());
    assert!(enumerator.move_next().await.unwrap().is_some());
    enumerator.dispose_async().await;
    enumerator.dispose_async().await;
    assert_eq!(enumerator.state(), EnumeratorState::Disposed);
    assert_eq!(enumerator.move_next().await, Err(Error::Disposed));
    assert!(matches!(enumerator.reset(), Err(Error::Unsupported(_))));
    assert_eq!(store.readers_opened(), 2);
    assert_eq!(store.open_readers(), 0);
}
