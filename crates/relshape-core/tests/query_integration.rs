//! Integration tests for blocking enumeration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{blog_query, compiler, init_tracing, int, populate, store, text, yes_no, BlogQuery};
use pretty_assertions::assert_eq;
use relshape_core::ir::{
    EntityShaper, JoinExpr, NavigationShaper, PropertyShaper, SelectExpr, ShapedQuery, ShaperExpr,
    SqlExpr, TableRef, Value,
};
use relshape_core::{
    EnumeratorState, Error, InMemoryStateManager, InMemoryStore, Materialized, NoRetryStrategy,
    ParameterValues, QueryContext, QueryOptions, QueryTrackingBehavior, RecordingDiagnostics,
    RetryPolicy, RetryingExecutionStrategy,
};
use serde::Deserialize;
use serde_json::json;

fn to_json(results: &[Materialized]) -> serde_json::Value {
    serde_json::Value::Array(results.iter().map(Materialized::to_json).collect())
}

fn context() -> QueryContext {
    QueryContext::new("BloggingContext")
}

fn blogs_with_posts_json() -> serde_json::Value {
    json!([
        {"Id": 1, "Name": "one", "IsActive": true, "Posts": [
            {"Id": 10, "Title": "a"}, {"Id": 11, "Title": "b"}
        ]},
        {"Id": 2, "Name": "two", "IsActive": false, "Posts": [
            {"Id": 20, "Title": "c"}
        ]},
        {"Id": 3, "Name": "three", "IsActive": true, "Posts": [
            {"Id": 30, "Title": "d"}, {"Id": 31, "Title": "e"}, {"Id": 32, "Title": "f"}
        ]},
    ])
}

#[test]
fn test_single_query_loads_collections() {
    init_tracing();
    let store = store();
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();

    let results = compiled.to_list(context()).unwrap();
    assert_eq!(to_json(&results), blogs_with_posts_json());
    assert_eq!(store.readers_opened(), 1);
    assert_eq!(store.open_readers(), 0);
}

#[test]
fn test_split_query_matches_single_query() {
    let store = store();
    let single = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap()
        .to_list(context())
        .unwrap();

    let split_store = common::store();
    let compiled = compiler(&split_store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();
    assert!(compiled.loader().is_split());
    let split = compiled.to_list(context()).unwrap();

    assert_eq!(to_json(&split), to_json(&single));
    assert_eq!(to_json(&split), blogs_with_posts_json());
    // primary reader plus one reader for the posts query
    assert_eq!(split_store.readers_opened(), 2);
    assert_eq!(split_store.open_readers(), 0);
}

#[test]
fn test_nested_collections() {
    let expected = json!([
        {"Id": 1, "Name": "one", "IsActive": true, "Posts": [
            {"Id": 10, "Title": "a", "Comments": [
                {"Id": 100, "Text": "first"}, {"Id": 101, "Text": "second"}
            ]},
            {"Id": 11, "Title": "b", "Comments": []}
        ]},
        {"Id": 2, "Name": "two", "IsActive": false, "Posts": [
            {"Id": 20, "Title": "c", "Comments": []}
        ]},
        {"Id": 3, "Name": "three", "IsActive": true, "Posts": [
            {"Id": 30, "Title": "d", "Comments": [{"Id": 300, "Text": "only"}]},
            {"Id": 31, "Title": "e", "Comments": []},
            {"Id": 32, "Title": "f", "Comments": []}
        ]},
    ]);

    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let store = store();
        let results = compiler(&store, options.clone())
            .compile(blog_query(BlogQuery::with_comments()))
            .unwrap()
            .to_list(context())
            .unwrap();
        assert_eq!(to_json(&results), expected, "split = {}", options.is_split());
        assert_eq!(store.open_readers(), 0);
    }
}

#[test]
fn test_converted_bool_predicate_is_compensated() {
    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let store = store();
        let compiled = compiler(&store, options)
            .compile(blog_query(BlogQuery::with_posts().active_only()))
            .unwrap();
        let text = compiled.command_text(&ParameterValues::new()).unwrap();
        assert!(text.contains("WHERE b.IsActive = TRUE"), "{text}");

        let results = compiled.to_list(context()).unwrap();
        let ids: Vec<Value> = results
            .iter()
            .map(|r| r.as_entity().unwrap().field("Id").unwrap().clone())
            .collect();
        assert_eq!(ids, vec![Value::Int32(1), Value::Int32(3)]);
        let posts = results[1].as_entity().unwrap().navigation("Posts").unwrap();
        assert_eq!(posts.as_collection().unwrap().len(), 3);
    }
}

#[test]
fn test_uncompensated_converted_bool_faults() {
    let store = store();
    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let compiled = compiler(&store, QueryOptions::default().compensate_converted_bools(false))
        .compile(blog_query(BlogQuery::blogs().active_only()))
        .unwrap();

    let mut enumerator = compiled.enumerate(context().with_diagnostics(diagnostics.clone()));
    assert!(matches!(enumerator.move_next(), Err(Error::InvalidExpression(_))));
    assert_eq!(enumerator.state(), EnumeratorState::Faulted);
    assert_eq!(diagnostics.len(), 1);
}

#[test]
fn test_paginated_collection() {
    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let store = store();
        let results = compiler(&store, options)
            .compile(blog_query(BlogQuery::with_posts().post_limit(2)))
            .unwrap()
            .to_list(context())
            .unwrap();
        let titles: Vec<Vec<String>> = results
            .iter()
            .map(|blog| {
                blog.as_entity()
                    .unwrap()
                    .navigation("Posts")
                    .unwrap()
                    .as_collection()
                    .unwrap()
                    .iter()
                    .map(|p| {
                        let title = p.as_entity().unwrap().field("Title").unwrap();
                        title.as_str().unwrap().to_string()
                    })
                    .collect()
            })
            .collect();
        assert_eq!(titles, vec![vec!["a", "b"], vec!["c"], vec!["d", "e"]]);
    }
}

fn blog_and_post_ids(results: &[Materialized]) -> Vec<(i64, Vec<i64>)> {
    to_json(results)
        .as_array()
        .unwrap()
        .iter()
        .map(|blog| {
            let posts = blog["Posts"].as_array().unwrap();
            (
                blog["Id"].as_i64().unwrap(),
                posts.iter().map(|p| p["Id"].as_i64().unwrap()).collect(),
            )
        })
        .collect()
}

#[test]
fn test_offset_root_loads_collections_in_both_modes() {
    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let mut shaped = blog_query(BlogQuery::with_posts());
        let id = shaped.query.projections[0].expr.clone();
        shaped.query = shaped.query.order_by(id, false).with_offset(SqlExpr::constant(1));

        let store = store();
        let compiled = compiler(&store, options).compile(shaped).unwrap();
        assert_eq!(compiled.query().query.nesting_depth(), 1);
        let results = compiled.to_list(context()).unwrap();
        assert_eq!(blog_and_post_ids(&results), vec![(2, vec![20]), (1, vec![10, 11])]);
        assert_eq!(store.open_readers(), 0);
    }
}

#[test]
fn test_limited_root_loads_collections_in_both_modes() {
    for options in [QueryOptions::default(), QueryOptions::default().split_query()] {
        let mut shaped = blog_query(BlogQuery::with_posts());
        let id = shaped.query.projections[0].expr.clone();
        shaped.query = shaped.query.order_by(id, true).with_limit(SqlExpr::constant(2));

        let store = store();
        let results =
            compiler(&store, options).compile(shaped).unwrap().to_list(context()).unwrap();
        assert_eq!(blog_and_post_ids(&results), vec![(1, vec![10, 11]), (2, vec![20])]);
    }
}

#[test]
fn test_decode_failure_faults_once() {
    let store = InMemoryStore::new();
    store.create_table("Blogs", &["Id", "Name", "IsActive"]);
    store.insert("Blogs", vec![Value::Int32(1), "one".into(), "Y".into()]).unwrap();
    store.insert("Blogs", vec![Value::Int32(2), "two".into(), "X".into()]).unwrap();
    store.insert("Blogs", vec![Value::Int32(3), "three".into(), "N".into()]).unwrap();
    let store = Arc::new(store);

    let diagnostics = Arc::new(RecordingDiagnostics::new());
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();
    let mut enumerator = compiled.enumerate(context().with_diagnostics(diagnostics.clone()));

    assert!(enumerator.move_next().unwrap().is_some());
    let error = enumerator.move_next().unwrap_err();
    assert!(matches!(error, Error::Decode { ordinal: 2, .. }), "{error}");
    assert_eq!(enumerator.state(), EnumeratorState::Faulted);
    assert_eq!(enumerator.move_next(), Err(Error::Faulted));

    let events = diagnostics.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], ("BloggingContext".to_string(), error));

    drop(enumerator);
    assert_eq!(store.open_readers(), 0);
}

#[test]
fn test_dispose_is_idempotent() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();

    let mut enumerator = compiled.enumerate(context());
    assert!(enumerator.move_next().unwrap().is_some());
    assert_eq!(store.open_readers(), 2);
    enumerator.dispose();
    enumerator.dispose();
    assert_eq!(enumerator.state(), EnumeratorState::Disposed);
    assert_eq!(enumerator.move_next(), Err(Error::Disposed));
    assert_eq!(enumerator.next(), None);
    drop(enumerator);
    assert_eq!(store.readers_opened(), 2);
    assert_eq!(store.readers_closed(), 2);

    let mut untouched = compiled.enumerate(context());
    untouched.dispose();
    assert_eq!(store.readers_opened(), 2);
}

#[test]
fn test_drop_releases_readers() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_comments()))
        .unwrap();
    {
        let mut enumerator = compiled.enumerate(context());
        assert!(enumerator.move_next().unwrap().is_some());
        assert_eq!(store.open_readers(), 3);
    }
    assert_eq!(store.open_readers(), 0);
}

#[test]
fn test_exhausted_enumerator_keeps_returning_none() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();
    let mut enumerator = compiled.enumerate(context());
    for _ in 0..3 {
        assert!(enumerator.move_next().unwrap().is_some());
    }
    assert_eq!(enumerator.move_next(), Ok(None));
    assert_eq!(enumerator.state(), EnumeratorState::Exhausted);
    assert_eq!(enumerator.move_next(), Ok(None));
}

#[test]
fn test_reset_is_unsupported() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();
    let mut enumerator = compiled.enumerate(context());
    assert!(matches!(enumerator.reset(), Err(Error::Unsupported(_))));
    assert_eq!(enumerator.state(), EnumeratorState::Created);
}

#[test]
fn test_concurrent_pull_is_detected() {
    let store = store();
    let context = context();
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();

    let guard = context.detector().enter().unwrap();
    let mut enumerator = compiled.enumerate(context.clone());
    assert_eq!(enumerator.move_next(), Err(Error::ConcurrencyViolation));
    assert_eq!(enumerator.state(), EnumeratorState::Faulted);
    drop(guard);
    assert!(!context.detector().is_in_use());

    let unchecked = compiler(&store, QueryOptions::default().detect_concurrent_access(false))
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap();
    let _guard = context.detector().enter().unwrap();
    assert_eq!(unchecked.to_list(context.clone()).unwrap().len(), 3);
}

#[test]
fn test_interleaved_enumerations_on_one_context() {
    let store = store();
    let context = context();
    let compiled = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();

    let mut first = compiled.enumerate(context.clone());
    let mut second = compiled.enumerate(context.clone());
    assert!(first.move_next().unwrap().is_some());
    assert!(second.move_next().unwrap().is_some());
    assert!(first.move_next().unwrap().is_some());
    assert!(!context.detector().is_in_use());
}

#[test]
fn test_transient_open_failures_are_retried() {
    let store = store();
    let compiled = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();
    let policy = RetryPolicy::with_max_retries(3)
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(2));

    store.fail_next_opens(2);
    let retrying = context().with_strategy(Arc::new(RetryingExecutionStrategy::new(policy)));
    assert_eq!(to_json(&compiled.to_list(retrying).unwrap()), blogs_with_posts_json());
    // two failures, then the primary and the posts reader
    assert_eq!(store.executions(), 4);

    store.fail_next_opens(1);
    let no_retry = context().with_strategy(Arc::new(NoRetryStrategy));
    let error = compiled.to_list(no_retry).unwrap_err();
    assert!(error.is_transient());
    assert_eq!(store.open_readers(), 0);
}

#[test]
fn test_parameters_are_bound_per_execution() {
    let store = store();
    let blogs = TableRef::new("Blogs", "b");
    let query = SelectExpr::from_table(blogs.clone())
        .project("Id", blogs.column("Id", int(), false))
        .filter(SqlExpr::equal(blogs.column("Name", text(), true), SqlExpr::parameter("name")));
    let compiled = compiler(&store, QueryOptions::default())
        .compile(ShapedQuery::new(query, ShaperExpr::scalar(0)))
        .unwrap();

    let parameters = ParameterValues::new().with("name", "three");
    assert!(compiled.command_text(&parameters).unwrap().contains("@name"));
    let results = compiled.to_list(context().with_parameters(parameters)).unwrap();
    assert_eq!(results, vec![Materialized::Scalar(Value::Int32(3))]);

    let none = compiled
        .to_list(context().with_parameters(ParameterValues::new().with("name", Value::Null)))
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_fingerprint_follows_query_text() {
    let store = store();
    let single = compiler(&store, QueryOptions::default());
    let a = single.compile(blog_query(BlogQuery::with_posts())).unwrap();
    let b = single.compile(blog_query(BlogQuery::with_posts())).unwrap();
    let split = compiler(&store, QueryOptions::default().split_query())
        .compile(blog_query(BlogQuery::with_posts()))
        .unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), split.fingerprint());
    assert_eq!(a.fingerprint().len(), 32);
}

#[test]
fn test_record_projection_deserializes() {
    #[derive(Debug, PartialEq, Deserialize)]
    struct Post {
        #[serde(rename = "Id")]
        id: i32,
        #[serde(rename = "Title")]
        title: String,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct BlogSummary {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Posts")]
        posts: Vec<Post>,
    }

    let store = store();
    let shaped = blog_query(BlogQuery::with_posts());
    let ShaperExpr::Entity(entity) = shaped.shaper.clone() else {
        panic!("entity shaper expected");
    };
    let posts = entity.navigations[0].target.clone();
    let record = ShapedQuery::new(
        shaped.query,
        ShaperExpr::record(vec![("Name", ShaperExpr::scalar(1)), ("Posts", posts)]),
    );

    let results = compiler(&store, QueryOptions::default().split_query())
        .compile(record)
        .unwrap()
        .to_list(context())
        .unwrap();
    let summaries: Vec<BlogSummary> = results.iter().map(|r| r.deserialize().unwrap()).collect();
    assert_eq!(summaries.len(), 3);
    assert_eq!(summaries[0].name, "one");
    assert_eq!(
        summaries[2].posts,
        vec![
            Post { id: 30, title: "d".into() },
            Post { id: 31, title: "e".into() },
            Post { id: 32, title: "f".into() },
        ]
    );
}

/// Posts with a reference to their blog; posts 10 and 11 share blog 1.
fn posts_with_blog() -> ShapedQuery {
    let posts = TableRef::new("Posts", "p");
    let blogs = TableRef::new("Blogs", "b");
    let query = SelectExpr::from_table(posts.clone())
        .join(JoinExpr::Inner {
            table: Box::new(blogs.clone().into()),
            predicate: SqlExpr::equal(
                posts.column("BlogId", int(), false),
                blogs.column("Id", int(), false),
            ),
        })
        .project("Id", posts.column("Id", int(), false))
        .project("BlogId", blogs.column("Id", int(), false))
        .project("IsActive", blogs.column("IsActive", yes_no(), false))
        .order_by(posts.column("Id", int(), false), true);
    let blog = EntityShaper {
        entity_type: "Blog".into(),
        key: vec![1],
        properties: vec![
            PropertyShaper { name: "Id".into(), index: 1, nullable: false },
            PropertyShaper { name: "IsActive".into(), index: 2, nullable: false },
        ],
        navigations: vec![],
        nullable: true,
    };
    let post = EntityShaper {
        entity_type: "Post".into(),
        key: vec![0],
        properties: vec![PropertyShaper { name: "Id".into(), index: 0, nullable: false }],
        navigations: vec![NavigationShaper {
            name: "Blog".into(),
            target: blog.into(),
        }],
        nullable: false,
    };
    ShapedQuery::new(query, post.into())
}

fn blog_of(result: &Materialized) -> relshape_core::EntityRef {
    match result.as_entity().unwrap().navigation("Blog").unwrap() {
        Materialized::Entity(blog) => blog,
        other => panic!("expected blog entity, got {other:?}"),
    }
}

#[test]
fn test_tracking_behaviors() {
    let store = store();
    let compile = |tracking| {
        compiler(&store, QueryOptions::default().tracking(tracking))
            .compile(posts_with_blog())
            .unwrap()
    };

    let untracked = compile(QueryTrackingBehavior::NoTracking).to_list(context()).unwrap();
    assert!(!relshape_core::EntityRef::ptr_eq(&blog_of(&untracked[0]), &blog_of(&untracked[1])));
    assert_eq!(blog_of(&untracked[0]), blog_of(&untracked[1]));

    let resolved = compile(QueryTrackingBehavior::NoTrackingWithIdentityResolution)
        .to_list(context())
        .unwrap();
    assert!(relshape_core::EntityRef::ptr_eq(&blog_of(&resolved[0]), &blog_of(&resolved[1])));

    let manager = Arc::new(InMemoryStateManager::new());
    let tracked_context = context().with_state_manager(manager.clone());
    let tracked = compile(QueryTrackingBehavior::TrackAll);
    let first = tracked.to_list(tracked_context.clone()).unwrap();
    let second = tracked.to_list(tracked_context).unwrap();
    assert!(relshape_core::EntityRef::ptr_eq(&blog_of(&first[0]), &blog_of(&first[1])));
    assert!(relshape_core::EntityRef::ptr_eq(
        first[0].as_entity().unwrap(),
        second[0].as_entity().unwrap()
    ));
    // six posts and three blogs
    assert_eq!(manager.tracked_count(), 9);
    assert_eq!(manager.initializations(), 2);
}

#[test]
fn test_read_latency_does_not_affect_blocking_reads() {
    let store = populate(InMemoryStore::new().with_read_latency(Duration::from_secs(60)));
    let results = compiler(&store, QueryOptions::default())
        .compile(blog_query(BlogQuery::blogs()))
        .unwrap()
        .to_list(context())
        .unwrap();
    assert_eq!(results.len(), 3);
}
