//! Blogging fixture shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use relshape_core::ir::{
    DomainType, EntityShaper, NavigationShaper, PendingCollection, PropertyShaper, SelectExpr,
    ShapedQuery, ShaperExpr, SqlExpr, TableRef, TypeMapping, Value, ValueConverter,
};
use relshape_core::{InMemoryStore, MemoryCommandFactory, QueryCompiler, QueryOptions};

/// What to include in the blog query.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlogQuery {
    pub posts: bool,
    pub comments: bool,
    /// Filter on the converted `IsActive` column in predicate position.
    pub active_only: bool,
    pub post_limit: Option<i32>,
}

impl BlogQuery {
    pub fn blogs() -> Self {
        Self::default()
    }

    pub fn with_posts() -> Self {
        Self {
            posts: true,
            ..Self::default()
        }
    }

    pub fn with_comments() -> Self {
        Self {
            posts: true,
            comments: true,
            ..Self::default()
        }
    }

    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn post_limit(mut self, limit: i32) -> Self {
        self.post_limit = Some(limit);
        self
    }
}

pub fn int() -> Option<TypeMapping> {
    Some(TypeMapping::new("int", DomainType::Int32))
}

pub fn text() -> Option<TypeMapping> {
    Some(TypeMapping::new("text", DomainType::String))
}

pub fn yes_no() -> Option<TypeMapping> {
    Some(TypeMapping::converted("char(1)", ValueConverter::yes_no()))
}

fn property(name: &str, index: usize, nullable: bool) -> PropertyShaper {
    PropertyShaper {
        name: name.into(),
        index,
        nullable,
    }
}

/// Blogs 1..=3 with posts `[1, 1, 2, 3, 3, 3]` by blog, and comments on posts 10 and 30.
pub fn store() -> Arc<InMemoryStore> {
    populate(InMemoryStore::new())
}

pub fn populate(store: InMemoryStore) -> Arc<InMemoryStore> {
    store.create_table("Blogs", &["Id", "Name", "IsActive"]);
    store.create_table("Posts", &["Id", "BlogId", "Title"]);
    store.create_table("Comments", &["Id", "PostId", "Text"]);
    for (id, name, active) in [(1, "one", "Y"), (2, "two", "N"), (3, "three", "Y")] {
        store
            .insert("Blogs", vec![Value::Int32(id), name.into(), active.into()])
            .unwrap();
    }
    // deliberately out of order
    for (id, blog, title) in
        [(31, 3, "e"), (10, 1, "a"), (20, 2, "c"), (32, 3, "f"), (11, 1, "b"), (30, 3, "d")]
    {
        store
            .insert("Posts", vec![Value::Int32(id), Value::Int32(blog), title.into()])
            .unwrap();
    }
    for (id, post, body) in [(101, 10, "second"), (300, 30, "only"), (100, 10, "first")] {
        store
            .insert("Comments", vec![Value::Int32(id), Value::Int32(post), body.into()])
            .unwrap();
    }
    Arc::new(store)
}

fn comments_collection() -> PendingCollection {
    let comments = TableRef::new("Comments", "c");
    let inner = SelectExpr::from_table(comments.clone())
        .project("Id", comments.column("Id", int(), false))
        .project("Text", comments.column("Text", text(), true));
    let shaper = EntityShaper {
        entity_type: "Comment".into(),
        key: vec![0],
        properties: vec![property("Id", 0, false), property("Text", 1, true)],
        navigations: vec![],
        nullable: false,
    };
    PendingCollection {
        navigation: Some("Comments".into()),
        element_type: "Comment".into(),
        parent_identifier: vec![0],
        outer_key: vec![0],
        inner: Box::new(ShapedQuery::new(inner, shaper.into())),
        inner_key: vec![comments.column("PostId", int(), false)],
        inner_identifier: vec![0],
    }
}

fn posts_collection(shape: BlogQuery) -> PendingCollection {
    let posts = TableRef::new("Posts", "p");
    let mut inner = SelectExpr::from_table(posts.clone())
        .project("Id", posts.column("Id", int(), false))
        .project("Title", posts.column("Title", text(), true))
        .order_by(posts.column("Title", text(), true), true);
    if let Some(limit) = shape.post_limit {
        inner = inner.with_limit(SqlExpr::constant(limit));
    }
    let mut navigations = Vec::new();
    if shape.comments {
        navigations.push(NavigationShaper {
            name: "Comments".into(),
            target: ShaperExpr::PendingCollection(comments_collection()),
        });
    }
    let shaper = EntityShaper {
        entity_type: "Post".into(),
        key: vec![0],
        properties: vec![property("Id", 0, false), property("Title", 1, true)],
        navigations,
        nullable: false,
    };
    PendingCollection {
        navigation: Some("Posts".into()),
        element_type: "Post".into(),
        parent_identifier: vec![0],
        outer_key: vec![0],
        inner: Box::new(ShapedQuery::new(inner, shaper.into())),
        inner_key: vec![posts.column("BlogId", int(), false)],
        inner_identifier: vec![0],
    }
}

/// The blog query described by `shape`.
pub fn blog_query(shape: BlogQuery) -> ShapedQuery {
    let blogs = TableRef::new("Blogs", "b");
    let mut root = SelectExpr::from_table(blogs.clone())
        .project("Id", blogs.column("Id", int(), false))
        .project("Name", blogs.column("Name", text(), true))
        .project("IsActive", blogs.column("IsActive", yes_no(), false));
    if shape.active_only {
        root = root.filter(blogs.column("IsActive", yes_no(), false));
    }
    let mut navigations = Vec::new();
    if shape.posts {
        navigations.push(NavigationShaper {
            name: "Posts".into(),
            target: ShaperExpr::PendingCollection(posts_collection(shape)),
        });
    }
    let shaper = EntityShaper {
        entity_type: "Blog".into(),
        key: vec![0],
        properties: vec![
            property("Id", 0, false),
            property("Name", 1, true),
            property("IsActive", 2, false),
        ],
        navigations,
        nullable: false,
    };
    ShapedQuery::new(root, shaper.into())
}

pub fn compiler(store: &Arc<InMemoryStore>, options: QueryOptions) -> QueryCompiler {
    QueryCompiler::new(Arc::new(MemoryCommandFactory::new(Arc::clone(store))), options)
}

/// Install a test subscriber once; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
