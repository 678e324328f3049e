//! Relshape Benchmark Suite
//!
//! Fixtures for the Criterion benchmarks in `benches/`.
//!
//! # Benchmark Categories
//!
//! - **Compile**: rewrite passes and shaper compilation
//! - **Enumerate**: single versus split collection loading, blocking and async

use std::sync::Arc;

use relshape_core::{InMemoryStore, MemoryCommandFactory, QueryCompiler, QueryOptions, Result};
use relshape_ir::{
    DomainType, EntityShaper, NavigationShaper, PendingCollection, PropertyShaper, SelectExpr,
    ShapedQuery, ShaperExpr, TableRef, TypeMapping, Value, ValueConverter,
};
use tracing::debug;

/// Scale factor for fixture generation.
#[derive(Clone, Copy, Debug, Default)]
pub enum Scale {
    /// 10 blogs with 2 posts each.
    Tiny,
    #[default]
    Small,
    Medium,
}

impl Scale {
    pub fn blogs(&self) -> usize {
        match self {
            Scale::Tiny => 10,
            Scale::Small => 100,
            Scale::Medium => 1_000,
        }
    }

    pub fn posts_per_blog(&self) -> usize {
        match self {
            Scale::Tiny => 2,
            Scale::Small => 5,
            Scale::Medium => 10,
        }
    }
}

/// Store with blogs and posts at the given scale. Generation is deterministic.
pub fn blog_store(scale: Scale) -> Result<Arc<InMemoryStore>> {
    let store = InMemoryStore::new();
    store.create_table("Blogs", &["Id", "Name", "IsActive"]);
    store.create_table("Posts", &["Id", "BlogId", "Title"]);

    let mut post_id = 0i32;
    for blog in 0..scale.blogs() as i32 {
        let active = if blog % 3 == 0 { "N" } else { "Y" };
        store.insert(
            "Blogs",
            vec![Value::Int32(blog), format!("blog-{blog}").into(), active.into()],
        )?;
        for n in 0..scale.posts_per_blog() {
            post_id += 1;
            store.insert(
                "Posts",
                vec![Value::Int32(post_id), Value::Int32(blog), format!("post-{n:03}").into()],
            )?;
        }
    }
    debug!(blogs = scale.blogs(), posts = post_id, "generated blog store");
    Ok(Arc::new(store))
}

/// Active blogs with their posts, filtered on a converted boolean column.
pub fn blogs_with_posts() -> ShapedQuery {
    let int = Some(TypeMapping::new("int", DomainType::Int32));
    let text = Some(TypeMapping::new("text", DomainType::String));
    let yes_no = Some(TypeMapping::converted("char(1)", ValueConverter::yes_no()));

    let blogs = TableRef::new("Blogs", "b");
    let posts = TableRef::new("Posts", "p");
    let inner = SelectExpr::from_table(posts.clone())
        .project("Id", posts.column("Id", int.clone(), false))
        .project("Title", posts.column("Title", text.clone(), true))
        .order_by(posts.column("Title", text.clone(), true), true);
    let post = EntityShaper {
        entity_type: "Post".into(),
        key: vec![0],
        properties: vec![
            PropertyShaper { name: "Id".into(), index: 0, nullable: false },
            PropertyShaper { name: "Title".into(), index: 1, nullable: true },
        ],
        navigations: vec![],
        nullable: false,
    };
    let root = SelectExpr::from_table(blogs.clone())
        .project("Id", blogs.column("Id", int.clone(), false))
        .project("Name", blogs.column("Name", text, true))
        .filter(blogs.column("IsActive", yes_no, false));
    let blog = EntityShaper {
        entity_type: "Blog".into(),
        key: vec![0],
        properties: vec![
            PropertyShaper { name: "Id".into(), index: 0, nullable: false },
            PropertyShaper { name: "Name".into(), index: 1, nullable: true },
        ],
        navigations: vec![NavigationShaper {
            name: "Posts".into(),
            target: ShaperExpr::PendingCollection(PendingCollection {
                navigation: Some("Posts".into()),
                element_type: "Post".into(),
                parent_identifier: vec![0],
                outer_key: vec![0],
                inner: Box::new(ShapedQuery::new(inner, post.into())),
                inner_key: vec![posts.column("BlogId", int, false)],
                inner_identifier: vec![0],
            }),
        }],
        nullable: false,
    };
    ShapedQuery::new(root, blog.into())
}

pub fn compiler(store: &Arc<InMemoryStore>, options: QueryOptions) -> QueryCompiler {
    QueryCompiler::new(Arc::new(MemoryCommandFactory::new(Arc::clone(store))), options)
}
