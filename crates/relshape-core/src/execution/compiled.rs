//! Query compilation.
//!
//! [`QueryCompiler::compile`] finalizes a shaped query through the rewrite
//! pipeline, compiles its shaper and sets up command caches for the primary
//! query and every split collection query. The resulting [`CompiledQuery`]
//! is read-only and shared by any number of concurrent enumerations.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use relshape_ir::ShapedQuery;
use tracing::{info, instrument};

use super::async_enumerator::AsyncQueryEnumerator;
use super::cache::RelationalCommandCache;
use super::command::{ParameterValues, RelationalCommandFactory};
use super::context::QueryContext;
use super::enumerator::QueryEnumerator;
use crate::config::QueryOptions;
use crate::error::Result;
use crate::rewrite::QueryPostprocessor;
use crate::shaper::{Materialized, RelatedDataLoader, RowShaper, ShaperCompiler};

/// A finalized query with its compiled shaping procedures.
#[derive(Debug)]
pub struct CompiledQuery {
    query: ShapedQuery,
    options: QueryOptions,
    command_cache: RelationalCommandCache,
    shaper: RowShaper,
    loader: RelatedDataLoader,
    fingerprint: String,
}

impl CompiledQuery {
    /// Start a blocking enumeration.
    pub fn enumerate(self: &Arc<Self>, context: QueryContext) -> QueryEnumerator {
        QueryEnumerator::new(Arc::clone(self), context)
    }

    /// Start an asynchronous enumeration.
    pub fn enumerate_async(self: &Arc<Self>, context: QueryContext) -> AsyncQueryEnumerator {
        AsyncQueryEnumerator::new(Arc::clone(self), context)
    }

    /// Enumerate every result.
    pub fn to_list(self: &Arc<Self>, context: QueryContext) -> Result<Vec<Materialized>> {
        self.enumerate(context).collect()
    }

    /// Enumerate every result asynchronously.
    pub async fn to_list_async(
        self: &Arc<Self>,
        context: QueryContext,
    ) -> Result<Vec<Materialized>> {
        let results: Vec<Result<Materialized>> =
            self.enumerate_async(context).into_stream().collect().await;
        results.into_iter().collect()
    }

    /// The finalized query.
    pub fn query(&self) -> &ShapedQuery {
        &self.query
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Text of the primary command for the given parameters.
    pub fn command_text(&self, parameters: &ParameterValues) -> Result<String> {
        Ok(self.command_cache.get(parameters)?.command_text().to_string())
    }

    /// Stable hex digest of the finalized query text.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn command_cache(&self) -> &RelationalCommandCache {
        &self.command_cache
    }

    pub fn shaper(&self) -> &RowShaper {
        &self.shaper
    }

    pub fn loader(&self) -> &RelatedDataLoader {
        &self.loader
    }
}

/// Compiles shaped queries against a command factory.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    factory: Arc<dyn RelationalCommandFactory>,
    options: QueryOptions,
}

impl QueryCompiler {
    /// Create a new compiler.
    pub fn new(factory: Arc<dyn RelationalCommandFactory>, options: QueryOptions) -> Self {
        Self { factory, options }
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Finalize and compile a shaped query.
    #[instrument(skip_all, fields(split = self.options.is_split()))]
    pub fn compile(&self, shaped: ShapedQuery) -> Result<Arc<CompiledQuery>> {
        let query = QueryPostprocessor::new(&self.options).process(shaped)?;
        let program = Arc::new(ShaperCompiler::compile(&query)?);

        let mut hasher = blake3::Hasher::new();
        hasher.update(query.query.to_string().as_bytes());
        let mut split_commands = HashMap::new();
        query.shaper.for_each_collection(&mut |collection| {
            if let Some(split) = &collection.split {
                hasher.update(b"\n");
                hasher.update(split.query.to_string().as_bytes());
                split_commands.insert(
                    collection.collection_id,
                    Arc::new(RelationalCommandCache::new(
                        split.query.clone(),
                        Arc::clone(&self.factory),
                    )),
                );
            }
        });
        let fingerprint = hex::encode(&hasher.finalize().as_bytes()[..16]);

        info!(
            fingerprint = %fingerprint,
            collections = program.collection_count(),
            split_queries = split_commands.len(),
            "query compiled"
        );

        Ok(Arc::new(CompiledQuery {
            command_cache: RelationalCommandCache::new(
                query.query.clone(),
                Arc::clone(&self.factory),
            ),
            shaper: RowShaper::new(Arc::clone(&program)),
            loader: RelatedDataLoader::new(program, split_commands),
            options: self.options.clone(),
            fingerprint,
            query,
        }))
    }
}
