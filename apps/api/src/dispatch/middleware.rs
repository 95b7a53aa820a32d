//! Middleware pipeline: an onion of cross-cutting stages around the
//! terminal dispatch call.
//!
//! `Next` carries the remaining chain as a slice; each stage runs the rest
//! of the pipeline by calling `next.run(...)`, so execution order matches
//! registration order: the first-registered stage is outermost. A stage may
//! short-circuit by returning without calling `next`, abort by raising a
//! typed error, or transform the result after `next` resolves. No stage can
//! skip ahead or reorder the others.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::errors::AppError;

use super::context::ExecutionContext;

/// The terminal of the pipeline: permission check, cache, registry handler.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, AppError>;
}

/// One pipeline stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        next: Next<'_>,
    ) -> Result<Value, AppError>;
}

/// The rest of the pipeline, terminating in the endpoint.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, AppError> {
        match self.remaining.split_first() {
            Some((stage, rest)) => {
                stage
                    .handle(
                        params,
                        ctx,
                        Next {
                            remaining: rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => self.endpoint.call(params, ctx).await,
        }
    }
}

/// Ordered middleware chain. `use_stage` appends; stages execute in
/// registration order.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_stage(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub async fn run(
        &self,
        params: Map<String, Value>,
        ctx: &mut ExecutionContext,
        endpoint: &dyn Endpoint,
    ) -> Result<Value, AppError> {
        Next {
            remaining: &self.stages,
            endpoint,
        }
        .run(params, ctx)
        .await
    }
}
