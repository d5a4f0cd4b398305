use std::any::Any;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use steward_types::{MetaParams, Result, StewardError};

use crate::context::{Init, WatchContext};
use crate::registry::ResourceDecl;
use crate::resource::{downcast_ref, Resource};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoopParams {
    #[serde(default)]
    pub comment: String,
}

/// A resource that does nothing. Always converged.
#[derive(Debug)]
pub struct NoopRes {
    name: String,
    meta: MetaParams,
    params: NoopParams,
    init: OnceLock<Init>,
}

impl NoopRes {
    pub const KIND: &'static str = "noop";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            meta: MetaParams::default(),
            params: NoopParams::default(),
            init: OnceLock::new(),
        }
    }

    pub fn with_meta(mut self, meta: MetaParams) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.params.comment = comment.into();
        self
    }

    pub fn from_decl(decl: &ResourceDecl) -> Result<Arc<dyn Resource>> {
        let params: NoopParams = decl.decode_params()?;
        Ok(Arc::new(Self {
            name: decl.name.clone(),
            meta: decl.meta.clone(),
            params,
            init: OnceLock::new(),
        }))
    }
}

#[async_trait]
impl Resource for NoopRes {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn meta_params(&self) -> &MetaParams {
        &self.meta
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn init(&self, init: Init) -> Result<()> {
        let _ = self.init.set(init);
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<()> {
        ctx.running();
        ctx.done().await;
        Ok(())
    }

    async fn check_apply(&self, _cancel: CancellationToken, apply: bool) -> Result<bool> {
        if let Some(init) = self.init.get() {
            let _entered = init.span.enter();
            tracing::debug!(apply, comment = %self.params.comment, "CheckApply");
        }
        Ok(true)
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> Result<()> {
        let other = downcast_ref::<NoopRes>(other)
            .ok_or_else(|| StewardError::Other(format!("{other} is not a noop")))?;
        if self.params != other.params {
            return Err(StewardError::Other("the comment differs".into()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
