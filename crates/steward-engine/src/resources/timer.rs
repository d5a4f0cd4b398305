use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use steward_types::{MetaParams, Result, StewardError};

use crate::context::{Init, WatchContext};
use crate::registry::ResourceDecl;
use crate::resource::{downcast_ref, Resource};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerParams {
    /// Seconds between ticks.
    #[serde(default)]
    pub interval: u32,
}

/// Produces an event every `interval` seconds.
#[derive(Debug)]
pub struct TimerRes {
    name: String,
    meta: MetaParams,
    params: TimerParams,
}

impl TimerRes {
    pub const KIND: &'static str = "timer";

    pub fn new(name: impl Into<String>, interval: u32) -> Self {
        Self {
            name: name.into(),
            meta: MetaParams::default(),
            params: TimerParams { interval },
        }
    }

    pub fn with_meta(mut self, meta: MetaParams) -> Self {
        self.meta = meta;
        self
    }

    pub fn from_decl(decl: &ResourceDecl) -> Result<Arc<dyn Resource>> {
        let params: TimerParams = decl.decode_params()?;
        Ok(Arc::new(Self {
            name: decl.name.clone(),
            meta: decl.meta.clone(),
            params,
        }))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.params.interval.into())
    }
}

#[async_trait]
impl Resource for TimerRes {
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
        if self.params.interval == 0 {
            return Err(StewardError::Validation {
                resource: format!("{}[{}]", Self::KIND, self.name),
                message: "interval must be at least one second".into(),
            });
        }
        Ok(())
    }

    async fn init(&self, _init: Init) -> Result<()> {
        Ok(())
    }

    async fn watch(&self, ctx: WatchContext) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.tick().await;
        ctx.running();
        loop {
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                _ = ticker.tick() => ctx.event().await?,
            }
        }
    }

    async fn check_apply(&self, _cancel: CancellationToken, apply: bool) -> Result<bool> {
        if apply {
            info!(timer = %self.name, "tick");
        }
        Ok(true)
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn cmp(&self, other: &dyn Resource) -> Result<()> {
        let other = downcast_ref::<TimerRes>(other)
            .ok_or_else(|| StewardError::Other(format!("{other} is not a timer")))?;
        if self.params.interval != other.params.interval {
            return Err(StewardError::Other("the interval differs".into()));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
