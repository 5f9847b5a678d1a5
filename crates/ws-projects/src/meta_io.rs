//! Narrow read/write-a-small-blob contract the two backends implement for
//! their own `.meta/*.json` files, so crypto and rotation logic can stay
//! backend-agnostic.

use async_trait::async_trait;
use ws_core::cancel::CancellationToken;
use ws_core::Result;

#[async_trait]
pub trait MetaIo: Send + Sync {
    async fn read_meta(&self, ctx: &CancellationToken, key: &str) -> Result<Option<Vec<u8>>>;
    async fn write_meta(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>) -> Result<()>;
}
