//! Migrate command - applies pending schema migrations.

use anyhow::{Context as _, Result};
use pipewright_store::Store;

use super::Context;

pub fn run(ctx: &Context) -> Result<()> {
    let path = ctx.storage_path();
    Store::open(&path).with_context(|| format!("failed to migrate {}", path.display()))?;
    println!("Database ready at {}", path.display());
    Ok(())
}
