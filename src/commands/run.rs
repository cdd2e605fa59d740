//! `troop <query>`, `troop prompt` and `troop chat`.

use super::Context;
use anyhow::Result;
use tokio::io::BufReader;
use tracing::debug;
use troop::display::MessageDisplay;
use troop::runner::AgentRunner;

pub async fn prompt(ctx: &Context, message: &str) -> Result<()> {
    let settings = ctx.load_settings()?;
    let runner =
        AgentRunner::from_settings(&settings, ctx.agent.as_deref(), ctx.model.as_deref()).await?;
    let mut display = MessageDisplay::stdout(ctx.verbose);

    let result = runner.run_once(message, &[], &mut display).await;
    runner.shutdown().await;

    let outcome = result?;
    debug!(
        turns = outcome.stats.turns,
        tool_calls = outcome.stats.tool_calls,
        "prompt finished"
    );
    Ok(())
}

pub async fn chat(ctx: &Context) -> Result<()> {
    let settings = ctx.load_settings()?;
    let runner =
        AgentRunner::from_settings(&settings, ctx.agent.as_deref(), ctx.model.as_deref()).await?;
    let mut display = MessageDisplay::stdout(ctx.verbose);
    display.dim(&format!(
        "Chatting with {} ({} tools). Type 'exit' or 'quit' to leave.",
        runner.name(),
        runner.tool_count()
    ))?;

    let result = runner
        .chat(BufReader::new(tokio::io::stdin()), &mut display)
        .await;
    runner.shutdown().await;
    result?;
    Ok(())
}
