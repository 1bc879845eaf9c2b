//! Line command handlers: show, set, watch.

use tracing::{debug, warn};

use simsync_core::{CoreError, DeviceLineState, DomainError, Engine, Mutation};

use crate::cli::{GlobalOpts, OutputFormat, SetArgs, ShowArgs, WatchArgs};
use crate::error::CliError;
use crate::output;

use super::util;

fn render_line(state: &DeviceLineState, global: &GlobalOpts) -> Result<(), CliError> {
    let color = output::should_color(global.color);
    let out = output::render_single(
        global.output,
        state,
        |s| output::line_detail(s, color),
        |s| s.endpoint_id.as_ref().map(ToString::to_string).unwrap_or_default(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn show(engine: &Engine, args: ShowArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let line = engine.line(args.sim);
    util::restore_record(&line).await?;
    line.refresh().await?;
    render_line(&line.state(), global)
}

pub async fn set(engine: &Engine, args: SetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mutation = Mutation::parse(args.attribute, &args.value)?;
    let line = engine.line(args.sim);
    util::restore_record(&line).await?;

    match line.mutate(mutation).await {
        Ok(()) => debug!(line = %line.id(), %mutation, "mutation applied"),
        // Setting a value the line already has is not a failure for scripts.
        Err(CoreError::Domain(DomainError::AlreadyInState { attribute, value })) => {
            if !global.quiet {
                eprintln!("{attribute} is already {value}; nothing to do");
            }
        }
        Err(e) => return Err(e.into()),
    }
    render_line(&line.state(), global)
}

pub async fn watch(engine: &Engine, args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let line = engine.line(args.sim);
    util::restore_record(&line).await?;
    let mut states = line.subscribe();
    line.refresh().await?;

    let initial = states.borrow_and_update().clone();
    render_line(&initial, global)?;
    let mut last = output::line_summary(&initial);

    engine.start().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            biased;
            _ = &mut ctrl_c => break,
            changed = states.changed() => {
                if changed.is_err() {
                    warn!(line = %line.id(), "line state channel closed");
                    break;
                }
                let state = states.borrow_and_update().clone();
                let summary = output::line_summary(&state);
                if summary == last {
                    continue;
                }
                match global.output {
                    OutputFormat::Table | OutputFormat::Plain => {
                        let stamp = chrono::Local::now().format("%H:%M:%S");
                        output::print_output(&format!("{stamp}  {summary}"), global.quiet);
                    }
                    format => {
                        let out = output::render_single(format, &state, |_| String::new(), |_| String::new())?;
                        output::print_output(&out, global.quiet);
                    }
                }
                last = summary;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
