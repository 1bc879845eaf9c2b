//! Reset (reprovisioning) command handler.

use simsync_core::{Engine, ReprovisioningRecord};

use crate::cli::{GlobalOpts, ResetArgs};
use crate::error::CliError;
use crate::output;

use super::util;

fn render_record(record: &ReprovisioningRecord, global: &GlobalOpts) -> Result<(), CliError> {
    let color = output::should_color(global.color);
    let out = output::render_single(
        global.output,
        record,
        |r| output::record_detail(r, color),
        |r| r.new_endpoint_id.as_ref().map(ToString::to_string).unwrap_or_default(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

pub async fn handle(engine: &Engine, args: ResetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let line = engine.line(args.sim);
    util::restore_record(&line).await?;

    if args.clear {
        let cleared = line.clear_reprovision().await?;
        util::save_record(&line)?;
        return match cleared {
            Some(record) => render_record(&record, global),
            None => {
                if !global.quiet {
                    eprintln!("No reset record for {}", line.id());
                }
                Ok(())
            }
        };
    }

    let (prompt, action) = if args.resume {
        (format!("Provision a new endpoint for {}?", line.id()), "reset --resume")
    } else {
        (
            format!("Terminate the current endpoint of {} and provision a new one?", line.id()),
            "reset",
        )
    };
    if !util::confirm(&prompt, action, global)? {
        if !global.quiet {
            eprintln!("Aborted");
        }
        return Ok(());
    }

    let bar = util::spinner(format!("Resetting {}", line.id()), global);
    let result = if args.resume {
        line.resume_reprovision().await
    } else {
        let name = args.name.ok_or_else(|| CliError::Validation {
            field: "name".into(),
            reason: "a display name is required for a new reset".into(),
        })?;
        line.reprovision(name).await
    };
    bar.finish_and_clear();

    // A failed run still leaves a record to resume or clear later.
    let saved = util::save_record(&line);
    if let Err(ref e) = saved {
        tracing::warn!(line = %line.id(), error = %e, "could not save the reset record");
    }
    let record = result?;
    saved?;
    tracing::info!(line = %line.id(), phase = %record.phase, "reset finished");
    render_record(&record, global)
}
