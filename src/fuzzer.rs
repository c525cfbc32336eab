//! The outer fuzzing loop: run, triage, and for every new crash the
//! reproduce-and-minimize pipeline.

use std::path::Path;

use crate::{
    corpus::Corpus,
    error::Result,
    mutator::STRATEGY_BUMP_THRESHOLD,
    reproduce::{
        critical_endpoints, minimize_with, MinimizeOutcome, ReproduceStatus,
        MINIMIZE_RETRY_FACTOR, REPRODUCE_MAX_RETRIES,
    },
    supervisor::Supervisor,
    ui,
};

/// Run fuzzing iterations until the cap is reached or SIGINT arrives.
pub fn fuzzing_loop(sup: &mut Supervisor) -> Result<()> {
    while !sup.iterations_exhausted() && !sup.quitting() {
        sup.setup()?;
        let outcome = sup.fuzzing_run()?;
        sup.teardown();

        if sup.quitting() {
            break;
        }

        if sup.mutator.note_run_outcome(outcome.new_unique_crash) {
            sup.console.highlight(
                ui::BROWN,
                format!(
                    "No non-duplicate crash in {STRATEGY_BUMP_THRESHOLD} runs. \
                     Adapt strategy [{}].",
                    sup.mutator.turning_point()
                ),
            );
        }

        if outcome.wants_reproduction {
            if let Some(crash_id) = outcome.crash_id {
                sup.console.set_nested(true);
                let result = reproduce_and_minimize(sup, crash_id);
                sup.console.set_nested(false);
                result?;
            }
        }

        sup.corpus.clear();
        log::debug!("done with iteration #{}", sup.run_counter);
        sup.console.blank();
    }
    Ok(())
}

/// Replay the recorded corpus against fresh workers to prove the crash,
/// then shrink it to a minimal witness.
fn reproduce_and_minimize(sup: &mut Supervisor, crash_id: u32) -> Result<()> {
    sup.corpus.strip_for_replay();
    let backup = sup.corpus.clone();
    let crash_dir = sup.artifacts.lookup_crash_dir(crash_id);

    sup.console.info("Reproducing the crash...");
    let status = sup.reproduce_loop(&backup, REPRODUCE_MAX_RETRIES)?;
    let minimize_budget = sup.replay_counter * MINIMIZE_RETRY_FACTOR;
    sup.artifacts.clean_replay_runs(&crash_dir)?;

    if status != ReproduceStatus::Success {
        sup.console.highlight(
            ui::RED,
            format!(
                "Unable to reproduce iteration #{}: considering non-reproducible",
                sup.run_counter
            ),
        );
        sup.artifacts.append_crash_info(&crash_dir, "non_reproducible")?;
        return Ok(());
    }
    sup.console.highlight(
        ui::BOLD,
        format!("Success, reproduced iteration #{}", sup.run_counter),
    );

    if backup.message_count() < 2 {
        sup.console.info(format!(
            "No need to minimize, corpus has {} action(s)",
            backup.message_count()
        ));
        sup.artifacts
            .promote_run_to_minimal(&crash_dir, &format!("run{}", sup.run_counter))?;
        sup.artifacts.write_minimal_corpus(&crash_dir, &backup)?;
        return Ok(());
    }

    sup.console.info("Minimizing the crash...");
    log::debug!("enabling at most {minimize_budget} attempts per round");

    let outcome = run_minimization(sup, &crash_dir, &backup, minimize_budget)?;
    match outcome {
        MinimizeOutcome::Minimal(minimal) => {
            sup.console.highlight(
                ui::BOLD,
                format!("Success, minimized iteration #{}", sup.run_counter),
            );
            // the last successful replay holds the witness artifacts
            let label = format!("rp{}", sup.replay_counter.saturating_sub(1));
            if let Err(e) = sup.artifacts.promote_replay_to_minimal(&crash_dir, &label) {
                log::warn!("could not promote {label} to minimal: {e}");
            }
            sup.artifacts.write_minimal_corpus(&crash_dir, &minimal)?;

            let endpoints = critical_endpoints(&minimal);
            log::debug!("found {} API endpoints that matter", endpoints.len());
            sup.critical_api.extend(endpoints);
        }
        MinimizeOutcome::Unminimized(_) => {
            sup.console
                .error("Failure: we did not manage to minimize this crash.");
            sup.console.error(
                "This is curious and could be due to randomness in the app, \
                 or to a fuzzer bug.",
            );
        }
    }
    sup.artifacts.clean_replay_runs(&crash_dir)?;
    Ok(())
}

fn run_minimization(
    sup: &mut Supervisor,
    crash_dir: &Path,
    backup: &Corpus,
    budget: u64,
) -> Result<MinimizeOutcome> {
    minimize_with(backup, |reference| {
        // drop the previous probe's scratch dirs; a successful probe's
        // artifacts survive until promotion
        sup.artifacts.clean_replay_runs(crash_dir)?;
        sup.reproduce_loop(reference, budget)
    })
}
