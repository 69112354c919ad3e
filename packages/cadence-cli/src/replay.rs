use crate::script::ScriptedRequest;
use crate::settings::Settings;
use anyhow::{Context as _, Result};
use cadence_pipeline::{ShoppingService, shopping_store};
use cadence_scheduler::{Clock, EventLoop, LoopBuilder, LoopStats, MonotonicClock};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;

/// Responses in the order they were emitted, one formatted line each.
#[derive(Debug)]
pub struct Transcript {
    pub lines: Vec<String>,
    pub stats: LoopStats,
}

/// Feeds `requests` to a fresh shopping service and runs the loop until it
/// is idle.
pub fn run(settings: &Settings, requests: Vec<ScriptedRequest>) -> Result<Transcript> {
    run_with_clock(settings, requests, MonotonicClock::new())
}

pub fn run_with_clock(
    settings: &Settings,
    requests: Vec<ScriptedRequest>,
    clock: impl Clock + 'static,
) -> Result<Transcript> {
    let store = shopping_store(settings.store_config());
    if let Some(seed) = &settings.seed {
        let json = fs::read_to_string(seed)
            .with_context(|| format!("reading seed file {}", seed.display()))?;
        let seeded = store.seed_json(&json)?;
        tracing::info!(records = seeded, "store seeded");
    }

    let mut builder = LoopBuilder::new().clock(clock);
    if let Some(limit) = settings.max_ticks {
        builder = builder.max_ticks(limit);
    }
    let lp = builder.build();
    let service = Rc::new(ShoppingService::new(store));
    let lines = Rc::new(RefCell::new(Vec::new()));

    for request in requests {
        let delay = request.delay_ms;
        let service = service.clone();
        let lines = lines.clone();
        let deliver = move |lp: &EventLoop| {
            let ScriptedRequest {
                line,
                method,
                target,
                body,
                ..
            } = request;
            let label = format!("{line}: {method} {target}");
            tracing::debug!(%label, "delivering request");
            service.dispatch(lp, &method, &target, body, move |_, response| {
                lines
                    .borrow_mut()
                    .push(format!("{label} -> {} {}", response.status(), response.body()));
            });
        };
        match delay {
            Some(ms) => {
                lp.set_timeout(ms, deliver);
            }
            None => lp.enqueue_io(deliver),
        }
    }

    let stats = lp.run()?;
    tracing::info!(
        ticks = stats.ticks,
        callbacks = stats.callbacks_run,
        errors = stats.errors_reported,
        "replay finished"
    );
    let lines = lines.take();
    Ok(Transcript { lines, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script;
    use cadence_scheduler::ManualClock;

    #[test]
    fn test_replay_answers_in_completion_order() {
        let requests = script::parse(
            "POST /lists {\"description\": \"Weekly\"}\n\
             @5 GET /lists/1\n\
             GET /lists/9\n",
        )
        .unwrap();

        let transcript =
            run_with_clock(&Settings::default(), requests, ManualClock::new()).unwrap();

        assert_eq!(
            transcript.lines,
            vec![
                "1: POST /lists -> 201 {\"createdId\":1}".to_string(),
                "3: GET /lists/9 -> 404 {}".to_string(),
                "2: GET /lists/1 -> 200 {\"description\":\"Weekly\",\"id\":1}".to_string(),
            ]
        );
        assert_eq!(transcript.stats.errors_reported, 0);
    }

    #[test]
    fn test_missing_seed_file_is_an_error() {
        let settings = Settings {
            seed: Some("/no/such/seed.json".into()),
            ..Settings::default()
        };
        let error = run_with_clock(&settings, Vec::new(), ManualClock::new()).unwrap_err();
        assert!(error.to_string().contains("/no/such/seed.json"));
    }
}
