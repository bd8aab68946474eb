use std::collections::BTreeMap;
use std::path::Path;
use std::process;
use std::sync::Arc;

use qti_eval::{
    AssessmentItem, ExtensionRegistry, Identifier, ItemPhase, ItemResult, ItemSessionController,
    ItemSessionSettings, ItemSessionState, ResolvedItem, Runtime, SessionStatus, TracingListener,
};
use time::OffsetDateTime;

use super::read_json;
use crate::{report_error, OutputFormat};

pub(crate) struct RunOptions {
    pub(crate) seed: Option<u64>,
    pub(crate) max_attempts: u32,
    pub(crate) template_limit: u32,
}

type Attempt = BTreeMap<Identifier, Vec<String>>;

pub(crate) fn cmd_run_item(
    item_path: &Path,
    responses_path: &Path,
    options: RunOptions,
    output: OutputFormat,
    quiet: bool,
) {
    let item: AssessmentItem = read_json(item_path, output, quiet);
    let attempts: Vec<Attempt> = read_json(responses_path, output, quiet);

    let extensions = ExtensionRegistry::new();
    let resolved = ResolvedItem::new(item, &extensions);
    let mut state = ItemSessionState::new();
    let mut runtime = Runtime::new(options.seed).with_listener(Arc::new(TracingListener));
    let settings = ItemSessionSettings {
        template_processing_limit: options.template_limit,
        max_attempts: options.max_attempts,
        allow_comment: false,
    };

    let result = ItemSessionController::new(
        &resolved,
        &mut state,
        settings,
        &extensions,
        &mut runtime,
    )
    .and_then(|mut session| run(&mut session, &attempts));

    match result {
        Ok(result) => print_result(&result, output, quiet),
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

fn run(
    session: &mut ItemSessionController<'_>,
    attempts: &[Attempt],
) -> Result<ItemResult, qti_eval::EngineError> {
    let now = OffsetDateTime::now_utc();
    session.initialize(now)?;
    session.perform_template_processing(now, &BTreeMap::new())?;
    session.enter_item(now)?;
    for (n, responses) in attempts.iter().enumerate() {
        if session.phase() == ItemPhase::Closed {
            tracing::warn!(
                ignored = attempts.len() - n,
                "session closed; remaining attempts ignored"
            );
            break;
        }
        let now = OffsetDateTime::now_utc();
        let valid = session.bind_responses(now, responses)?;
        tracing::debug!(attempt = n + 1, valid, "responses bound");
        session.perform_response_processing(now)?;
    }
    Ok(session.item_result(OffsetDateTime::now_utc()))
}

fn status_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Initial => "initial",
        SessionStatus::PendingSubmission => "pendingSubmission",
        SessionStatus::PendingResponseProcessing => "pendingResponseProcessing",
        SessionStatus::Final => "final",
    }
}

fn print_result(result: &ItemResult, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(result)
                    .unwrap_or_else(|e| format!("serialization error: {}", e))
            );
        }
        OutputFormat::Text => {
            println!("item: {}", result.identifier);
            println!("sessionStatus: {}", status_name(result.session_status));
            println!("numAttempts: {}", result.num_attempts);
            println!("completionStatus: {}", result.completion_status.as_str());
            for (identifier, value) in &result.outcome_values {
                println!("{} = {}", identifier, value);
            }
        }
    }
}
