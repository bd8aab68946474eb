pub(crate) mod run_item;
pub(crate) mod validate;

use std::path::Path;
use std::process;

use serde::de::DeserializeOwned;

use crate::{report_error, OutputFormat};

/// Reads and deserializes a JSON file, exiting with a report on failure.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path, output: OutputFormat, quiet: bool) -> T {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading file '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            let msg = format!("error parsing JSON in '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}
