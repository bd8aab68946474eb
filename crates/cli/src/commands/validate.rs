use std::path::Path;
use std::process;

use qti_eval::{
    AssessmentItem, AssessmentTest, ExtensionRegistry, ResolvedItem, ResolvedTest,
    ValidationReport,
};

use super::read_json;
use crate::resolver::DirectoryResolver;
use crate::{report_error, OutputFormat};

pub(crate) fn cmd_validate(
    file: &Path,
    items_dir: Option<&Path>,
    output: OutputFormat,
    quiet: bool,
) {
    let doc: serde_json::Value = read_json(file, output, quiet);
    let extensions = ExtensionRegistry::new();

    // Tests are recognised by their testParts.
    let (kind, report) = if doc.get("testParts").is_some() {
        let test: AssessmentTest = match serde_json::from_value(doc) {
            Ok(t) => t,
            Err(e) => {
                let msg = format!("invalid test in '{}': {}", file.display(), e);
                report_error(&msg, output, quiet);
                process::exit(1);
            }
        };
        let base = items_dir
            .map(Path::to_path_buf)
            .or_else(|| file.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let resolved = ResolvedTest::resolve(test, &DirectoryResolver::new(base), &extensions);
        ("test", resolved.report().clone())
    } else {
        let item: AssessmentItem = match serde_json::from_value(doc) {
            Ok(i) => i,
            Err(e) => {
                let msg = format!("invalid item in '{}': {}", file.display(), e);
                report_error(&msg, output, quiet);
                process::exit(1);
            }
        };
        let resolved = ResolvedItem::new(item, &extensions);
        ("item", resolved.report().clone())
    };

    print_report(file, kind, &report, output, quiet);
    if report.has_errors() {
        process::exit(1);
    }
}

fn print_report(
    file: &Path,
    kind: &str,
    report: &ValidationReport,
    output: OutputFormat,
    quiet: bool,
) {
    match output {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "file": file.display().to_string(),
                "kind": kind,
                "valid": !report.has_errors(),
                "findings": report.findings,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&json)
                    .unwrap_or_else(|e| format!("serialization error: {}", e))
            );
        }
        OutputFormat::Text => {
            for finding in &report.findings {
                eprintln!("{}", finding);
            }
            if quiet {
                return;
            }
            let errors = report.errors().count();
            if errors == 0 {
                println!("{}: valid {}", file.display(), kind);
            } else {
                println!("{}: {} error(s)", file.display(), errors);
            }
        }
    }
}
