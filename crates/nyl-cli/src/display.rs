//! Display formatting for CLI output
//!
//! Everything here goes to stderr; stdout carries only the manifest stream.

use console::style;
use nyl_engine::{DeferredNote, RenderFailure, RenderResult};

/// Print deferred notes and failures after a render
pub fn print_report(result: &RenderResult) {
    if !result.deferred.is_empty() {
        eprintln!(
            "  {} {} deferred:",
            style("…").yellow(),
            pluralize(result.deferred.len(), "resource", "resources")
        );
        for note in &result.deferred {
            print_deferred(note);
        }
        eprintln!();
    }

    if !result.errors.is_empty() {
        eprintln!(
            "  {} {}:",
            style("✗").red(),
            pluralize(result.errors.len(), "failure", "failures")
        );
        for failure in &result.errors {
            print_failure(failure);
        }
        eprintln!();
    }
}

fn print_deferred(note: &DeferredNote) {
    eprintln!("    {} {}", style("→").blue(), note);
}

fn print_failure(failure: &RenderFailure) {
    eprintln!(
        "    {} {} in {}",
        style("✗").red(),
        style(failure.kind).bold(),
        style(&failure.scope).yellow()
    );
    match &failure.diagnostic {
        Some(diagnostic) => eprintln!("{:?}", miette::Report::new(diagnostic.clone())),
        None => {
            eprintln!("      {}", failure.message);
            if let Some(location) = &failure.location {
                eprintln!("      {} {}", style("at").dim(), location);
            }
        }
    }
}

/// Format count with proper pluralization
pub fn pluralize(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{} {}", count, singular)
    } else {
        format!("{} {}", count, plural)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize(1, "resource", "resources"), "1 resource");
        assert_eq!(pluralize(3, "resource", "resources"), "3 resources");
    }
}
