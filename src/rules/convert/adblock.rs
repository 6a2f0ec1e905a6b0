//! `AdBlock` filter conversion.

use std::io::BufRead;

use super::{ConvertError, ListConverter, exact};
use crate::rules::Rule;

/// Converts the domain-level subset of `AdBlock` Plus filters.
///
/// `||domain^` and `|domain|` become exact blacklist rules. Trailing
/// `$modifiers` on a `||domain^` rule are ignored. Exceptions, element
/// hiding, wildcards and URL patterns cannot be expressed as DNS rules and
/// are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdBlockConverter;

impl ListConverter for AdBlockConverter {
    fn convert(&self, reader: &mut dyn BufRead) -> Result<Vec<Rule>, ConvertError> {
        let mut rules = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let filter = line.trim();

            if filter.is_empty() || filter.starts_with(['!', '[']) || filter.starts_with("@@") {
                continue;
            }

            if let Some(domain) = filter_domain(filter) {
                rules.push(exact(domain, false));
            }
        }

        Ok(rules)
    }
}

/// Extract the domain of a `||domain^` or `|domain|` filter.
fn filter_domain(filter: &str) -> Option<&str> {
    let domain = if let Some(rest) = filter.strip_prefix("||") {
        let (domain, tail) = rest.split_once('^')?;
        if !(tail.is_empty() || tail.starts_with('$') || tail == "|") {
            return None;
        }
        domain
    } else {
        filter.strip_prefix('|')?.strip_suffix('|')?
    };

    is_plain_domain(domain).then_some(domain)
}

fn is_plain_domain(domain: &str) -> bool {
    domain.contains('.')
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}
