//! Plain domain list conversion.

use std::io::BufRead;

use super::{ConvertError, ListConverter, exact};
use crate::rules::Rule;

/// Converts lists with one domain per line and `#` comments.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainListConverter;

impl ListConverter for DomainListConverter {
    fn convert(&self, reader: &mut dyn BufRead) -> Result<Vec<Rule>, ConvertError> {
        let mut rules = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let domain = line.trim();
            if domain.is_empty() || domain.starts_with('#') {
                continue;
            }
            rules.push(exact(domain, false));
        }

        Ok(rules)
    }
}
