//! Converters from third-party block lists to rule lines.
//!
//! Every converter reads a list from a buffered reader and yields exact-match
//! rules, so the output can be written straight into the rule directory.
//!
//! ```
//! use dnsfs::rules::convert::{ListFormat, convert};
//! use std::io::BufReader;
//!
//! let content = "0.0.0.0 ads.example.com\n192.168.1.10 nas.example.com";
//! let rules = convert(ListFormat::Hosts, &mut BufReader::new(content.as_bytes())).unwrap();
//! let lines: Vec<String> = rules.iter().map(ToString::to_string).collect();
//! assert_eq!(lines, vec!["e;;ads.example.com", "e;w;nas.example.com"]);
//! ```

mod adblock;
mod domains;
mod hosts;

use std::fmt;
use std::io::BufRead;

pub use adblock::AdBlockConverter;
pub use domains::DomainListConverter;
pub use hosts::HostsFileConverter;

use super::{Matcher, Rule};

/// Error type for list conversion.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("I/O error reading list: {0}")]
    Io(#[from] std::io::Error),
}

/// Supported input list formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListFormat {
    /// `/etc/hosts` style lists.
    Hosts,
    /// `AdBlock` Plus domain filters.
    Adblock,
    /// One domain per line.
    Domains,
}

impl fmt::Display for ListFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hosts => "hosts",
            Self::Adblock => "adblock",
            Self::Domains => "domains",
        };
        f.write_str(name)
    }
}

/// Turns one list format into rules.
pub trait ListConverter: Send + Sync {
    /// Convert the whole list.
    ///
    /// Lines the converter does not understand are skipped; only read
    /// failures are errors.
    fn convert(&self, reader: &mut dyn BufRead) -> Result<Vec<Rule>, ConvertError>;
}

/// Returns the converter for a list format.
#[must_use]
pub fn converter_for(format: ListFormat) -> Box<dyn ListConverter> {
    match format {
        ListFormat::Hosts => Box::new(HostsFileConverter),
        ListFormat::Adblock => Box::new(AdBlockConverter),
        ListFormat::Domains => Box::new(DomainListConverter),
    }
}

/// Convert a list in the given format.
pub fn convert(format: ListFormat, reader: &mut dyn BufRead) -> Result<Vec<Rule>, ConvertError> {
    converter_for(format).convert(reader)
}

fn exact(domain: &str, whitelist: bool) -> Rule {
    Rule::new(Matcher::Equals(domain.to_lowercase()), whitelist)
}
