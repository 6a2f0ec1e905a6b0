//! Hosts file conversion.

use std::io::BufRead;

use super::{ConvertError, ListConverter, exact};
use crate::rules::Rule;

/// Converts `/etc/hosts` style lists.
///
/// - `0.0.0.0` and `127.0.0.1` entries become blacklist rules
/// - entries pointing anywhere else become whitelist rules, since the list
///   author wants them to keep resolving
/// - system names such as `localhost` and IP-looking names are skipped
/// - several names per line and trailing `#` comments are handled
#[derive(Debug, Clone, Copy, Default)]
pub struct HostsFileConverter;

/// System entries present in most hosts files.
const IGNORED_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
];

/// Addresses used by block lists to null-route a name.
const SINK_ADDRESSES: &[&str] = &["0.0.0.0", "127.0.0.1"];

impl ListConverter for HostsFileConverter {
    fn convert(&self, reader: &mut dyn BufRead) -> Result<Vec<Rule>, ConvertError> {
        let mut rules = Vec::new();

        for line in reader.lines() {
            let line = line?;
            let entry = line.split('#').next().unwrap_or_default().trim();

            let mut fields = entry.split_whitespace();
            let Some(address) = fields.next() else {
                continue;
            };
            let whitelist = !SINK_ADDRESSES.contains(&address);

            for name in fields {
                let lower = name.to_lowercase();
                if IGNORED_NAMES.contains(&lower.as_str()) || is_ip_like(&lower) {
                    continue;
                }
                rules.push(exact(&lower, whitelist));
            }
        }

        Ok(rules)
    }
}

/// Matches IPv6 text and dotted all-numeric names such as `0.0.0.0.0`.
fn is_ip_like(name: &str) -> bool {
    if name.contains(':') {
        return true;
    }

    let mut labels = name.split('.');
    let count = labels.clone().count();
    count >= 2 && labels.all(|label| label.parse::<u8>().is_ok())
}
