//! BSMS (BIP-129) descriptor records.
//!
//! Extraction is best effort. Lines are trimmed and classified by the first
//! matching rule:
//!
//! 1. blank lines and `#` comments are skipped
//! 2. `BSMS x.y` is the version
//! 3. a line starting with a script function (`wsh(`, `sh(`, ...) is the descriptor
//! 4. a line starting with `/` or reading `No path restrictions` is the path restriction
//! 5. a line that looks like an address is the first address
//!
//! When no descriptor line is found the whole input is taken as a raw descriptor.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

pub const BSMS_VERSION: &str = "1.0";
pub const NO_PATH_RESTRICTIONS: &str = "No path restrictions";

const DESCRIPTOR_PREFIXES: [&str; 7] = [
    "wsh(",
    "sh(",
    "wpkh(",
    "pkh(",
    "tr(",
    "multi(",
    "sortedmulti(",
];

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^BSMS\s+([0-9]+\.[0-9]+)$").unwrap());
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(?:bc|tb|bcrt)1[02-9ac-hj-np-z]{8,87}|[123mn][1-9A-HJ-NP-Za-km-z]{25,34})$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BsmsContent {
    pub version: Option<String>,
    pub descriptor: String,
    pub path_restrictions: Option<String>,
    pub first_address: Option<String>,
}

impl BsmsContent {
    /// True when the text had BSMS structure rather than being a bare descriptor.
    pub fn is_bsms(&self) -> bool {
        self.version.is_some() || self.first_address.is_some() || self.path_restrictions.is_some()
    }
}

pub fn format_bsms(
    descriptor: &str,
    path_restrictions: Option<&str>,
    first_address: &str,
) -> String {
    [
        format!("BSMS {BSMS_VERSION}"),
        descriptor.to_owned(),
        path_restrictions.unwrap_or(NO_PATH_RESTRICTIONS).to_owned(),
        first_address.to_owned(),
    ]
    .join("\n")
}

fn looks_like_descriptor(line: &str) -> bool {
    DESCRIPTOR_PREFIXES.iter().any(|p| line.starts_with(p))
}

fn looks_like_path_restriction(line: &str) -> bool {
    line.starts_with('/') || line.eq_ignore_ascii_case(NO_PATH_RESTRICTIONS)
}

pub fn extract_bsms(text: &str) -> BsmsContent {
    let mut content = BsmsContent {
        version: None,
        descriptor: String::new(),
        path_restrictions: None,
        first_address: None,
    };
    let mut descriptor = None;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(c) = VERSION_RE.captures(line) {
            content.version = c.get(1).map(|m| m.as_str().to_owned());
        } else if looks_like_descriptor(line) {
            if descriptor.is_none() {
                descriptor = Some(line.to_owned());
            }
        } else if looks_like_path_restriction(line) {
            content.path_restrictions = Some(line.to_owned());
        } else if ADDRESS_RE.is_match(line) {
            content.first_address = Some(line.to_owned());
        } else {
            log::debug!("Ignoring unrecognized line in descriptor text");
        }
    }
    content.descriptor = match descriptor {
        Some(d) => d,
        None => {
            log::debug!("No descriptor line found, using the whole input as descriptor");
            text.trim().to_owned()
        }
    };
    content
}
