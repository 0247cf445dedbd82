//! Name checks performed before a request is admitted.
//!
//! Kubernetes would reject most of these names eventually, but only once a workload object is
//! created, which is long after the request was accepted. Checking early turns them into a
//! validation failure on the request itself.

// The formats are taken from apimachinery/pkg/util/validation/validation.go.

use std::{fmt::Display, sync::LazyLock};

use const_format::concatcp;
use regex::Regex;
use snafu::Snafu;

/// Minimal length required by RFC 1123 is 63. Up to 255 allowed, unsupported by k8s.
const RFC_1123_LABEL_MAX_LENGTH: usize = 63;
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";

const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");

static RFC_1123_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_LABEL_FMT}$")).expect("failed to compile RFC 1123 label regex")
});

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

type Result<T = (), E = Errors> = std::result::Result<T, E>;

/// All problems found while validating a set of names.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            let prefix = match i {
                0 => "",
                _ => ", ",
            };
            write!(f, "{prefix}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

impl Errors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds the errors of `result`, labelled with the field they belong to.
    pub fn collect(&mut self, field: &str, result: Result) {
        if let Err(errors) = result {
            self.0.extend(errors.0.into_iter().map(|error| Error::Field {
                field: field.to_owned(),
                source: Box::new(error),
            }));
        }
    }

    pub fn into_result(self) -> Result {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{value:?} is not valid: {msg}"))]
    Format { value: String, msg: &'static str },

    #[snafu(display("{value:?} is {length} bytes long but must be no more than {max_length}"))]
    TooLong {
        value: String,
        length: usize,
        max_length: usize,
    },

    #[snafu(display("{field}: {source}"))]
    Field { field: String, source: Box<Error> },
}

fn validate_all(validations: impl IntoIterator<Item = std::result::Result<(), Error>>) -> Result {
    let errors = validations
        .into_iter()
        .filter_map(std::result::Result::err)
        .collect::<Vec<_>>();
    Errors(errors).into_result()
}

fn validate_length(value: &str, max_length: usize) -> std::result::Result<(), Error> {
    if value.len() > max_length {
        TooLongSnafu {
            value,
            length: value.len(),
            max_length,
        }
        .fail()
    } else {
        Ok(())
    }
}

fn validate_format(
    value: &str,
    regex: &Regex,
    msg: &'static str,
) -> std::result::Result<(), Error> {
    if regex.is_match(value) {
        Ok(())
    } else {
        FormatSnafu { value, msg }.fail()
    }
}

/// Tests for a string that conforms to the definition of a label in DNS (RFC 1123). Pod, service
/// and component names must be labels.
pub fn is_rfc_1123_label(value: &str) -> Result {
    validate_all([
        validate_length(value, RFC_1123_LABEL_MAX_LENGTH),
        validate_format(
            value,
            &RFC_1123_LABEL_REGEX,
            "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character",
        ),
    ])
}

/// Tests for a string that conforms to the definition of a subdomain in DNS (RFC 1123).
pub fn is_rfc_1123_subdomain(value: &str) -> Result {
    validate_all([
        validate_length(value, RFC_1123_SUBDOMAIN_MAX_LENGTH),
        validate_format(
            value,
            &RFC_1123_SUBDOMAIN_REGEX,
            "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character",
        ),
    ])
}
