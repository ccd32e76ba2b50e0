use lazy_static::lazy_static;
use regex::Regex;

use crate::{Error, Result};

lazy_static! {
    static ref LETTER_THEN_DIGIT: Regex = Regex::new(r"[a-zA-Z].*\d").expect("invalid regex");
    static ref EMAIL: Regex =
        Regex::new(r"^[a-zA-Z0-9+_.-]+@[a-zA-Z0-9.-]+$").expect("invalid regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Username,
    Email,
    Password,
}

struct Rule {
    field: Field,
    check: fn(&str) -> bool,
    message: &'static str,
}

fn chars_between(s: &str, min: usize, max: usize) -> bool {
    let n = s.chars().count();
    n >= min && n <= max
}

fn password_length(s: &str) -> bool {
    chars_between(s, 8, 32)
}

fn password_mix(s: &str) -> bool {
    LETTER_THEN_DIGIT.is_match(s)
}

fn username_length(s: &str) -> bool {
    chars_between(s, 4, 16)
}

fn email_length(s: &str) -> bool {
    chars_between(s, 4, 320)
}

fn email_format(s: &str) -> bool {
    EMAIL.is_match(s)
}

// checked in order, first failure is reported
const RULES: &[Rule] = &[
    Rule {
        field: Field::Password,
        check: password_length,
        message: "invalid password: must be between 8 and 32 characters",
    },
    // clients match on this text. The check is only a letter followed by a digit.
    Rule {
        field: Field::Password,
        check: password_mix,
        message: "invalid password: must contain at least 1 uppercase letter, 1 lowercase letter, and 1 number",
    },
    Rule {
        field: Field::Username,
        check: username_length,
        message: "invalid username: must be between 4 and 16 characters",
    },
    Rule {
        field: Field::Email,
        check: email_length,
        message: "invalid email: must be between 4 and 320 characters",
    },
    Rule {
        field: Field::Email,
        check: email_format,
        message: "invalid email: must be a valid email address",
    },
];

/// Check registration input, returning the first failing rule's message
pub fn new_user(username: &str, email: &str, password: &str) -> Result<()> {
    for rule in RULES {
        let value = match rule.field {
            Field::Username => username,
            Field::Email => email,
            Field::Password => password,
        };
        if !(rule.check)(value) {
            return Err(Error::Validation(rule.message.to_string()));
        }
    }
    Ok(())
}
