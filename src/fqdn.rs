//! Hostname canonicalization shared by the rule codec and the update handler.

use crate::error::Error;

/// Appends a trailing dot unless the string already has one or is a single
/// character (the root name shorthand).
pub fn fqdn(s: &str) -> String {
    if is_fqdn(s) {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

/// Strips exactly one trailing dot, if present.
pub fn un_fqdn(s: &str) -> String {
    s.strip_suffix('.').unwrap_or(s).to_string()
}

pub fn is_fqdn(s: &str) -> bool {
    s.len() > 1 && s.ends_with('.')
}

/// Splits on `.` and checks every label but an optional empty trailing one
/// is non-empty and made of `[A-Za-z0-9-]`, starting with `[A-Za-z0-9]`.
pub fn validate_hostname(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::parse("invalid hostname length: 0"));
    }

    let parts: Vec<&str> = name.split('.').collect();
    let last_part = parts.len() - 1;

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            if i == last_part {
                break;
            }
            return Err(Error::parse(format!("empty hostname part at index {i}")));
        }

        let bytes = part.as_bytes();
        if !is_valid_host_first_byte(bytes[0]) {
            return Err(Error::parse(format!(
                "invalid hostname part at index {i}: invalid char {:?} at index 0",
                bytes[0] as char
            )));
        }

        for (j, &b) in bytes[1..].iter().enumerate() {
            if !is_valid_host_byte(b) {
                return Err(Error::parse(format!(
                    "invalid hostname part at index {i}: invalid char {:?} at index {}",
                    b as char,
                    j + 1
                )));
            }
        }
    }

    Ok(())
}

fn is_valid_host_byte(b: u8) -> bool {
    b == b'-' || is_valid_host_first_byte(b)
}

fn is_valid_host_first_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_appends_dot() {
        assert_eq!(fqdn("ya.ru"), "ya.ru.");
        assert_eq!(fqdn("ya.ru."), "ya.ru.");
        assert_eq!(fqdn("."), ".");
        assert_eq!(fqdn("*"), "*");
    }

    #[test]
    fn un_fqdn_strips_one_dot() {
        assert_eq!(un_fqdn("ya.ru."), "ya.ru");
        assert_eq!(un_fqdn("ya.ru"), "ya.ru");
    }

    #[test]
    fn validate_hostname_accepts_trailing_empty_label() {
        assert!(validate_hostname("ya.ru.").is_ok());
        assert!(validate_hostname("ya.ru").is_ok());
        assert!(validate_hostname("a-1.b2.ru.").is_ok());
    }

    #[test]
    fn validate_hostname_rejects_interior_empty_label() {
        assert!(validate_hostname("ya..ru.").is_err());
    }

    #[test]
    fn validate_hostname_rejects_bad_first_char() {
        assert!(validate_hostname("-ya.ru.").is_err());
    }

    #[test]
    fn validate_hostname_accepts_hyphen_mid_label() {
        assert!(validate_hostname("k3s-pve.cc.").is_ok());
    }
}
