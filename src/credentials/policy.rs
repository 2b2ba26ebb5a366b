//! Strength rules for passwords and PINs.

use regex::Regex;
use std::sync::LazyLock;

const MIN_PASSWORD_LEN: usize = 12;
const MIN_PIN_LEN: usize = 3;
const MAX_PIN_LEN: usize = 12;
const MAX_USERNAME_LEN: usize = 64;

const SPECIAL_CHARACTERS: &str = "!@#$%^&*(),.?\":{}|<>";
const COMMON_PASSWORDS: [&str; 6] = ["password", "123456", "admin", "root", "qwerty", "letmein"];

static USERNAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._@-]*$"));

#[derive(Clone, Debug)]
pub struct PasswordPolicy {
    min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_PASSWORD_LEN,
        }
    }
}

impl PasswordPolicy {
    /// Check a candidate password, collecting every violated rule.
    ///
    /// # Errors
    /// Returns the human readable list of failed rules.
    pub fn validate(&self, password: &str) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();

        if password.chars().count() < self.min_length {
            reasons.push(format!(
                "must be at least {} characters long",
                self.min_length
            ));
        }
        if !password.chars().any(char::is_uppercase) {
            reasons.push("must contain an uppercase letter".to_string());
        }
        if !password.chars().any(char::is_lowercase) {
            reasons.push("must contain a lowercase letter".to_string());
        }
        if !password.chars().any(|c| c.is_ascii_digit()) {
            reasons.push("must contain a digit".to_string());
        }
        if !password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
            reasons.push("must contain a special character".to_string());
        }
        let lowered = password.to_lowercase();
        if COMMON_PASSWORDS.iter().any(|common| lowered == *common) {
            reasons.push("is too common".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

/// PINs are 3 to 12 ASCII digits.
///
/// # Errors
/// Returns the violated rule.
pub fn validate_pin(pin: &str) -> Result<(), Vec<String>> {
    let len = pin.len();
    if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&len) || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(vec![format!(
            "PIN must be {MIN_PIN_LEN} to {MAX_PIN_LEN} digits"
        )]);
    }
    Ok(())
}

/// Usernames are record keys and appear in audit lines, keep them plain.
///
/// # Errors
/// Returns the violated rule.
pub fn validate_username(username: &str) -> Result<(), Vec<String>> {
    let valid = username.len() <= MAX_USERNAME_LEN
        && USERNAME_RE
            .as_ref()
            .is_ok_and(|re| re.is_match(username));
    if valid {
        Ok(())
    } else {
        Err(vec![format!(
            "username must be 1 to {MAX_USERNAME_LEN} characters of letters, digits, '.', '_', '-' or '@'"
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strong_password_passes() {
        assert!(PasswordPolicy::default().validate("Tr0ub4dor&3xyz").is_ok());
    }

    #[test]
    fn weak_password_lists_every_rule() {
        let reasons = PasswordPolicy::default()
            .validate("short")
            .err()
            .unwrap_or_default();
        // length, uppercase, digit, special
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn common_passwords_are_rejected_case_insensitively() {
        let reasons = PasswordPolicy::default()
            .validate("LetMeIn")
            .err()
            .unwrap_or_default();
        assert!(reasons.iter().any(|r| r.contains("common")));
    }

    #[test]
    fn pin_rules() {
        assert!(validate_pin("000").is_ok());
        assert!(validate_pin("123456789012").is_ok());
        assert!(validate_pin("12").is_err());
        assert!(validate_pin("1234567890123").is_err());
        assert!(validate_pin("12a4").is_err());
        assert!(validate_pin("١٢٣").is_err());
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("alice.smith@corp").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("-alice").is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
    }
}
