//! PII sanitisation for outbound delegation text.
//!
//! The rule set is canonical and frozen: emails, international phone
//! numbers, SSNs, Luhn-valid card numbers, well-known API key prefixes,
//! and long high-entropy runs. Sanitisation is idempotent (placeholders
//! never re-match any rule), and each field is capped before matching so
//! pathological inputs cannot blow the matching budget.

use regex::Regex;

/// Version stamp of the frozen rule set. Bump on any pattern change.
pub const RULES_VERSION: &str = "pii-rules/1";

/// Maximum characters of a field the matcher will look at. Anything past
/// the cap is dropped rather than forwarded unsanitised.
pub const MAX_FIELD_CHARS: usize = 10_000;

/// Replacement placeholders. None of these re-match any rule.
const EMAIL_TOKEN: &str = "<EMAIL>";
const PHONE_TOKEN: &str = "<PHONE>";
const SSN_TOKEN: &str = "<SSN>";
const CC_TOKEN: &str = "<CC>";
const API_KEY_TOKEN: &str = "<API_KEY>";
const SECRET_TOKEN: &str = "<SECRET>";

/// Compiled PII rule set.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    api_key: Regex,
    hex_run: Regex,
    base64_run: Regex,
    email: Regex,
    card: Regex,
    ssn: Regex,
    phone: Regex,
}

impl Sanitizer {
    pub fn new() -> Self {
        Self {
            // Common provider prefixes: OpenAI/Anthropic-style sk-, GitHub
            // tokens, Slack tokens.
            api_key: Regex::new(
                r"\b(?:sk-[A-Za-z0-9_-]{8,}|ghp_[A-Za-z0-9]{20,}|github_pat_[A-Za-z0-9_]{20,}|xox[baprs]-[A-Za-z0-9-]{10,})",
            )
            .expect("api key pattern"),
            hex_run: Regex::new(r"\b[A-Fa-f0-9]{32,}\b").expect("hex pattern"),
            base64_run: Regex::new(r"[A-Za-z0-9+/=_-]{40,}").expect("base64 pattern"),
            email: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                .expect("email pattern"),
            // 13-19 digits with optional single separators; validated by
            // Luhn before replacement.
            card: Regex::new(r"\b\d(?:[ -]?\d){12,18}\b").expect("card pattern"),
            ssn: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"),
            // International formats; a digit-count check in the replacer
            // keeps this from eating arbitrary numeric runs.
            phone: Regex::new(r"\+?\d[\d\-. ()/]{6,18}\d").expect("phone pattern"),
        }
    }

    /// Strip or tokenise PII in one field.
    pub fn sanitise(&self, input: &str) -> String {
        let capped: String = input.chars().take(MAX_FIELD_CHARS).collect();

        let mut out = self
            .api_key
            .replace_all(&capped, API_KEY_TOKEN)
            .to_string();
        out = self.hex_run.replace_all(&out, SECRET_TOKEN).to_string();
        out = self.base64_run.replace_all(&out, SECRET_TOKEN).to_string();
        out = self.email.replace_all(&out, EMAIL_TOKEN).to_string();
        out = self
            .card
            .replace_all(&out, |caps: &regex::Captures| {
                let m = &caps[0];
                if luhn_valid(m) {
                    CC_TOKEN.to_string()
                } else {
                    m.to_string()
                }
            })
            .to_string();
        out = self.ssn.replace_all(&out, SSN_TOKEN).to_string();
        out = self
            .phone
            .replace_all(&out, |caps: &regex::Captures| {
                let m = &caps[0];
                let digits = m.chars().filter(char::is_ascii_digit).count();
                if (8..=15).contains(&digits) {
                    PHONE_TOKEN.to_string()
                } else {
                    m.to_string()
                }
            })
            .to_string();

        out
    }

    /// True if the field contains anything a rule would rewrite.
    pub fn contains_pii(&self, input: &str) -> bool {
        self.sanitise(input) != input.chars().take(MAX_FIELD_CHARS).collect::<String>()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Luhn checksum over the digits of `s`, ignoring separators.
fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn() {
        assert!(luhn_valid("4111 1111 1111 1111"));
        assert!(luhn_valid("5500-0000-0000-0004"));
        assert!(!luhn_valid("4111 1111 1111 1112"));
        assert!(!luhn_valid("1234"));
    }

    #[test]
    fn test_scenario_phone_email_card() {
        let s = Sanitizer::new();
        let input = "Call +1-415-555-0198 and email user@example.com about card 4111 1111 1111 1111";
        let out = s.sanitise(input);
        assert_eq!(out, "Call <PHONE> and email <EMAIL> about card <CC>");
    }

    #[test]
    fn test_ssn() {
        let s = Sanitizer::new();
        assert_eq!(s.sanitise("ssn 078-05-1120 on file"), "ssn <SSN> on file");
    }

    #[test]
    fn test_api_keys() {
        let s = Sanitizer::new();
        let out = s.sanitise("key sk-abc123def456 and ghp_0123456789abcdefghij9 here");
        assert!(!out.contains("sk-abc123def456"));
        assert!(!out.contains("ghp_0123456789abcdefghij9"));
        assert!(out.contains("<API_KEY>"));
    }

    #[test]
    fn test_high_entropy_runs() {
        let s = Sanitizer::new();
        let hex = "deadbeefdeadbeefdeadbeefdeadbeef00";
        let out = s.sanitise(&format!("token {hex} end"));
        assert!(!out.contains(hex));
        assert!(out.contains("<SECRET>"));
    }

    #[test]
    fn test_idempotent() {
        let s = Sanitizer::new();
        let inputs = [
            "Call +1-415-555-0198 and email user@example.com about card 4111 1111 1111 1111",
            "ssn 078-05-1120, key sk-abc123def456",
            "nothing sensitive here",
        ];
        for input in inputs {
            let once = s.sanitise(input);
            let twice = s.sanitise(&once);
            assert_eq!(once, twice, "sanitise must be idempotent for {input:?}");
        }
    }

    #[test]
    fn test_non_luhn_digits_left_for_phone_rule() {
        let s = Sanitizer::new();
        // Not Luhn-valid, 10 digits: phone rule picks it up instead.
        let out = s.sanitise("call 415 555 0198 1");
        assert!(out.contains("<PHONE>"), "got {out}");
    }

    #[test]
    fn test_clean_text_untouched() {
        let s = Sanitizer::new();
        let input = "Summarise chapter 3 of the ops runbook";
        assert_eq!(s.sanitise(input), input);
        assert!(!s.contains_pii(input));
    }

    #[test]
    fn test_field_cap() {
        let s = Sanitizer::new();
        let long = "a".repeat(MAX_FIELD_CHARS + 500);
        assert_eq!(s.sanitise(&long).len(), MAX_FIELD_CHARS);
    }
}
